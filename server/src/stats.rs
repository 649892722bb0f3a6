//! Bandwidth and packet processing diagnostics.
//!
//! Byte counts are tallied per datagram into the current window. Once per
//! window [`BandwidthSampler::roll_window`] sums and clears the tallies and
//! publishes the totals as the latest per-second gauges. Processing times
//! accumulate for the lifetime of the server.
//!
//! The sampler has its own lock and is never held together with the session
//! registry lock.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Point-in-time diagnostics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthStats {
    /// Bytes received during the last completed window
    pub bytes_per_second_down: u64,
    /// Bytes sent during the last completed window
    pub bytes_per_second_up: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    /// Datagrams handed to the protocol, malformed ones included
    pub packets_processed: u64,
    /// Mean time from dequeue to protocol completion over all packets
    pub average_processing_time: Duration,
}

#[derive(Default)]
struct SamplerState {
    window_down: Vec<usize>,
    window_up: Vec<usize>,
    bytes_per_second_down: u64,
    bytes_per_second_up: u64,
    packets_received: u64,
    packets_sent: u64,
    packets_processed: u64,
    total_processing_time: Duration,
}

#[derive(Default)]
pub struct BandwidthSampler {
    state: Mutex<SamplerState>,
}

impl BandwidthSampler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SamplerState> {
        // Counters stay meaningful even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_received(&self, bytes: usize) {
        let mut state = self.lock();
        state.window_down.push(bytes);
        state.packets_received += 1;
    }

    pub fn record_sent(&self, bytes: usize) {
        let mut state = self.lock();
        state.window_up.push(bytes);
        state.packets_sent += 1;
    }

    pub fn record_processing(&self, elapsed: Duration) {
        let mut state = self.lock();
        state.packets_processed += 1;
        state.total_processing_time += elapsed;
    }

    /// Closes the current window and publishes its totals.
    pub fn roll_window(&self) {
        let mut state = self.lock();
        let down: usize = state.window_down.drain(..).sum();
        let up: usize = state.window_up.drain(..).sum();
        state.bytes_per_second_down = down as u64;
        state.bytes_per_second_up = up as u64;
    }

    pub fn snapshot(&self) -> BandwidthStats {
        let state = self.lock();
        let average_processing_time = match state.packets_processed {
            0 => Duration::ZERO,
            count => state.total_processing_time / count.min(u32::MAX as u64) as u32,
        };

        BandwidthStats {
            bytes_per_second_down: state.bytes_per_second_down,
            bytes_per_second_up: state.bytes_per_second_up,
            packets_received: state.packets_received,
            packets_sent: state.packets_sent,
            packets_processed: state.packets_processed,
            average_processing_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_sampler() {
        let sampler = BandwidthSampler::new();
        assert_eq!(sampler.snapshot(), BandwidthStats::default());
    }

    #[test]
    fn test_gauges_only_change_when_window_rolls() {
        let sampler = BandwidthSampler::new();
        sampler.record_received(100);
        sampler.record_received(28);
        sampler.record_sent(64);

        let before = sampler.snapshot();
        assert_eq!(before.bytes_per_second_down, 0);
        assert_eq!(before.packets_received, 2);
        assert_eq!(before.packets_sent, 1);

        sampler.roll_window();
        let after = sampler.snapshot();
        assert_eq!(after.bytes_per_second_down, 128);
        assert_eq!(after.bytes_per_second_up, 64);
    }

    #[test]
    fn test_window_resets_after_roll() {
        let sampler = BandwidthSampler::new();
        sampler.record_received(500);
        sampler.roll_window();
        sampler.record_received(20);
        sampler.roll_window();

        let stats = sampler.snapshot();
        assert_eq!(stats.bytes_per_second_down, 20);
        assert_eq!(stats.bytes_per_second_up, 0);
        assert_eq!(stats.packets_received, 2);

        sampler.roll_window();
        assert_eq!(sampler.snapshot().bytes_per_second_down, 0);
    }

    #[test]
    fn test_average_processing_time_is_all_time() {
        let sampler = BandwidthSampler::new();
        sampler.record_processing(Duration::from_micros(100));
        sampler.record_processing(Duration::from_micros(300));
        sampler.roll_window();
        sampler.record_processing(Duration::from_micros(200));

        let stats = sampler.snapshot();
        assert_eq!(stats.packets_processed, 3);
        assert_eq!(stats.average_processing_time, Duration::from_micros(200));
    }

    #[test]
    fn test_concurrent_recording() {
        let sampler = Arc::new(BandwidthSampler::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sampler = Arc::clone(&sampler);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        sampler.record_received(10);
                        sampler.record_sent(5);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        sampler.roll_window();

        let stats = sampler.snapshot();
        assert_eq!(stats.packets_received, 4_000);
        assert_eq!(stats.bytes_per_second_down, 40_000);
        assert_eq!(stats.bytes_per_second_up, 20_000);
    }
}
