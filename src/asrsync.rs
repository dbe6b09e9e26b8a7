//! Asynchronous rate synchronization.
//!
//! Streaming workers process audio far faster than real time. After every
//! encode or decode batch the worker hands the number of processed frames to
//! [RateSync::sync], which sleeps until the moment the playback clock has
//! caught up. Deadlines are computed from the stream origin rather than
//! incrementally, so wakeup jitter does not accumulate into drift.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Ten-thousandths of a second, the delay unit used across the daemon.
pub type Decimillis = i32;

/// Converts a duration to decimilliseconds, saturating.
pub fn duration_to_dms(d: Duration) -> Decimillis {
    (d.as_micros() / 100).min(Decimillis::MAX as u128) as Decimillis
}

/// Report returned by one [RateSync::sync] pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncReport {
    /// Time the worker spent processing since the previous sync.
    pub busy: Duration,
    /// Time slept waiting for the playback clock.
    pub slept: Duration,
    /// Wall time elapsed since the stream origin, in decimilliseconds.
    ///
    /// Used to seed the initial delay estimate after the first write.
    pub since_origin_dms: Decimillis,
}

/// Paces a worker to a nominal sample rate.
#[derive(Debug)]
pub struct RateSync {
    rate: u32,
    origin: Option<Instant>,
    frames: u64,
    last_return: Option<Instant>,
}

impl RateSync {
    /// Creates a pacer for the given sample rate in frames per second.
    pub fn new(rate: u32) -> Self {
        assert!(rate > 0, "sample rate must be non-zero");
        Self { rate, origin: None, frames: 0, last_return: None }
    }

    /// Nominal sample rate in frames per second.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Drops the clock anchor.
    ///
    /// The next [sync](Self::sync) re-anchors at the current instant; used
    /// at stream start and after an underrun.
    pub fn reset(&mut self) {
        self.origin = None;
        self.frames = 0;
        self.last_return = None;
    }

    /// Accounts for `frames` processed frames and sleeps until the playback
    /// clock reaches them.
    pub async fn sync(&mut self, frames: usize) -> SyncReport {
        let now = Instant::now();
        let origin = *self.origin.get_or_insert(now);
        let busy = match self.last_return {
            Some(last) => now.saturating_duration_since(last),
            None => Duration::ZERO,
        };

        self.frames += frames as u64;
        // deadline from origin, not from the previous wakeup
        let nominal = Duration::from_micros(self.frames * 1_000_000 / self.rate as u64);
        let deadline = origin + nominal;

        let slept = deadline.saturating_duration_since(now);
        if !slept.is_zero() {
            sleep_until(deadline).await;
        }

        let end = Instant::now();
        self.last_return = Some(end);
        SyncReport { busy, slept, since_origin_dms: duration_to_dms(end.saturating_duration_since(origin)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drift_is_bounded_by_one_quantum() {
        let mut rs = RateSync::new(48000);
        let start = Instant::now();
        // 10 batches of 480 frames = 100 ms of audio
        for _ in 0..10 {
            rs.sync(480).await;
        }
        let elapsed = Instant::now().saturating_duration_since(start);
        let nominal = Duration::from_millis(100);
        let quantum = Duration::from_millis(10);
        assert!(elapsed >= nominal, "woke early: {elapsed:?}");
        assert!(elapsed < nominal + quantum, "cumulative drift: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn busy_time_is_reported() {
        let mut rs = RateSync::new(16000);
        rs.sync(160).await;
        tokio::time::advance(Duration::from_millis(3)).await;
        let report = rs.sync(160).await;
        assert!(report.busy >= Duration::from_millis(3));
        assert!(report.busy < Duration::from_millis(4));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_reanchors_origin() {
        let mut rs = RateSync::new(8000);
        rs.sync(8000).await; // one full second
        rs.reset();
        let start = Instant::now();
        let report = rs.sync(80).await; // 10 ms after new origin
        let elapsed = Instant::now().saturating_duration_since(start);
        assert!(elapsed < Duration::from_millis(11));
        assert!(report.since_origin_dms <= 110);
    }

    #[tokio::test(start_paused = true)]
    async fn since_origin_tracks_stream_time() {
        let mut rs = RateSync::new(48000);
        rs.sync(480).await;
        let report = rs.sync(480).await;
        // 20 ms of audio = 200 decimilliseconds
        assert!(report.since_origin_dms >= 200);
        assert!(report.since_origin_dms <= 210);
    }

    #[test]
    fn dms_conversion() {
        assert_eq!(duration_to_dms(Duration::from_millis(1)), 10);
        assert_eq!(duration_to_dms(Duration::from_micros(150)), 1);
        assert_eq!(duration_to_dms(Duration::ZERO), 0);
    }
}
