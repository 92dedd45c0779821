use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::warn;

/// Detects wall-clock manipulation by comparing against monotonic time
///
/// A user with clock-admin rights can move the wall clock backwards to dodge
/// day rollovers and schedule windows, but cannot touch the monotonic clock.
/// Any wall-clock regression relative to monotonic progress beyond the
/// threshold is therefore evidence of tampering.
pub struct TamperDetector {
    origin: Instant,
    threshold_secs: i64,
    last: Option<(DateTime<Utc>, Duration)>,
}

impl TamperDetector {
    /// Create a detector flagging backward jumps larger than `threshold_secs`
    pub fn new(threshold_secs: i64) -> Self {
        Self {
            origin: Instant::now(),
            threshold_secs,
            last: None,
        }
    }

    /// Check for a backward wall-clock jump since the previous call
    ///
    /// Returns `(tampered, message)`. The baseline slides forward on every
    /// call, so one tamper event is reported once, not on every subsequent
    /// check.
    pub fn check(&mut self) -> (bool, String) {
        self.check_at(Utc::now(), self.origin.elapsed())
    }

    fn check_at(&mut self, now_wall: DateTime<Utc>, now_mono: Duration) -> (bool, String) {
        let Some((last_wall, last_mono)) = self.last.replace((now_wall, now_mono)) else {
            return (false, "Initial check".to_string());
        };

        let mono_elapsed = now_mono.saturating_sub(last_mono);
        let expected = last_wall
            + chrono::Duration::from_std(mono_elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        let diff = (now_wall - expected).num_seconds();

        if diff < -self.threshold_secs {
            let jump_seconds = diff.abs();
            warn!(
                "Clock tamper detected: jumped backwards by {} seconds",
                jump_seconds
            );
            return (
                true,
                format!("Clock jumped backwards by {} seconds", jump_seconds),
            );
        }

        (false, "OK".to_string())
    }

    /// Forget the baseline; the next check records fresh readings
    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl Default for TamperDetector {
    fn default() -> Self {
        Self::new(60)
    }
}
