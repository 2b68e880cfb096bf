//! Progress throttling.
//!
//! Progress is reported in whole percent steps. A step is emitted only when it
//! moves past the last emitted one, so a 4 GiB transfer produces at most 100
//! updates no matter how small the chunks are.

/// Percent step `fraction` falls into, rounded up and clamped to `0..=100`.
fn percent_of(fraction: f64) -> u32 {
    if fraction.is_nan() || fraction <= 0.0 {
        return 0;
    }
    let percent = (fraction * 100.0).ceil();
    if percent >= 100.0 {
        100
    } else {
        percent as u32
    }
}

/// Decide whether `fraction` deserves a new progress update.
///
/// Returns the new percent step if it is strictly greater than
/// `previous_percent`.
pub fn should_emit(previous_percent: u32, fraction: f64) -> Option<u32> {
    let next = percent_of(fraction);
    (next > previous_percent).then_some(next)
}

/// Byte counter for one transfer, owned by whoever drives the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    total: u64,
    done: u64,
    last_percent: u32,
}

impl ProgressState {
    /// Start counting towards `total` bytes.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            done: 0,
            last_percent: 0,
        }
    }

    /// Bytes counted so far.
    pub fn done(&self) -> u64 {
        self.done
    }

    /// Last emitted percent step.
    pub fn last_percent(&self) -> u32 {
        self.last_percent
    }

    /// Count `bytes` more. Returns a fraction when an update is due.
    pub fn advance(&mut self, bytes: u64) -> Option<f64> {
        self.done = self.done.saturating_add(bytes);
        if self.total == 0 {
            return None;
        }
        let fraction = (self.done as f64 / self.total as f64).min(1.0);
        let percent = should_emit(self.last_percent, fraction)?;
        self.last_percent = percent;
        Some(fraction)
    }

    /// Force the final 100% step if it was not emitted yet.
    pub fn finish(&mut self) -> Option<f64> {
        if self.last_percent >= 100 {
            return None;
        }
        self.last_percent = 100;
        Some(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_emit_only_forward() {
        assert_eq!(should_emit(0, 0.0), None);
        assert_eq!(should_emit(0, 0.001), Some(1));
        assert_eq!(should_emit(1, 0.005), None);
        assert_eq!(should_emit(1, 0.011), Some(2));
        assert_eq!(should_emit(50, 0.4), None);
        assert_eq!(should_emit(99, 1.0), Some(100));
        assert_eq!(should_emit(100, 1.0), None);
    }

    #[test]
    fn test_should_emit_clamps() {
        assert_eq!(should_emit(0, 7.5), Some(100));
        assert_eq!(should_emit(0, -1.0), None);
        assert_eq!(should_emit(0, f64::NAN), None);
    }

    #[test]
    fn test_progress_state_throttles() {
        let mut state = ProgressState::new(10_000);
        let mut updates = 0;
        for _ in 0..10_000 {
            if state.advance(1).is_some() {
                updates += 1;
            }
        }
        assert_eq!(updates, 100);
        assert_eq!(state.done(), 10_000);
        assert_eq!(state.last_percent(), 100);
        assert_eq!(state.finish(), None);
    }

    #[test]
    fn test_finish_forces_final_step() {
        let mut state = ProgressState::new(0);
        assert_eq!(state.advance(0), None);
        assert_eq!(state.finish(), Some(1.0));
        assert_eq!(state.finish(), None);
    }
}
