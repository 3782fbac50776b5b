use std::{
    thread,
    time::{Duration, Instant},
};

const THREAD_FALLBACK_PARALLELISM: usize = 2;
const MAX_LEAF_WORKERS: usize = 12;
const MAX_BUDGET_SECS: f64 = 1e9;

/// Wall-clock cut-off for a phase or unit of work. Checked cooperatively.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    end: Instant,
}

impl Deadline {
    pub(crate) fn after_secs(secs: f64) -> Self {
        Self {
            end: Instant::now() + secs_to_duration(secs),
        }
    }

    /// A deadline that has already passed. Kernels treat it as "do nothing".
    #[cfg(test)]
    pub(crate) fn expired_now() -> Self {
        Self::after_secs(0.0)
    }

    #[inline]
    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    pub(crate) fn remaining(&self) -> f64 {
        self.end
            .saturating_duration_since(Instant::now())
            .as_secs_f64()
    }

    /// A child deadline `secs` from now, never later than `self`.
    pub(crate) fn sub(&self, secs: f64) -> Self {
        let end = (Instant::now() + secs_to_duration(secs)).min(self.end);
        Self { end }
    }

    /// A child deadline covering `fraction` of what is left.
    pub(crate) fn fraction(&self, fraction: f64) -> Self {
        self.sub(self.remaining() * fraction.clamp(0.0, 1.0))
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs.min(MAX_BUDGET_SECS))
    } else {
        Duration::ZERO
    }
}

/// Leaf pool size: `requested`, or `min(cpus, 12)` when it is 0.
pub(crate) fn worker_count(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(THREAD_FALLBACK_PARALLELISM)
        .clamp(1, MAX_LEAF_WORKERS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_invalid_budgets_expire_immediately() {
        assert!(Deadline::after_secs(0.0).expired());
        assert!(Deadline::after_secs(-3.0).expired());
        assert!(Deadline::after_secs(f64::NAN).expired());
        assert_eq!(Deadline::expired_now().remaining(), 0.0);
    }

    #[test]
    fn sub_deadline_never_outlives_parent() {
        let parent = Deadline::after_secs(0.5);
        let child = parent.sub(100.0);
        assert!(child.remaining() <= parent.remaining() + 1e-6);
        assert!(!child.expired());
    }

    #[test]
    fn fraction_scales_remaining_time() {
        let parent = Deadline::after_secs(10.0);
        let half = parent.fraction(0.5);
        assert!(half.remaining() <= 5.0 + 1e-3);
        assert!(half.remaining() > 4.0);
    }

    #[test]
    fn worker_count_respects_explicit_request() {
        assert_eq!(worker_count(3), 3);
        let auto = worker_count(0);
        assert!((1..=MAX_LEAF_WORKERS).contains(&auto));
    }
}
