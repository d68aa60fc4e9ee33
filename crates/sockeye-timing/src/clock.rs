use once_cell::sync::OnceCell;

static GLOBAL_CLOCK: OnceCell<quanta::Clock> = OnceCell::new();

/// Process-wide monotonic clock. Calibrated once on first use; every
/// `Nanos::now()` in the workspace reads through it.
#[inline]
pub fn global_clock() -> &'static quanta::Clock {
    GLOBAL_CLOCK.get_or_init(quanta::Clock::new)
}

/// Current monotonic time in nanoseconds since clock calibration.
#[inline]
pub(crate) fn monotonic_nanos() -> u64 {
    let clock = global_clock();
    clock.delta_as_nanos(0, clock.raw())
}
