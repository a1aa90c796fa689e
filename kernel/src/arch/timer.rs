//! Periodic timer source.
//!
//! Spec §6 calls for exactly one periodic source: something arms it with an
//! interval, its interrupt handler posts a `TIMER` event, and the scheduler
//! reacts to `TIMER`/`CLEANUP` on every trap return. This module owns the
//! tick counter and the millisecond clock derived from it; the concrete
//! per-board timer peripheral (System Timer on BCM2835/36, or generic
//! architected timer) is an external collaborator reached through
//! [`TimerSource`] rather than wired in here directly.

use core::sync::atomic::{AtomicU64, Ordering};

/// Ticks since boot, advanced once per timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Microseconds per tick; set once by [`set_tick_period_us`] during board
/// bring-up and read by every [`get_timestamp_ms`] call afterwards.
static TICK_PERIOD_US: AtomicU64 = AtomicU64::new(1000);

/// Record the configured tick period, in microseconds, for timestamp
/// conversion. Called once during board bring-up after the concrete timer
/// peripheral has been armed.
pub fn set_tick_period_us(period_us: u64) {
    TICK_PERIOD_US.store(period_us.max(1), Ordering::Release);
}

/// Advance the tick counter by one. Called from the timer IRQ handler before
/// it posts the `TIMER` event (spec §6 "its interrupt handler calls
/// `event.enqueue(TIMER, origin)`").
pub fn tick() -> u64 {
    TICKS.fetch_add(1, Ordering::AcqRel) + 1
}

/// Ticks elapsed since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Milliseconds elapsed since boot, derived from the tick counter and the
/// configured tick period. Used by the log service to timestamp entries.
pub fn get_timestamp_ms() -> u64 {
    let ticks = TICKS.load(Ordering::Acquire);
    let period_us = TICK_PERIOD_US.load(Ordering::Acquire);
    (ticks * period_us) / 1000
}

/// Contract a concrete timer peripheral driver must satisfy to supply the
/// kernel's single periodic source. Implemented outside this module by
/// board-specific code; the kernel core only ever calls through this trait.
pub trait TimerSource {
    /// Arm the peripheral to raise its interrupt every `interval_us`
    /// microseconds, starting now.
    fn arm(&mut self, interval_us: u64);

    /// Acknowledge the pending interrupt so the peripheral stops asserting
    /// it. Called from the IRQ handler before returning.
    fn acknowledge(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_scales_with_period() {
        set_tick_period_us(1000);
        let before = get_timestamp_ms();
        tick();
        tick();
        let after = get_timestamp_ms();
        assert_eq!(after - before, 2);
    }
}
