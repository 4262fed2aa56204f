//! The kernel time base: the monotonic tick counter, timed-wait expiry, and
//! the tick handler.
//!
//! Ticks are unsigned and wrap around. All deadline comparisons go through
//! a signed difference ([`tick_reached`]) so that a delay scheduled shortly
//! before the wrap expires correctly shortly after it.
use crate::{
    error::WaitError,
    klock, smp, task,
    task::TaskSt,
    timer,
    utils::Init,
    wait, KernelTraits, UTicks,
};

/// How long a blocking service may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not block; fail immediately if the operation cannot complete.
    Immediate,
    /// Block for at most this many milliseconds.
    Ms(u32),
    /// Block until the operation completes or the object is deleted.
    Forever,
}

/// Kernel-global time-keeping state.
pub(crate) struct TimeoutGlobals<Traits> {
    /// The monotonic tick counter, incremented by [`handle_tick`].
    tick_count: klock::CpuLockCell<Traits, UTicks>,

    /// The platform microsecond counter's value at boot.
    origin_us: klock::CpuLockCell<Traits, u64>,
}

impl<Traits> Init for TimeoutGlobals<Traits> {
    const INIT: Self = Self {
        tick_count: klock::CpuLockCell::new(0),
        origin_us: klock::CpuLockCell::new(0),
    };
}

impl<Traits: KernelTraits> TimeoutGlobals<Traits> {
    pub(crate) fn tick_count_for(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> UTicks {
        self.tick_count.get(&*lock)
    }
}

/// Capture the microsecond origin. Called once during boot.
pub(crate) fn init_timebase<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let now = Traits::microsecond_now();
    Traits::state()
        .timeouts()
        .origin_us
        .replace(&mut *lock, now);
}

/// `true` iff `deadline` is at or before `now`, honoring wrap-around.
#[inline]
pub(crate) fn tick_reached(deadline: UTicks, now: UTicks) -> bool {
    now.wrapping_sub(deadline) as i32 >= 0
}

/// Convert a millisecond duration to ticks, rounding up so a bounded wait
/// never expires early.
#[inline]
pub(crate) fn ticks_from_ms<Traits: KernelTraits>(ms: u32) -> UTicks {
    ticks_from_ms_hz(ms, Traits::TICK_RATE_HZ)
}

#[inline]
fn ticks_from_ms_hz(ms: u32, hz: u32) -> UTicks {
    ((ms as u64 * hz as u64 + 999) / 1000) as UTicks
}

/// The current tick count (acquires the kernel lock).
pub(crate) fn tick_count<Traits: KernelTraits>() -> UTicks {
    match klock::lock_cpu::<Traits>() {
        Ok(mut lock) => Traits::state().timeouts().tick_count_for(lock.borrow_mut()),
        // Read from within a critical section: the caller already
        // serializes against the tick handler
        Err(_) => {
            // Safety: The kernel lock is held by the current context
            let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
            let mut lock = core::mem::ManuallyDrop::new(lock);
            Traits::state().timeouts().tick_count_for(lock.borrow_mut())
        }
    }
}

/// The current tick count, with the kernel lock already held.
pub(crate) fn tick_count_locked<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> UTicks {
    Traits::state().timeouts().tick_count_for(lock)
}

/// Microseconds since boot.
pub(crate) fn uptime_us<Traits: KernelTraits>() -> u64 {
    let origin = match klock::lock_cpu::<Traits>() {
        Ok(mut lock) => Traits::state().timeouts().origin_us.get(&*lock.borrow_mut()),
        Err(_) => 0,
    };
    Traits::microsecond_now().wrapping_sub(origin)
}

/// The tick handler.
///
/// 1. Advance the monotonic tick.
/// 2. Wake every Blocked task whose bounded wait has expired, with a
///    "timed out" disposition.
/// 3. Collect the expired software timers (at most
///    `MAX_TIMERS_PER_TICK`; the rest fire next tick), rearming the
///    auto-reload ones.
/// 4. Per-core load sampling and, at the balance interval, the
///    load-balance pass.
/// 5. Round-robin rotation among equal-priority tasks.
/// 6. Leave the critical section, invoke the timer callbacks, re-enter,
///    and request a context switch if one is due.
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The tick source never fires inside a critical section
    let mut lock = klock::lock_cpu::<Traits>().unwrap_or_else(|_| unreachable!());

    let globals = Traits::state().timeouts();
    let now = globals.tick_count.get(&*lock).wrapping_add(1);
    globals.tick_count.replace(&mut *lock, now);

    // Wake delay-expired and timeout-expired tasks
    for cb in Traits::task_cb_pool() {
        if *cb.st.read(&*lock) != TaskSt::Blocked {
            continue;
        }
        let Some(deadline) = cb.wait.deadline.get(&*lock) else {
            continue;
        };
        if tick_reached(deadline, now) {
            // The task is Blocked, so this cannot fail
            wait::interrupt_task(lock.borrow_mut(), cb, Err(WaitError::Timeout)).unwrap();
        }
    }

    // Collect expired timers; callbacks run after the critical section
    let fired = timer::collect_expired(lock.borrow_mut(), now);

    smp::on_tick::<Traits>(lock.borrow_mut(), now);

    // Round-robin: if the running task has an equal-priority Ready peer,
    // rotate it to the back of its level
    let core = Traits::current_core();
    if let Some(running) = Traits::state().running_task(lock.borrow_mut(), core) {
        if *running.st.read(&*lock) == TaskSt::Running {
            let pri = running.effective_priority.get(&*lock);
            let rotate = Traits::state()
                .ready_queue()
                .highest_ready_priority(lock.borrow_mut(), core)
                .map_or(false, |h| h >= pri);
            if rotate {
                // Safety: The previous state is Running, so the task is
                // not queued
                unsafe { task::make_ready(lock.borrow_mut(), running) };
            }
        }
    }

    drop(lock);

    // Timer callbacks run outside the critical section so they can use any
    // kernel service that takes the lock itself
    for (callback, param) in &fired {
        callback(*param);
    }

    let lock = klock::lock_cpu::<Traits>().unwrap_or_else(|_| unreachable!());
    task::unlock_cpu_and_check_preemption(lock);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_ordering_is_wrap_safe() {
        assert!(tick_reached(10, 10));
        assert!(tick_reached(10, 11));
        assert!(!tick_reached(11, 10));

        // A delay armed 10 ticks before the wrap expires 10 ticks after it
        let start = UTicks::MAX - 9;
        let deadline = start.wrapping_add(20);
        assert_eq!(deadline, 10);
        assert!(!tick_reached(deadline, start));
        assert!(!tick_reached(deadline, UTicks::MAX));
        assert!(!tick_reached(deadline, 9));
        assert!(tick_reached(deadline, 10));
        assert!(tick_reached(deadline, 11));
    }

    #[test]
    fn ms_conversion_rounds_up() {
        assert_eq!(ticks_from_ms_hz(0, 1000), 0);
        assert_eq!(ticks_from_ms_hz(5, 1000), 5);
        assert_eq!(ticks_from_ms_hz(1, 100), 1);
        assert_eq!(ticks_from_ms_hz(10, 100), 1);
        assert_eq!(ticks_from_ms_hz(11, 100), 2);
        assert_eq!(ticks_from_ms_hz(3, 250), 1);
    }
}
