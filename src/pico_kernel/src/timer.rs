//! Software timers.
//!
//! Timers hang off a singly linked list of armed timers. List mutation
//! happens inside the kernel lock; callback dispatch happens in the tick
//! handler *after* it leaves the critical section, so a callback may call
//! any kernel service that takes the lock itself — but must not assume
//! atomicity across multiple calls.
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    error::{
        CreateTimerError, DeleteTimerError, QueryObjectError, SetTimerPeriodError,
        StartTimerError,
    },
    id_from_index, klock, timeout,
    utils::Init,
    Id, KernelTraits, PortThreading, System, UTicks,
};

/// Identifies a software timer. See [`System::create_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) Id);

/// The most timer callbacks a single tick will ever dispatch, regardless of
/// configuration.
pub(crate) const MAX_FIRED_PER_TICK: usize = 16;

/// *Timer control block* — the state data of a software timer.
pub struct TimerCb<Traits: PortThreading> {
    /// Whether this pool slot is in use.
    pub(crate) slot: klock::CpuLockCell<Traits, bool>,

    name: klock::CpuLockCell<Traits, &'static str>,

    /// `true` iff the timer is armed (linked into the active list).
    running: klock::CpuLockCell<Traits, bool>,

    /// Latched when a one-shot timer fires; cleared by the next start.
    expired: klock::CpuLockCell<Traits, bool>,

    auto_reload: klock::CpuLockCell<Traits, bool>,

    period: klock::CpuLockCell<Traits, UTicks>,
    expiry: klock::CpuLockCell<Traits, UTicks>,

    callback: klock::CpuLockCell<Traits, Option<fn(usize)>>,
    param: klock::CpuLockCell<Traits, usize>,

    /// The next armed timer in the list headed by [`TimerGlobals::head`].
    next: klock::CpuLockCell<Traits, Option<&'static TimerCb<Traits>>>,
}

impl<Traits: PortThreading> Init for TimerCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        slot: klock::CpuLockCell::new(false),
        name: klock::CpuLockCell::new(""),
        running: klock::CpuLockCell::new(false),
        expired: klock::CpuLockCell::new(false),
        auto_reload: klock::CpuLockCell::new(false),
        period: klock::CpuLockCell::new(0),
        expiry: klock::CpuLockCell::new(0),
        callback: klock::CpuLockCell::new(None),
        param: klock::CpuLockCell::new(0),
        next: klock::CpuLockCell::new(None),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("running", &self.running)
            .field("period", &self.period)
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// The list of armed timers.
pub(crate) struct TimerGlobals<Traits: PortThreading> {
    head: klock::CpuLockCell<Traits, Option<&'static TimerCb<Traits>>>,
}

impl<Traits: PortThreading> Init for TimerGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        head: klock::CpuLockCell::new(None),
    };
}

fn live_timer_cb<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    id: TimerId,
) -> Result<&'static TimerCb<Traits>, crate::error::BadIdError> {
    let cb = Traits::get_timer_cb(id.0.get() - 1).ok_or(crate::error::BadIdError::BadId)?;
    if cb.slot.get(&*lock) {
        Ok(cb)
    } else {
        Err(crate::error::BadIdError::BadId)
    }
}

/// Link `cb` into the armed list. The list is unordered; expiry scanning
/// happens in the tick handler.
fn link<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static TimerCb<Traits>,
) {
    let head = Traits::state().timers().head.get(&*lock);
    cb.next.replace(&mut *lock, head);
    Traits::state().timers().head.replace(&mut *lock, Some(cb));
}

/// Unlink `cb` from the armed list, if present.
fn unlink<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static TimerCb<Traits>,
) {
    let globals = Traits::state().timers();
    let mut prev: Option<&'static TimerCb<Traits>> = None;
    let mut cur = globals.head.get(&*lock);
    while let Some(t) = cur {
        if core::ptr::eq(t, cb) {
            let next = t.next.replace(&mut *lock, None);
            match prev {
                Some(p) => {
                    p.next.replace(&mut *lock, next);
                }
                None => {
                    globals.head.replace(&mut *lock, next);
                }
            }
            return;
        }
        prev = Some(t);
        cur = t.next.get(&*lock);
    }
}

/// Gather the timers that have reached their expiry tick, up to the
/// per-tick callback budget; auto-reload timers are rearmed relative to
/// `now`, one-shot timers are disarmed with their `expired` latch set.
///
/// Returns the `(callback, param)` pairs to invoke once the critical
/// section has been left.
pub(crate) fn collect_expired<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    now: UTicks,
) -> ArrayVec<(fn(usize), usize), MAX_FIRED_PER_TICK> {
    let mut fired = ArrayVec::new();
    let budget = Traits::MAX_TIMERS_PER_TICK.min(MAX_FIRED_PER_TICK);

    let globals = Traits::state().timers();
    let mut prev: Option<&'static TimerCb<Traits>> = None;
    let mut cur = globals.head.get(&*lock);
    while let Some(t) = cur {
        if fired.len() >= budget {
            break;
        }
        let next = t.next.get(&*lock);

        if timeout::tick_reached(t.expiry.get(&*lock), now) {
            if let Some(callback) = t.callback.get(&*lock) {
                fired.push((callback, t.param.get(&*lock)));
            }

            if t.auto_reload.get(&*lock) {
                let period = t.period.get(&*lock);
                t.expiry.replace(&mut *lock, now.wrapping_add(period));
                prev = Some(t);
            } else {
                // Disarm: unlink in place
                t.next.replace(&mut *lock, None);
                match prev {
                    Some(p) => {
                        p.next.replace(&mut *lock, next);
                    }
                    None => {
                        globals.head.replace(&mut *lock, next);
                    }
                }
                t.running.replace(&mut *lock, false);
                t.expired.replace(&mut *lock, true);
            }
        } else {
            prev = Some(t);
        }

        cur = next;
    }

    fired
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a software timer. The timer is created stopped; arm it with
    /// [`System::start_timer`].
    ///
    /// `callback` runs in interrupt context (outside the kernel critical
    /// section) and must not block.
    pub fn create_timer(
        name: &'static str,
        callback: fn(usize),
        param: usize,
        period_ms: u32,
        auto_reload: bool,
    ) -> Result<TimerId, CreateTimerError> {
        crate::error::reported::<Traits, _, _>((|| {
            if period_ms == 0 {
                return Err(CreateTimerError::BadParam);
            }
            let mut lock = klock::lock_cpu::<Traits>()?;

            let (i, cb) = Traits::timer_cb_pool()
                .iter()
                .enumerate()
                .find(|(_, cb)| !cb.slot.get(&*lock))
                .ok_or(CreateTimerError::NoMemory)?;

            cb.slot.replace(&mut *lock, true);
            cb.name.replace(&mut *lock, name);
            cb.running.replace(&mut *lock, false);
            cb.expired.replace(&mut *lock, false);
            cb.auto_reload.replace(&mut *lock, auto_reload);
            cb.period
                .replace(&mut *lock, timeout::ticks_from_ms::<Traits>(period_ms));
            cb.callback.replace(&mut *lock, Some(callback));
            cb.param.replace(&mut *lock, param);
            cb.next.replace(&mut *lock, None);

            log::debug!("created timer {:?} ({} ms)", name, period_ms);
            Ok(TimerId(id_from_index(i)))
        })())
    }

    /// Arm (or re-arm) a timer: its expiry becomes "now + period".
    pub fn start_timer(id: TimerId) -> Result<(), StartTimerError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_timer_cb(lock.borrow_mut(), id)?;

            let now = timeout::tick_count_locked::<Traits>(lock.borrow_mut());
            let period = cb.period.get(&*lock);
            cb.expiry.replace(&mut *lock, now.wrapping_add(period));
            cb.expired.replace(&mut *lock, false);

            if !cb.running.replace(&mut *lock, true) {
                link(lock.borrow_mut(), cb);
            }
            Ok(())
        })())
    }

    /// Disarm a timer. Stopping a stopped timer is a no-op.
    pub fn stop_timer(id: TimerId) -> Result<(), StartTimerError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_timer_cb(lock.borrow_mut(), id)?;

            if cb.running.replace(&mut *lock, false) {
                unlink(lock.borrow_mut(), cb);
            }
            Ok(())
        })())
    }

    /// Re-arm a timer from now. Equivalent to [`System::start_timer`].
    pub fn reset_timer(id: TimerId) -> Result<(), StartTimerError> {
        Self::start_timer(id)
    }

    /// Change a timer's period. A running timer is re-armed so that the new
    /// period takes effect from now.
    pub fn set_timer_period(id: TimerId, period_ms: u32) -> Result<(), SetTimerPeriodError> {
        crate::error::reported::<Traits, _, _>((|| {
            if period_ms == 0 {
                return Err(SetTimerPeriodError::BadParam);
            }
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_timer_cb(lock.borrow_mut(), id)?;

            let period = timeout::ticks_from_ms::<Traits>(period_ms);
            cb.period.replace(&mut *lock, period);
            if cb.running.get(&*lock) {
                let now = timeout::tick_count_locked::<Traits>(lock.borrow_mut());
                cb.expiry.replace(&mut *lock, now.wrapping_add(period));
            }
            Ok(())
        })())
    }

    /// Delete a timer, disarming it first.
    pub fn delete_timer(id: TimerId) -> Result<(), DeleteTimerError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_timer_cb(lock.borrow_mut(), id)?;

            if cb.running.replace(&mut *lock, false) {
                unlink(lock.borrow_mut(), cb);
            }
            cb.callback.replace(&mut *lock, None);
            cb.slot.replace(&mut *lock, false);
            Ok(())
        })())
    }

    /// Whether a timer is currently armed.
    pub fn is_timer_running(id: TimerId) -> Result<bool, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_timer_cb(lock.borrow_mut(), id)?;
        Ok(cb.running.get(&*lock))
    }

    /// Whether a one-shot timer has fired since it was last started.
    pub fn timer_expired(id: TimerId) -> Result<bool, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_timer_cb(lock.borrow_mut(), id)?;
        Ok(cb.expired.get(&*lock))
    }

    /// Ticks until a timer fires next; 0 if it is not armed.
    pub fn timer_remaining_ticks(id: TimerId) -> Result<UTicks, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_timer_cb(lock.borrow_mut(), id)?;

        if !cb.running.get(&*lock) {
            return Ok(0);
        }
        let now = timeout::tick_count_locked::<Traits>(lock.borrow_mut());
        let expiry = cb.expiry.get(&*lock);
        if timeout::tick_reached(expiry, now) {
            Ok(0)
        } else {
            Ok(expiry.wrapping_sub(now))
        }
    }
}
