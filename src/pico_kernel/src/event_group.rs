//! Event groups: a 32-bit event word with wait-any/wait-all semantics and
//! optional clear-on-exit.
use bitflags::bitflags;
use core::{cell::Cell, fmt};

use crate::{
    error::{
        CreateEventGroupError, DeleteEventGroupError, QueryObjectError, UpdateEventGroupError,
        WaitEventGroupError, WaitError,
    },
    id_from_index, klock, task, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue, WaitQueueStats},
    Id, KernelTraits, PortThreading, System, Timeout,
};

/// Identifies an event group. See [`System::create_event_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventGroupId(pub(crate) Id);

/// The event word: up to 32 independent events.
pub type EventBits = u32;

bitflags! {
    /// Options for [`System::wait_bits`].
    pub struct EventWaitFlags: u8 {
        /// Wake only when *all* the requested bits are set (the default is
        /// *any*).
        const ALL = 1 << 0;
        /// Atomically clear the requested bits from the event word at the
        /// moment of wake-up.
        const CLEAR = 1 << 1;
    }
}

/// *Event group control block* — the state data of an event group.
pub struct EventGroupCb<Traits: PortThreading> {
    /// Whether this pool slot is in use.
    pub(crate) slot: klock::CpuLockCell<Traits, bool>,

    pub(crate) bits: klock::CpuLockCell<Traits, EventBits>,

    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for EventGroupCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        slot: klock::CpuLockCell::new(false),
        bits: klock::CpuLockCell::new(0),
        wait_queue: WaitQueue::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for EventGroupCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventGroupCb")
            .field("self", &(self as *const _))
            .field("bits", &self.bits)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

fn live_event_group_cb<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    id: EventGroupId,
) -> Result<&'static EventGroupCb<Traits>, crate::error::BadIdError> {
    let cb = Traits::get_event_group_cb(id.0.get() - 1).ok_or(crate::error::BadIdError::BadId)?;
    if cb.slot.get(&*lock) {
        Ok(cb)
    } else {
        Err(crate::error::BadIdError::BadId)
    }
}

/// Given a wait condition `(bits, flags)`, check if the current state of
/// the event word satisfies it.
///
/// On success, clears the requested bits from `event_bits` (if asked by
/// `flags`) and returns the word's value *prior* to the clear.
fn poll_core(event_bits: &mut EventBits, bits: EventBits, flags: EventWaitFlags) -> Option<EventBits> {
    let satisfied = if flags.contains(EventWaitFlags::ALL) {
        (*event_bits & bits) == bits
    } else {
        (*event_bits & bits) != 0
    };

    if satisfied {
        let original = *event_bits;
        if flags.contains(EventWaitFlags::CLEAR) {
            *event_bits &= !bits;
        }
        Some(original)
    } else {
        None
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create an event group with all bits clear.
    pub fn create_event_group() -> Result<EventGroupId, CreateEventGroupError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;

            let (i, cb) = Traits::event_group_cb_pool()
                .iter()
                .enumerate()
                .find(|(_, cb)| !cb.slot.get(&*lock))
                .ok_or(CreateEventGroupError::NoMemory)?;

            cb.slot.replace(&mut *lock, true);
            cb.bits.replace(&mut *lock, 0);

            Ok(EventGroupId(id_from_index(i)))
        })())
    }

    /// OR `bits` into the event word and wake every waiter whose condition
    /// is now satisfied, in priority order. Waiters that requested
    /// clear-on-exit atomically consume their requested bits at the moment
    /// of wake-up.
    ///
    /// May be called from interrupt context.
    pub fn set_bits(id: EventGroupId, bits: EventBits) -> Result<(), UpdateEventGroupError> {
        crate::error::reported::<Traits, _, _>(set_bits_inner::<Traits>(id, bits))
    }

    /// AND-NOT `bits` out of the event word. Never wakes anyone.
    pub fn clear_bits(id: EventGroupId, bits: EventBits) -> Result<(), UpdateEventGroupError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_event_group_cb(lock.borrow_mut(), id)?;
            cb.bits.replace_with(&mut *lock, |b| *b & !bits);
            Ok(())
        })())
    }

    /// The current event word.
    pub fn get_bits(id: EventGroupId) -> Result<EventBits, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_event_group_cb(lock.borrow_mut(), id)?;
        Ok(cb.bits.get(&*lock))
    }

    /// Wait until the event word satisfies `(bits, flags)`; returns a
    /// snapshot of the word taken before any clear-on-exit.
    pub fn wait_bits(
        id: EventGroupId,
        bits: EventBits,
        flags: EventWaitFlags,
        timeout: Timeout,
    ) -> Result<EventBits, WaitEventGroupError> {
        crate::error::reported::<Traits, _, _>(wait_bits_inner::<Traits>(id, bits, flags, timeout))
    }

    /// Occupancy counters of the event group's wait queue.
    pub fn event_group_wait_stats(id: EventGroupId) -> Result<WaitQueueStats, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_event_group_cb(lock.borrow_mut(), id)?;
        Ok(cb.wait_queue.stats(lock.borrow_mut()))
    }

    /// Delete an event group, waking all waiters with a `Deleted`
    /// disposition.
    pub fn delete_event_group(id: EventGroupId) -> Result<(), DeleteEventGroupError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_event_group_cb(lock.borrow_mut(), id)?;

            cb.wait_queue
                .wake_up_all_with(lock.borrow_mut(), Err(WaitError::Deleted));
            cb.slot.replace(&mut *lock, false);

            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        })())
    }
}

fn set_bits_inner<Traits: KernelTraits>(
    id: EventGroupId,
    added_bits: EventBits,
) -> Result<(), UpdateEventGroupError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = live_event_group_cb(lock.borrow_mut(), id)?;

    let mut event_bits = cb.bits.get(&*lock) | added_bits;

    // Wake up tasks whose conditions are now fulfilled. A waiter that
    // requested clear-on-exit consumes its bits from `event_bits` inside
    // `poll_core`, which can unfulfill later (lower-priority) waiters.
    cb.wait_queue
        .wake_up_all_conditional(lock.borrow_mut(), |wait_payload, lock| match wait_payload {
            WaitPayload::EventBits {
                bits,
                flags,
                orig_bits,
            } => {
                if let Some(original) = poll_core(&mut event_bits, *bits, *flags) {
                    orig_bits.read(&*lock).set(original);
                    true
                } else {
                    false
                }
            }
            _ => unreachable!(),
        });

    cb.bits.replace(&mut *lock, event_bits);

    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

fn wait_bits_inner<Traits: KernelTraits>(
    id: EventGroupId,
    bits: EventBits,
    flags: EventWaitFlags,
    timeout: Timeout,
) -> Result<EventBits, WaitEventGroupError> {
    if bits == 0 {
        return Err(WaitEventGroupError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != Timeout::Immediate {
        task::expect_waitable_context::<Traits>()?;
    }
    let cb = live_event_group_cb(lock.borrow_mut(), id)?;

    if let Some(original) = poll_core(cb.bits.write(&mut *lock), bits, flags) {
        return Ok(original);
    }

    let payload = WaitPayload::EventBits {
        bits,
        flags,
        orig_bits: klock::CpuLockCell::new(Cell::new(0)),
    };

    let result = match timeout {
        Timeout::Immediate => return Err(WaitEventGroupError::Empty),
        Timeout::Forever => cb.wait_queue.wait(lock.borrow_mut(), payload)?,
        Timeout::Ms(ms) => cb.wait_queue.wait_timeout(
            lock.borrow_mut(),
            payload,
            timeout::ticks_from_ms::<Traits>(ms),
        )?,
    };

    // The pre-clear snapshot was stored by the waker
    if let WaitPayload::EventBits { orig_bits, .. } = result {
        Ok(orig_bits.read(&*lock).get())
    } else {
        unreachable!()
    }
}
