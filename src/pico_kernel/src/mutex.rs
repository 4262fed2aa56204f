//! Mutexes with priority inheritance.
//!
//! Inheritance is single-hop: a waiter whose effective priority exceeds the
//! owner's raises the owner (repositioning it in whichever list holds it),
//! but the boost is not propagated further down a chain of mutexes the
//! owner may itself be waiting on. The boost is reverted on the final
//! unlock, where the owner's effective priority is recomputed from its base
//! priority and the highest-priority waiter of every mutex it still holds.
use core::fmt;

use crate::{
    error::{
        CreateMutexError, DeleteMutexError, LockMutexError, QueryObjectError, UnlockMutexError,
        WaitError,
    },
    id_from_index, klock, task,
    task::{TaskCb, TaskId},
    timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue, WaitQueueStats},
    Id, KernelTraits, PortThreading, Priority, System, Timeout,
};

/// Identifies a mutex. See [`System::create_mutex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(pub(crate) Id);

/// *Mutex control block* — the state data of a mutex.
pub struct MutexCb<Traits: PortThreading> {
    /// Whether this pool slot is in use.
    pub(crate) slot: klock::CpuLockCell<Traits, bool>,

    /// The task that currently owns the mutex lock.
    pub(crate) owning_task: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// Recursive lock depth; `> 0` iff `owning_task` is `Some`.
    pub(crate) lock_count: klock::CpuLockCell<Traits, u32>,

    pub(crate) wait_queue: WaitQueue<Traits>,

    /// The next element in the singly linked list headed by
    /// [`TaskCb::last_mutex_held`], containing all mutexes currently held
    /// by the owning task.
    pub(crate) prev_mutex_held: klock::CpuLockCell<Traits, Option<&'static Self>>,
}

impl<Traits: PortThreading> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        slot: klock::CpuLockCell::new(false),
        owning_task: klock::CpuLockCell::new(None),
        lock_count: klock::CpuLockCell::new(0),
        wait_queue: WaitQueue::INIT,
        prev_mutex_held: klock::CpuLockCell::new(None),
    };
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("lock_count", &self.lock_count)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

fn live_mutex_cb<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    id: MutexId,
) -> Result<&'static MutexCb<Traits>, crate::error::BadIdError> {
    let cb = Traits::get_mutex_cb(id.0.get() - 1).ok_or(crate::error::BadIdError::BadId)?;
    if cb.slot.get(&*lock) {
        Ok(cb)
    } else {
        Err(crate::error::BadIdError::BadId)
    }
}

/// Give the ownership of the mutex to `task` and push the mutex onto the
/// task's held chain.
///
/// The task must be in the Running or Blocked state.
fn lock_core<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static MutexCb<Traits>,
    task: &'static TaskCb<Traits>,
) {
    debug_assert!(cb.owning_task.get(&*lock).is_none());

    cb.owning_task.replace(&mut *lock, Some(task));
    cb.lock_count.replace(&mut *lock, 1);

    let prev_mutex_held = task.last_mutex_held.replace(&mut *lock, Some(cb));
    cb.prev_mutex_held.replace(&mut *lock, prev_mutex_held);
}

/// Unlink `cb` from `task`'s held chain. Returns `false` if it wasn't
/// there.
fn remove_from_held_chain<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    cb: &'static MutexCb<Traits>,
) -> bool {
    let mut prev: Option<&'static MutexCb<Traits>> = None;
    let mut cur = task.last_mutex_held.get(&*lock);
    while let Some(m) = cur {
        if core::ptr::eq(m, cb) {
            let next = m.prev_mutex_held.replace(&mut *lock, None);
            match prev {
                Some(p) => {
                    p.prev_mutex_held.replace(&mut *lock, next);
                }
                None => {
                    task.last_mutex_held.replace(&mut *lock, next);
                }
            }
            return true;
        }
        prev = Some(m);
        cur = m.prev_mutex_held.get(&*lock);
    }
    false
}

/// Reevaluate the task's effective priority, assuming a base priority of
/// `base_priority`: the maximum of the base priority and the priority of
/// the highest waiter of every mutex the task holds. (This function doesn't
/// update [`TaskCb::effective_priority`].)
pub(crate) fn evaluate_task_effective_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    base_priority: Priority,
) -> Priority {
    let mut effective = base_priority;
    let mut maybe_mutex_cb = task.last_mutex_held.get(&*lock);

    while let Some(mutex_cb) = maybe_mutex_cb {
        if let Some(waiter) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
            effective = effective.max(waiter.effective_priority.get(&*lock));
        }
        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }

    effective
}

/// Wake up the next waiter of the mutex, transferring ownership to it; if
/// there is none, leave the mutex unowned.
///
/// This function doesn't restore the previous owner's effective priority.
///
/// This function may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
fn unlock_mutex_unchecked<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static MutexCb<Traits>,
) {
    cb.owning_task.replace(&mut *lock, None);
    cb.lock_count.replace(&mut *lock, 0);

    if let Some(next_task) = cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
        // Give the ownership of the mutex to `next_task`
        lock_core(lock.borrow_mut(), cb, next_task);

        // Wake up the next waiter
        assert!(cb.wait_queue.wake_up_one(lock.borrow_mut()));
    }
}

/// Release every mutex held by `task`, transferring each to its next
/// waiter. Used when a task terminates.
///
/// This function doesn't restore the task's effective priority.
///
/// This function may make tasks Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let mut maybe_mutex_cb = task.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex_cb) = maybe_mutex_cb {
        maybe_mutex_cb = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
        unlock_mutex_unchecked(lock.borrow_mut(), mutex_cb);
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a mutex.
    pub fn create_mutex() -> Result<MutexId, CreateMutexError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;

            let (i, cb) = Traits::mutex_cb_pool()
                .iter()
                .enumerate()
                .find(|(_, cb)| !cb.slot.get(&*lock))
                .ok_or(CreateMutexError::NoMemory)?;

            cb.slot.replace(&mut *lock, true);
            cb.owning_task.replace(&mut *lock, None);
            cb.lock_count.replace(&mut *lock, 0);
            cb.prev_mutex_held.replace(&mut *lock, None);

            Ok(MutexId(id_from_index(i)))
        })())
    }

    /// Acquire a mutex.
    ///
    /// Relocking by the owner is counted recursively. If the mutex is owned
    /// by a lower-priority task, that task inherits the caller's effective
    /// priority until it unlocks.
    pub fn lock_mutex(id: MutexId, timeout: Timeout) -> Result<(), LockMutexError> {
        crate::error::reported::<Traits, _, _>(lock_mutex_inner::<Traits>(id, timeout))
    }

    /// Equivalent to [`System::lock_mutex`] with [`Timeout::Immediate`].
    pub fn try_lock_mutex(id: MutexId) -> Result<(), LockMutexError> {
        Self::lock_mutex(id, Timeout::Immediate)
    }

    /// Release a mutex. Only the owning task may do this.
    pub fn unlock_mutex(id: MutexId) -> Result<(), UnlockMutexError> {
        crate::error::reported::<Traits, _, _>(unlock_mutex_inner::<Traits>(id))
    }

    /// Delete a mutex, waking all waiters with a `Deleted` disposition.
    pub fn delete_mutex(id: MutexId) -> Result<(), DeleteMutexError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_mutex_cb(lock.borrow_mut(), id)?;

            // Detach from the owner, restoring its priority
            if let Some(owner) = cb.owning_task.replace(&mut *lock, None) {
                remove_from_held_chain(lock.borrow_mut(), owner, cb);
                let base = owner.base_priority.get(&*lock);
                let effective =
                    evaluate_task_effective_priority(lock.borrow_mut(), owner, base);
                task::set_effective_priority(lock.borrow_mut(), owner, effective);
            }
            cb.lock_count.replace(&mut *lock, 0);

            cb.wait_queue
                .wake_up_all_with(lock.borrow_mut(), Err(WaitError::Deleted));

            cb.slot.replace(&mut *lock, false);
            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        })())
    }

    /// The task currently owning a mutex, if any.
    pub fn mutex_owner(id: MutexId) -> Result<Option<TaskId>, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_mutex_cb(lock.borrow_mut(), id)?;
        Ok(cb.owning_task.get(&*lock).map(task::task_id_of))
    }

    /// A mutex's recursive lock depth (0 = unowned).
    pub fn mutex_lock_count(id: MutexId) -> Result<u32, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_mutex_cb(lock.borrow_mut(), id)?;
        Ok(cb.lock_count.get(&*lock))
    }

    /// Occupancy counters of a mutex's wait queue.
    pub fn mutex_wait_stats(id: MutexId) -> Result<WaitQueueStats, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_mutex_cb(lock.borrow_mut(), id)?;
        Ok(cb.wait_queue.stats(lock.borrow_mut()))
    }
}

fn lock_mutex_inner<Traits: KernelTraits>(
    id: MutexId,
    timeout: Timeout,
) -> Result<(), LockMutexError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    match timeout {
        Timeout::Immediate => task::expect_task_context::<Traits>()?,
        _ => task::expect_waitable_context::<Traits>()?,
    }
    let cb = live_mutex_cb(lock.borrow_mut(), id)?;
    let running_task = task::current_task_cb(lock.borrow_mut());

    let owner = match cb.owning_task.get(&*lock) {
        None => {
            lock_core(lock.borrow_mut(), cb, running_task);
            return Ok(());
        }
        Some(owner) if core::ptr::eq(owner, running_task) => {
            // Recursive lock
            let count = cb.lock_count.get(&*lock);
            let count = count.checked_add(1).ok_or(LockMutexError::WouldOverflow)?;
            cb.lock_count.replace(&mut *lock, count);
            return Ok(());
        }
        Some(owner) => owner,
    };

    if timeout == Timeout::Immediate {
        return Err(LockMutexError::Timeout);
    }

    // Single-hop priority inheritance: raise the owner to the caller's
    // effective priority. If the owner is itself blocked on another mutex
    // its wait-queue position is re-sorted, but the boost is not chained
    // any further.
    let my_priority = running_task.effective_priority.get(&*lock);
    if my_priority > owner.effective_priority.get(&*lock) {
        log::trace!(
            "boosting {:?} to priority {} for {:?}",
            owner.name(),
            my_priority,
            running_task.name()
        );
        task::set_effective_priority(lock.borrow_mut(), owner, my_priority);
    }

    // The unlocker transfers the ownership to us before waking us up
    match timeout {
        Timeout::Forever => {
            cb.wait_queue
                .wait(lock.borrow_mut(), WaitPayload::Mutex(cb))?;
        }
        Timeout::Ms(ms) => {
            cb.wait_queue.wait_timeout(
                lock.borrow_mut(),
                WaitPayload::Mutex(cb),
                timeout::ticks_from_ms::<Traits>(ms),
            )?;
        }
        Timeout::Immediate => unreachable!(),
    }

    debug_assert!(cb
        .owning_task
        .get(&*lock)
        .map_or(false, |t| core::ptr::eq(t, running_task)));

    Ok(())
}

fn unlock_mutex_inner<Traits: KernelTraits>(id: MutexId) -> Result<(), UnlockMutexError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    task::expect_task_context::<Traits>()?;
    let cb = live_mutex_cb(lock.borrow_mut(), id)?;
    let running_task = task::current_task_cb(lock.borrow_mut());

    match cb.owning_task.get(&*lock) {
        Some(owner) if core::ptr::eq(owner, running_task) => {}
        _ => return Err(UnlockMutexError::NotOwner),
    }

    let count = cb.lock_count.get(&*lock);
    if count > 1 {
        cb.lock_count.replace(&mut *lock, count - 1);
        return Ok(());
    }

    // Final release: detach, revert any inheritance boost, then hand the
    // mutex to the highest-priority waiter
    remove_from_held_chain(lock.borrow_mut(), running_task, cb);

    let base = running_task.base_priority.get(&*lock);
    let effective = evaluate_task_effective_priority(lock.borrow_mut(), running_task, base);
    task::set_effective_priority(lock.borrow_mut(), running_task, effective);

    unlock_mutex_unchecked(lock.borrow_mut(), cb);

    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}
