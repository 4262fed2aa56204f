//! Counting semaphores.
use core::fmt;

use crate::{
    error::{
        CreateSemaphoreError, DeleteSemaphoreError, GiveSemaphoreError, QueryObjectError,
        TakeSemaphoreError, WaitError,
    },
    id_from_index, klock, task, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue, WaitQueueStats},
    Id, KernelTraits, PortThreading, System, Timeout,
};

/// Identifies a counting semaphore. See [`System::create_semaphore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(pub(crate) Id);

/// *Semaphore control block* — the state data of a semaphore.
pub struct SemaphoreCb<Traits: PortThreading> {
    /// Whether this pool slot is in use.
    pub(crate) slot: klock::CpuLockCell<Traits, bool>,

    pub(crate) count: klock::CpuLockCell<Traits, u32>,
    pub(crate) max_count: klock::CpuLockCell<Traits, u32>,

    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for SemaphoreCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        slot: klock::CpuLockCell::new(false),
        count: klock::CpuLockCell::new(0),
        max_count: klock::CpuLockCell::new(0),
        wait_queue: WaitQueue::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .field("max_count", &self.max_count)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

fn live_semaphore_cb<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    id: SemaphoreId,
) -> Result<&'static SemaphoreCb<Traits>, crate::error::BadIdError> {
    let cb = Traits::get_semaphore_cb(id.0.get() - 1).ok_or(crate::error::BadIdError::BadId)?;
    if cb.slot.get(&*lock) {
        Ok(cb)
    } else {
        Err(crate::error::BadIdError::BadId)
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a counting semaphore with the given initial and maximum
    /// counts.
    pub fn create_semaphore(
        initial_count: u32,
        max_count: u32,
    ) -> Result<SemaphoreId, CreateSemaphoreError> {
        crate::error::reported::<Traits, _, _>((|| {
            if max_count == 0 || initial_count > max_count {
                return Err(CreateSemaphoreError::BadParam);
            }
            let mut lock = klock::lock_cpu::<Traits>()?;

            let (i, cb) = Traits::semaphore_cb_pool()
                .iter()
                .enumerate()
                .find(|(_, cb)| !cb.slot.get(&*lock))
                .ok_or(CreateSemaphoreError::NoMemory)?;

            cb.slot.replace(&mut *lock, true);
            cb.count.replace(&mut *lock, initial_count);
            cb.max_count.replace(&mut *lock, max_count);

            Ok(SemaphoreId(id_from_index(i)))
        })())
    }

    /// Take one token, blocking for up to `timeout` if none is available.
    pub fn take_semaphore(id: SemaphoreId, timeout: Timeout) -> Result<(), TakeSemaphoreError> {
        crate::error::reported::<Traits, _, _>(take_inner::<Traits>(id, timeout))
    }

    /// Release one token. If a task is waiting, the token is handed
    /// directly to the highest-priority waiter (the count is unchanged);
    /// otherwise the count is incremented, saturating at the maximum.
    ///
    /// May be called from interrupt context.
    pub fn give_semaphore(id: SemaphoreId) -> Result<(), GiveSemaphoreError> {
        crate::error::reported::<Traits, _, _>(give_inner::<Traits>(id))
    }

    /// The semaphore's current count.
    pub fn semaphore_count(id: SemaphoreId) -> Result<u32, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_semaphore_cb(lock.borrow_mut(), id)?;
        Ok(cb.count.get(&*lock))
    }

    /// Occupancy counters of the semaphore's wait queue.
    pub fn semaphore_wait_stats(id: SemaphoreId) -> Result<WaitQueueStats, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_semaphore_cb(lock.borrow_mut(), id)?;
        Ok(cb.wait_queue.stats(lock.borrow_mut()))
    }

    /// Delete a semaphore, waking all waiters with a `Deleted` disposition.
    pub fn delete_semaphore(id: SemaphoreId) -> Result<(), DeleteSemaphoreError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_semaphore_cb(lock.borrow_mut(), id)?;

            cb.wait_queue
                .wake_up_all_with(lock.borrow_mut(), Err(WaitError::Deleted));
            cb.slot.replace(&mut *lock, false);

            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        })())
    }
}

fn take_inner<Traits: KernelTraits>(
    id: SemaphoreId,
    timeout: Timeout,
) -> Result<(), TakeSemaphoreError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != Timeout::Immediate {
        task::expect_waitable_context::<Traits>()?;
    }
    let cb = live_semaphore_cb(lock.borrow_mut(), id)?;

    let count = cb.count.get(&*lock);
    if count > 0 {
        cb.count.replace(&mut *lock, count - 1);
        return Ok(());
    }

    match timeout {
        Timeout::Immediate => Err(TakeSemaphoreError::Empty),
        Timeout::Forever => {
            // The giver hands the token to us directly
            cb.wait_queue
                .wait(lock.borrow_mut(), WaitPayload::Semaphore)?;
            Ok(())
        }
        Timeout::Ms(ms) => {
            cb.wait_queue.wait_timeout(
                lock.borrow_mut(),
                WaitPayload::Semaphore,
                timeout::ticks_from_ms::<Traits>(ms),
            )?;
            Ok(())
        }
    }
}

fn give_inner<Traits: KernelTraits>(id: SemaphoreId) -> Result<(), GiveSemaphoreError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = live_semaphore_cb(lock.borrow_mut(), id)?;

    if cb.wait_queue.wake_up_one(lock.borrow_mut()) {
        // The token was transferred to the woken task; the count is
        // unchanged
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    let count = cb.count.get(&*lock);
    let max_count = cb.max_count.get(&*lock);
    if count < max_count {
        cb.count.replace(&mut *lock, count + 1);
    }
    // A give at the ceiling saturates: the token is dropped and the call
    // still succeeds
    Ok(())
}
