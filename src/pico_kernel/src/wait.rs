//! Wait queues — the unified wait-set machinery shared by every blocking
//! primitive.
//!
//! Each blocking primitive owns one or two [`WaitQueue`]s. A task that
//! blocks constructs a [`Wait`] record *on its own stack*, links it into the
//! queue (ordered by effective priority, FIFO among equals) and surrenders
//! the processor. The record therefore lives exactly as long as the wait
//! does, and a task can be in at most one wait list at any time
//! (`TaskCb::wait::current_wait` is the single back-reference).
//!
//! The wake side completes the blocked operation *before* making the waiter
//! Ready — copying message bytes, transferring mutex ownership, recording
//! result bits — so a woken task never has to re-poll the object state.
use core::{cell::Cell, fmt, ptr::NonNull};

use crate::{
    error::{BadObjectStateError, WaitError},
    event_group::{EventBits, EventWaitFlags},
    klock::{CpuLockCell, CpuLockTokenRef, CpuLockTokenRefMut},
    mutex, task,
    task::{TaskCb, TaskSt},
    utils::Init,
    KernelTraits, PortThreading, UTicks,
};

/// Why a task is blocked. Diagnostic counterpart of [`WaitPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Not blocked.
    None,
    /// Blocked in a timed sleep.
    Delay,
    /// Blocked sending to a full message queue.
    QueueFull,
    /// Blocked receiving from an empty message queue.
    QueueEmpty,
    /// Blocked taking a semaphore.
    Semaphore,
    /// Blocked locking a mutex.
    Mutex,
    /// Blocked waiting for event bits.
    EventGroup,
    /// Blocked writing to a full stream buffer.
    StreamFull,
    /// Blocked reading from an empty stream buffer.
    StreamEmpty,
}

impl Init for BlockReason {
    const INIT: Self = Self::None;
}

// Type definitions and trait implementations for wait lists
// ---------------------------------------------------------------------------

/// A reference to a [`Wait`].
pub(crate) struct WaitRef<Traits: PortThreading>(NonNull<Wait<Traits>>);

// Safety: `Wait` is `Send + Sync`
unsafe impl<Traits: PortThreading> Send for WaitRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitRef<Traits> {}

impl<Traits: PortThreading> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<Traits: PortThreading> Copy for WaitRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for WaitRef<Traits> {}

/// *A wait record* describing *which task* is waiting on *what condition*.
///
/// # Lifetime
///
/// This object is constructed by [`WaitQueue::wait`] on a waiting task's
/// stack, and only survives until the method returns. This means a `Wait`
/// can expire only when the waiting task is not waiting anymore.
struct Wait<Traits: PortThreading> {
    /// The task that is waiting for something.
    task: &'static TaskCb<Traits>,

    /// The next record in the list headed by `WaitQueue::head`.
    next: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// The containing [`WaitQueue`], if any.
    wait_queue: Option<&'static WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

/// Additional information included in a [`Wait`], specific to waitable
/// object types. The wake side reads this to complete the operation on the
/// waiter's behalf.
pub(crate) enum WaitPayload<Traits: PortThreading> {
    /// A pure timed sleep; ends only by timeout.
    Delay,
    Semaphore,
    Mutex(&'static mutex::MutexCb<Traits>),
    EventBits {
        bits: EventBits,
        flags: EventWaitFlags,
        orig_bits: CpuLockCell<Traits, Cell<EventBits>>,
    },
    /// Blocked sender: `item` points at the caller's item, `item_size`
    /// bytes, which the wake side moves into the queue (or a receiver).
    QueueSend { item: NonNull<u8> },
    /// Blocked receiver: `out` points at the caller's buffer of `item_size`
    /// bytes, which the wake side fills.
    QueueReceive { out: NonNull<u8> },
    /// Blocked stream writer: the complete message the wake side copies into
    /// the ring once space is available.
    StreamSend { data: NonNull<u8>, len: usize },
    /// Blocked stream reader: the wake side pops the next message into
    /// `out` (truncating to `max_len`) and records the copied length.
    StreamReceive {
        out: NonNull<u8>,
        max_len: usize,
        received: CpuLockCell<Traits, Cell<usize>>,
    },
}

impl<Traits: PortThreading> WaitPayload<Traits> {
    /// Return `self`. Moving the payload through return position keeps the
    /// compiler from `memcpy`ing the unused space of the enum.
    #[inline]
    fn r#move(self) -> Self {
        match self {
            Self::Delay => Self::Delay,
            Self::Semaphore => Self::Semaphore,
            Self::Mutex(x) => Self::Mutex(x),
            Self::EventBits {
                bits,
                flags,
                orig_bits,
            } => Self::EventBits {
                bits,
                flags,
                orig_bits,
            },
            Self::QueueSend { item } => Self::QueueSend { item },
            Self::QueueReceive { out } => Self::QueueReceive { out },
            Self::StreamSend { data, len } => Self::StreamSend { data, len },
            Self::StreamReceive {
                out,
                max_len,
                received,
            } => Self::StreamReceive {
                out,
                max_len,
                received,
            },
        }
    }

    /// The diagnostic block reason corresponding to this payload.
    fn block_reason(&self) -> BlockReason {
        match self {
            Self::Delay => BlockReason::Delay,
            Self::Semaphore => BlockReason::Semaphore,
            Self::Mutex(_) => BlockReason::Mutex,
            Self::EventBits { .. } => BlockReason::EventGroup,
            Self::QueueSend { .. } => BlockReason::QueueFull,
            Self::QueueReceive { .. } => BlockReason::QueueEmpty,
            Self::StreamSend { .. } => BlockReason::StreamFull,
            Self::StreamReceive { .. } => BlockReason::StreamEmpty,
        }
    }
}

/// Occupancy counters of a [`WaitQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitQueueStats {
    /// Total number of tasks that ever blocked on this queue.
    pub enqueued: u32,
    /// Total number of tasks that left this queue (woken, timed out, or
    /// cancelled).
    pub dequeued: u32,
    /// Current depth.
    pub len: u32,
    /// Highest depth ever observed.
    pub peak: u32,
}

impl Init for WaitQueueStats {
    const INIT: Self = Self {
        enqueued: 0,
        dequeued: 0,
        len: 0,
        peak: 0,
    };
}

/// A queue of wait records ([`Wait`]) blocked on a particular waitable
/// object, ordered by the waiting tasks' effective priorities (highest
/// first), FIFO among equals.
pub(crate) struct WaitQueue<Traits: PortThreading> {
    /// The first (highest-priority, longest-waiting) wait record. The
    /// waiting tasks must be in the Blocked state. All elements of this
    /// linked list must be valid.
    head: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    stats: CpuLockCell<Traits, WaitQueueStats>,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        head: CpuLockCell::new(None),
        stats: CpuLockCell::new(WaitQueueStats::INIT),
    };
}

/// The wait state of a task.
pub(crate) struct TaskWait<Traits: PortThreading> {
    /// The wait record describing the ongoing Blocked state of the task.
    /// `None` iff the task is not in the Blocked state.
    ///
    /// The pointee must be valid.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// The result of the last wait operation, set by the wake side and
    /// returned by [`WaitQueue::wait`].
    wait_result: CpuLockCell<Traits, Result<(), WaitError>>,

    /// The tick at which the ongoing wait times out, if it is bounded.
    /// Checked by the tick handler.
    pub(crate) deadline: CpuLockCell<Traits, Option<UTicks>>,
}

impl<Traits: PortThreading> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_wait: CpuLockCell::new(None),
        wait_result: CpuLockCell::new(Ok(())),
        deadline: CpuLockCell::new(None),
    };
}

impl<Traits: PortThreading> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("blocked", &self.current_wait.debug_fmt_with_ref(|w, f| w.is_some().fmt(f)))
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Current occupancy counters.
    pub(crate) fn stats(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> WaitQueueStats {
        self.stats.get(&*lock)
    }

    /// Insert a wait record pertaining to the currently running task,
    /// transitioning the task into the Blocked state. Returns when the task
    /// is woken.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that); the caller should use `expect_waitable_context` first.
    #[inline]
    pub(crate) fn wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        let task = current_task(lock.borrow_mut());
        let wait = Wait {
            task,
            next: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload: payload.r#move(),
        };

        self.wait_inner(lock, &wait)?;

        Ok(wait.payload)
    }

    /// Like [`Self::wait`], but the wait times out `duration_ticks` ticks
    /// from now.
    #[inline]
    pub(crate) fn wait_timeout(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        duration_ticks: UTicks,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        let task = current_task(lock.borrow_mut());
        let wait = Wait {
            task,
            next: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload: payload.r#move(),
        };

        set_deadline(lock.borrow_mut(), task, duration_ticks);

        self.wait_inner(lock, &wait)?;

        Ok(wait.payload)
    }

    /// The core portion of [`Self::wait`].
    ///
    /// Passing `WaitPayload` by value is expensive, so moving it into and
    /// out of `Wait` is done in the `#[inline]` outer functions.
    fn wait_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait: &Wait<Traits>,
    ) -> Result<(), WaitError> {
        let task = wait.task;
        let wait_ref = WaitRef(wait.into());

        debug_assert!(core::ptr::eq(wait.task, current_task(lock.borrow_mut())));
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        self.insert(lock.borrow_mut(), wait_ref);

        // Establish the task→record back-reference
        task.wait.current_wait.replace(&mut *lock, Some(wait_ref));
        task.block_reason
            .replace(&mut *lock, wait.payload.block_reason());

        // Transition the task into Blocked. This statement completes when
        // the task is woken up.
        task::wait_until_woken_up(lock.borrow_mut());

        // The record should have been unlinked by the wake side
        debug_assert!(wait.next.get(&*lock).is_none());
        debug_assert!(task.wait.current_wait.get(&*lock).is_none());

        task.wait.wait_result.get(&*lock)
    }

    /// Link `wait_ref` into the list: after every record whose task has an
    /// equal or higher effective priority, before the first lower one.
    fn insert(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, wait_ref: WaitRef<Traits>) {
        // Safety: `wait_ref` refers to a live record owned by a task that is
        // about to block
        let wait = unsafe { wait_ref.0.as_ref() };
        let pri = wait.task.effective_priority.get(&*lock);

        let mut prev: Option<WaitRef<Traits>> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(cur_ref) = cur {
            // Safety: all list elements are live records
            let cur_wait = unsafe { cur_ref.0.as_ref() };
            if cur_wait.task.effective_priority.get(&*lock) >= pri {
                prev = Some(cur_ref);
                cur = cur_wait.next.get(&*lock);
            } else {
                break;
            }
        }

        wait.next.replace(&mut *lock, cur);
        match prev {
            // Safety: `prev` is a live record
            Some(p) => unsafe { p.0.as_ref() }.next.replace(&mut *lock, Some(wait_ref)),
            None => self.head.replace(&mut *lock, Some(wait_ref)),
        };

        let stats = self.stats.write(&mut *lock);
        stats.enqueued += 1;
        stats.len += 1;
        stats.peak = stats.peak.max(stats.len);
    }

    /// Unlink `wait_ref` from the list. Panics if it is not linked.
    fn remove(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, wait_ref: WaitRef<Traits>) {
        let mut prev: Option<WaitRef<Traits>> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(cur_ref) = cur {
            // Safety: all list elements are live records
            let cur_wait = unsafe { cur_ref.0.as_ref() };
            if cur_ref == wait_ref {
                let next = cur_wait.next.replace(&mut *lock, None);
                match prev {
                    // Safety: `prev` is a live record
                    Some(p) => unsafe { p.0.as_ref() }.next.replace(&mut *lock, next),
                    None => self.head.replace(&mut *lock, next),
                };
                let stats = self.stats.write(&mut *lock);
                stats.dequeued += 1;
                stats.len -= 1;
                return;
            }
            prev = Some(cur_ref);
            cur = cur_wait.next.get(&*lock);
        }
        unreachable!("wait record not found in its wait queue");
    }

    /// Unlink and return the first wait record.
    fn pop_front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<WaitRef<Traits>> {
        let first = self.head.get(&*lock)?;
        // Safety: `first` is a live record
        let next = unsafe { first.0.as_ref() }.next.replace(&mut *lock, None);
        self.head.replace(&mut *lock, next);
        let stats = self.stats.write(&mut *lock);
        stats.dequeued += 1;
        stats.len -= 1;
        Some(first)
    }

    /// Get the next waiting task to be woken up.
    pub(crate) fn first_waiting_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        // Safety: all list elements are live records
        self.head.get(&*lock).map(|r| unsafe { r.0.as_ref() }.task)
    }

    /// Wake up up to one waiting task. Returns `true` if it has woken one.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let Some(wait_ref) = self.pop_front(lock.borrow_mut()) else {
            return false;
        };

        // Safety: `wait_ref` was linked in `self` a moment ago
        let wait = unsafe { wait_ref.0.as_ref() };
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        complete_wait(lock.borrow_mut(), wait, Ok(()));

        true
    }

    /// Conditionally wake up waiting tasks: every waiter, in list order,
    /// whose payload satisfies `cond`.
    ///
    /// The callback receives a shared lock token — enough to update result
    /// cells inside the payload, but not to reenter the kernel and
    /// invalidate the iteration.
    ///
    /// This method may make tasks Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_all_conditional(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(&WaitPayload<Traits>, CpuLockTokenRef<'_, Traits>) -> bool,
    ) {
        let mut cur = self.head.get(&*lock);
        while let Some(wait_ref) = cur {
            // Find the next record before we possibly unlink `wait_ref`.
            // Safety: all list elements are live records
            let wait = unsafe { wait_ref.0.as_ref() };
            cur = wait.next.get(&*lock);

            debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

            if !cond(&wait.payload, lock.borrow()) {
                continue;
            }

            self.remove(lock.borrow_mut(), wait_ref);
            complete_wait(lock.borrow_mut(), wait, Ok(()));
        }
    }

    /// Wake up waiting tasks from the front of the list while `cond`
    /// accepts them, stopping at the first waiter whose condition cannot be
    /// satisfied. Used where waiters must be served strictly in priority
    /// order.
    pub(crate) fn wake_up_while(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(&WaitPayload<Traits>, CpuLockTokenRef<'_, Traits>) -> bool,
    ) {
        loop {
            let Some(wait_ref) = self.head.get(&*lock) else {
                return;
            };
            // Safety: all list elements are live records
            let wait = unsafe { wait_ref.0.as_ref() };

            if !cond(&wait.payload, lock.borrow()) {
                return;
            }

            self.pop_front(lock.borrow_mut());
            complete_wait(lock.borrow_mut(), wait, Ok(()));
        }
    }

    /// Wake up every waiting task with the given disposition. Used when the
    /// waited object is deleted.
    pub(crate) fn wake_up_all_with(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        result: Result<(), WaitError>,
    ) {
        while let Some(wait_ref) = self.pop_front(lock.borrow_mut()) {
            // Safety: `wait_ref` was linked in `self` a moment ago
            let wait = unsafe { wait_ref.0.as_ref() };
            complete_wait(lock.borrow_mut(), wait, result);
        }
    }

    /// Reposition `wait` in the wait queue. This is necessary after
    /// changing the waiting task's priority.
    fn reorder_wait(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait_ref: WaitRef<Traits>,
    ) {
        self.remove(lock.borrow_mut(), wait_ref);
        // `remove`/`insert` count one spurious pass through the stats;
        // compensate so reordering is invisible there.
        {
            let stats = self.stats.write(&mut *lock);
            stats.enqueued = stats.enqueued.wrapping_sub(1);
            stats.dequeued = stats.dequeued.wrapping_sub(1);
        }
        self.insert(lock.borrow_mut(), wait_ref);
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue").field("stats", &self.stats).finish()
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Delay => f.write_str("Delay"),
            Self::Semaphore => f.write_str("Semaphore"),
            Self::Mutex(mutex) => write!(f, "Mutex({mutex:p})"),
            Self::EventBits { bits, flags, .. } => f
                .debug_struct("EventBits")
                .field("bits", bits)
                .field("flags", flags)
                .finish(),
            Self::QueueSend { .. } => f.write_str("QueueSend"),
            Self::QueueReceive { .. } => f.write_str("QueueReceive"),
            Self::StreamSend { len, .. } => write!(f, "StreamSend({len})"),
            Self::StreamReceive { max_len, .. } => write!(f, "StreamReceive({max_len})"),
        }
    }
}

/// The currently running task of the executing core.
///
/// Panics if called outside a task context.
fn current_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> &'static TaskCb<Traits> {
    Traits::state()
        .running_task(lock.borrow_mut(), Traits::current_core())
        .unwrap()
}

/// Arm the tick-handler timeout for the task's imminent wait.
fn set_deadline<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    duration_ticks: UTicks,
) {
    let now = crate::timeout::tick_count_locked::<Traits>(lock.borrow_mut());
    task.wait
        .deadline
        .replace(&mut *lock, Some(now.wrapping_add(duration_ticks)));
}

/// Block the current task on no queue at all; the wait ends only through
/// [`interrupt_task`] (not used for this payload) or a timeout.
#[inline]
pub(crate) fn wait_no_queue_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    duration_ticks: UTicks,
) -> Result<WaitPayload<Traits>, WaitError> {
    let task = current_task(lock.borrow_mut());
    let wait = Wait {
        task,
        next: CpuLockCell::new(None),
        wait_queue: None,
        payload: payload.r#move(),
    };

    set_deadline(lock.borrow_mut(), task, duration_ticks);

    wait_no_queue_inner(lock, &wait)?;

    Ok(wait.payload)
}

/// The core portion of [`wait_no_queue_timeout`].
fn wait_no_queue_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
) -> Result<(), WaitError> {
    let task = wait.task;
    let wait_ref = WaitRef(wait.into());

    debug_assert!(core::ptr::eq(wait.task, current_task(lock.borrow_mut())));
    debug_assert!(wait.wait_queue.is_none());

    task.wait.current_wait.replace(&mut *lock, Some(wait_ref));
    task.block_reason
        .replace(&mut *lock, wait.payload.block_reason());

    task::wait_until_woken_up(lock.borrow_mut());

    debug_assert!(task.wait.current_wait.get(&*lock).is_none());

    task.wait.wait_result.get(&*lock)
}

/// Deassociate the specified wait record from its waiting task and wake the
/// task up with `wait_result`.
///
/// This function doesn't remove `wait` from its wait queue — the caller has
/// already done that.
///
/// This function may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    wait_result: Result<(), WaitError>,
) {
    let task = wait.task;

    debug_assert_eq!(
        task.wait.current_wait.get(&*lock),
        Some(WaitRef(wait.into()))
    );
    task.wait.current_wait.replace(&mut *lock, None);
    task.wait.deadline.replace(&mut *lock, None);
    task.block_reason.replace(&mut *lock, BlockReason::None);

    let _ = task.wait.wait_result.replace(&mut *lock, wait_result);

    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Blocked);

    // Safety: The task is in the Blocked state and its wait bookkeeping has
    // just been cleaned up, so it is ready to resume.
    unsafe { task::make_ready(lock, task) };
}

/// Interrupt an ongoing wait operation of `task` with the given disposition:
/// unlink its wait record (if it sits in a queue) and make it Ready.
///
/// Used by the tick handler on timeout expiry and by object deletion.
///
/// Returns `Err(BadObjectState)` if the task is not in the Blocked state.
///
/// This function may make the task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    wait_result: Result<(), WaitError>,
) -> Result<(), BadObjectStateError> {
    match *task.st.read(&*lock) {
        TaskSt::Blocked => {
            // The task is Blocked, so `current_wait` must be `Some(_)`
            let wait_ref = task.wait.current_wait.get(&*lock).unwrap();

            // Safety: `current_wait` always refers to a live record
            let wait = unsafe { wait_ref.0.as_ref() };

            if let Some(wait_queue) = wait.wait_queue {
                wait_queue.remove(lock.borrow_mut(), wait_ref);
            }

            complete_wait(lock.borrow_mut(), wait, wait_result);

            Ok(())
        }
        _ => Err(BadObjectStateError::BadObjectState),
    }
}

/// Drop the specified task's wait record without waking the task. Used when
/// a Blocked task is deleted outright.
pub(crate) fn abandon_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let Some(wait_ref) = task.wait.current_wait.get(&*lock) else {
        return;
    };

    // Safety: `current_wait` always refers to a live record
    let wait = unsafe { wait_ref.0.as_ref() };

    if let Some(wait_queue) = wait.wait_queue {
        wait_queue.remove(lock.borrow_mut(), wait_ref);
    }

    task.wait.current_wait.replace(&mut *lock, None);
    task.wait.deadline.replace(&mut *lock, None);
    task.block_reason.replace(&mut *lock, BlockReason::None);
}

/// Reposition the given task's wait record within its wait queue. This is
/// necessary after changing the task's effective priority, because wait
/// queues are sorted by it.
///
/// Does nothing if the task is not currently Blocked on a wait queue.
pub(crate) fn reorder_wait_of_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &TaskCb<Traits>,
) {
    let Some(wait_ref) = task.wait.current_wait.get(&*lock) else {
        return;
    };

    // Safety: `current_wait` always refers to a live record
    let wait = unsafe { wait_ref.0.as_ref() };

    if let Some(wait_queue) = wait.wait_queue {
        wait_queue.reorder_wait(lock.borrow_mut(), wait_ref);
    }
}

