//! Tasks and the scheduler core.
use core::{fmt, mem};

use crate::{
    error::{
        BadContextError, BadIdError, CreateTaskError, DeleteTaskError, QueryTaskError,
        ResumeTaskError, SetTaskPriorityError, SleepError, SuspendTaskError, YieldError,
    },
    id_from_index, klock, mutex, smp, timeout,
    utils::{Init, RawCell},
    wait, Id, KernelTraits, PortThreading, Priority, System, UTicks, STACK_CANARY,
};

pub(crate) mod readyqueue;
use self::readyqueue::ScheduleDecision;

/// Identifies a task. See [`System::create_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) Id);

impl TaskId {
    /// The raw 1-based pool index backing this identifier.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// The number of task-local storage slots each task carries.
pub const LOCAL_STORAGE_SLOTS: usize = 4;

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The control-block slot is unused.
    Dormant,
    /// Runnable, queued in the ready queue.
    Ready,
    /// Currently executing on some core.
    Running,
    /// Waiting on a primitive or in a timed sleep.
    Blocked,
    /// Invisible to the scheduler and to timeout expiry until resumed.
    Suspended,
    /// Finished; awaiting reclamation by the idle task.
    Terminated,
}

impl Init for TaskSt {
    const INIT: Self = Self::Dormant;
}

/// The region backing a task's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    base: *mut u8,
    size: usize,
    /// Whether the region came from the port's stack provider and must be
    /// returned to it on reclamation.
    auto: bool,
}

// Safety: The raw pointer is only dereferenced under the kernel lock (or by
// the owning task itself).
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl Init for StackRegion {
    const INIT: Self = Self {
        base: core::ptr::null_mut(),
        size: 0,
        auto: false,
    };
}

impl StackRegion {
    /// The lowest address of the stack region.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// The size of the stack region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the highest address of the stack region — the initial stack
    /// pointer of a full-descending stack.
    pub fn top(&self) -> *mut u8 {
        self.base.wrapping_add(self.size)
    }
}

/// Per-task scheduling telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTelemetry {
    /// How many times the task has been dispatched.
    pub dispatches: u32,
    /// The tick at which the task was last dispatched.
    pub last_dispatched: UTicks,
}

impl Init for TaskTelemetry {
    const INIT: Self = Self {
        dispatches: 0,
        last_dispatched: 0,
    };
}

/// *Task control block* — the state data of a task.
///
/// Lives in the static pool instantiated by
/// [`build_kernel!`](crate::build_kernel); a [`TaskId`] is a 1-based index
/// into that pool.
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// Port-specific state (the saved stack pointer on bare-metal ports).
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that context-switch handlers can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    // The following four fields are written once during task creation (with
    // the kernel lock held) and are read by the port without the lock; see
    // the accessors below.
    name: RawCell<&'static str>,
    entry_point: RawCell<Option<fn(usize)>>,
    entry_param: RawCell<usize>,
    stack: RawCell<StackRegion>,

    /// The task's own priority, as created or set by
    /// [`System::set_task_priority`].
    pub(crate) base_priority: klock::CpuLockCell<Traits, Priority>,

    /// The priority the scheduler actually uses. Usually equals
    /// `base_priority`; temporarily raised by mutex priority inheritance.
    ///
    /// After updating this for a Ready or Blocked task, the task must be
    /// repositioned in the ready queue or its wait queue.
    pub(crate) effective_priority: klock::CpuLockCell<Traits, Priority>,

    pub(crate) st: klock::CpuLockCell<Traits, TaskSt>,

    /// Why the task is Blocked (diagnostic).
    pub(crate) block_reason: klock::CpuLockCell<Traits, wait::BlockReason>,

    /// The wait state of the task.
    pub(crate) wait: wait::TaskWait<Traits>,

    /// Links the task into one per-priority FIFO of the ready queue while
    /// it is Ready.
    pub(crate) ready_link: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The head of the chain of mutexes currently held by this task, most
    /// recently locked first.
    pub(crate) last_mutex_held:
        klock::CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    pub(crate) affinity: klock::CpuLockCell<Traits, smp::Affinity>,

    /// The core this task last ran on; `Any`-affinity tasks stick to it
    /// until the load balancer moves them.
    pub(crate) assigned_core: klock::CpuLockCell<Traits, Option<usize>>,

    /// Set by the load balancer; applied at the next safe point.
    pub(crate) migration_pending: klock::CpuLockCell<Traits, Option<usize>>,

    /// Opaque per-task slots for subsystems. The kernel never interprets
    /// their contents.
    pub(crate) local_storage: klock::CpuLockCell<Traits, [usize; LOCAL_STORAGE_SLOTS]>,

    pub(crate) telemetry: klock::CpuLockCell<Traits, TaskTelemetry>,
}

impl<Traits: PortThreading> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_task_state: Traits::PORT_TASK_STATE_INIT,
        name: RawCell::new(""),
        entry_point: RawCell::new(None),
        entry_param: RawCell::new(0),
        stack: RawCell::new(StackRegion::INIT),
        base_priority: klock::CpuLockCell::new(0),
        effective_priority: klock::CpuLockCell::new(0),
        st: klock::CpuLockCell::new(TaskSt::Dormant),
        block_reason: klock::CpuLockCell::new(wait::BlockReason::None),
        wait: wait::TaskWait::INIT,
        ready_link: klock::CpuLockCell::new(None),
        last_mutex_held: klock::CpuLockCell::new(None),
        affinity: klock::CpuLockCell::new(smp::Affinity::Any),
        assigned_core: klock::CpuLockCell::new(None),
        migration_pending: klock::CpuLockCell::new(None),
        local_storage: klock::CpuLockCell::new([0; LOCAL_STORAGE_SLOTS]),
        telemetry: klock::CpuLockCell::new(TaskTelemetry::INIT),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("name", &self.name())
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("block_reason", &self.block_reason)
            .field("wait", &self.wait)
            .finish()
    }
}

impl<Traits: PortThreading> TaskCb<Traits> {
    /// The task's name. Stable while the task exists.
    pub fn name(&self) -> &'static str {
        // Safety: Written only during task creation
        unsafe { *self.name.get() }
    }

    /// The task's entry function. Stable while the task exists; used by the
    /// port to build the initial context.
    pub fn entry_point(&self) -> Option<fn(usize)> {
        // Safety: Written only during task creation
        unsafe { *self.entry_point.get() }
    }

    /// The parameter passed to the entry function.
    pub fn entry_param(&self) -> usize {
        // Safety: Written only during task creation
        unsafe { *self.entry_param.get() }
    }

    /// The task's stack region. Stable while the task exists.
    pub fn stack_region(&self) -> StackRegion {
        // Safety: Written only during task creation
        unsafe { *self.stack.get() }
    }
}

/// The currently running task of the executing core.
///
/// Panics if the core is idle-less (only possible before the first
/// dispatch).
pub(crate) fn current_task_cb<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> &'static TaskCb<Traits> {
    Traits::state()
        .running_task(lock.borrow_mut(), Traits::current_core())
        .unwrap()
}

/// Look up a live (non-Dormant) task by id.
pub(crate) fn live_task_cb<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    id: TaskId,
) -> Result<&'static TaskCb<Traits>, BadIdError> {
    let cb = Traits::get_task_cb(id.0.get() - 1).ok_or(BadIdError::BadId)?;
    if *cb.st.read(&*lock) == TaskSt::Dormant {
        Err(BadIdError::BadId)
    } else {
        Ok(cb)
    }
}

/// The [`TaskId`] of a control block, derived from its pool position.
pub(crate) fn task_id_of<Traits: KernelTraits>(cb: &'static TaskCb<Traits>) -> TaskId {
    let offset_bytes =
        cb as *const TaskCb<_> as usize - Traits::task_cb_pool().as_ptr() as usize;
    TaskId(id_from_index(offset_bytes / mem::size_of::<TaskCb<Traits>>()))
}

/// If the current context is not a task context, return `Err(BadContext)`.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context may not block, return `Err(BadContext)`.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() || Traits::is_interrupt_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a task and make it Ready.
    ///
    /// `priority` must be in `1..PRIORITY_LEVELS` (0 is the idle priority).
    /// The stack is obtained from the port's stack provider; its low end is
    /// seeded with the canary words checked by the idle task.
    pub fn create_task(
        name: &'static str,
        entry: fn(usize),
        param: usize,
        stack_size: usize,
        priority: Priority,
    ) -> Result<TaskId, CreateTaskError> {
        crate::error::reported::<Traits, _, _>(create_task_inner::<Traits>(
            name, entry, param, stack_size, priority,
        ))
    }

    /// Delete a task. Deleting the current task never returns; stack
    /// reclamation happens later in the idle task.
    pub fn delete_task(task: TaskId) -> Result<(), DeleteTaskError> {
        crate::error::reported::<Traits, _, _>(delete_task_inner::<Traits>(task))
    }

    /// The identifier of the calling task.
    pub fn current_task() -> Result<TaskId, QueryTaskError> {
        expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = current_task_cb(lock.borrow_mut());
        Ok(task_id_of(cb))
    }

    /// Suspend a task. A Suspended task is invisible to the scheduler and
    /// to timeout expiry until [`System::resume_task`] is called.
    ///
    /// Suspending the current task takes effect immediately. Suspending a
    /// Blocked task is not supported and fails with `BadObjectState`.
    pub fn suspend_task(task: TaskId) -> Result<(), SuspendTaskError> {
        crate::error::reported::<Traits, _, _>(suspend_task_inner::<Traits>(task))
    }

    /// Make a Suspended task Ready again. Resuming a task that is not
    /// Suspended is a no-op.
    pub fn resume_task(task: TaskId) -> Result<(), ResumeTaskError> {
        crate::error::reported::<Traits, _, _>(resume_task_inner::<Traits>(task))
    }

    /// Put the calling task to sleep for at least `ms` milliseconds.
    /// `sleep_ms(0)` is equivalent to [`System::yield_now`].
    pub fn sleep_ms(ms: u32) -> Result<(), SleepError> {
        if ms == 0 {
            return Self::yield_now().map_err(|YieldError::BadContext| SleepError::BadContext);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        expect_waitable_context::<Traits>()?;

        let ticks = timeout::ticks_from_ms::<Traits>(ms);
        match wait::wait_no_queue_timeout(
            lock.borrow_mut(),
            wait::WaitPayload::Delay,
            ticks,
        ) {
            // A timed sleep only ever ends by timeout
            Err(crate::error::WaitError::Timeout) => Ok(()),
            Ok(_) | Err(crate::error::WaitError::Deleted) => unreachable!(),
        }
    }

    /// Voluntarily surrender the processor to any equal-or-higher-priority
    /// Ready task, with round-robin rotation among equals.
    pub fn yield_now() -> Result<(), YieldError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        expect_task_context::<Traits>()?;

        let task = current_task_cb(lock.borrow_mut());
        debug_assert_eq!(*task.st.read(&*lock), TaskSt::Running);

        // Go to the back of our priority's FIFO; the dispatcher then picks
        // the longest-waiting equal-priority task (possibly us again).
        // Safety: The previous state is Running, so the task is not queued
        unsafe { make_ready(lock.borrow_mut(), task) };

        drop(lock);
        // Safety: Kernel lock inactive
        unsafe { Traits::yield_cpu() };
        Ok(())
    }

    /// Change a task's base priority. If the task's priority is currently
    /// inherited through a mutex, the boost is preserved.
    pub fn set_task_priority(task: TaskId, priority: Priority) -> Result<(), SetTaskPriorityError> {
        crate::error::reported::<Traits, _, _>(set_task_priority_inner::<Traits>(task, priority))
    }

    /// A task's base priority.
    pub fn task_priority(task: TaskId) -> Result<Priority, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_task_cb(lock.borrow_mut(), task)?;
        Ok(cb.base_priority.get(&*lock))
    }

    /// A task's effective (possibly inheritance-boosted) priority.
    pub fn task_effective_priority(task: TaskId) -> Result<Priority, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_task_cb(lock.borrow_mut(), task)?;
        Ok(cb.effective_priority.get(&*lock))
    }

    /// A task's current state.
    pub fn task_state(task: TaskId) -> Result<TaskSt, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_task_cb(lock.borrow_mut(), task)?;
        Ok(*cb.st.read(&*lock))
    }

    /// Why a task is currently Blocked ([`BlockReason::None`] otherwise).
    pub fn task_block_reason(task: TaskId) -> Result<wait::BlockReason, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_task_cb(lock.borrow_mut(), task)?;
        Ok(cb.block_reason.get(&*lock))
    }

    /// A human-readable rendition of a task's state, for diagnostics.
    pub fn task_state_str(task: TaskId) -> Result<&'static str, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_task_cb(lock.borrow_mut(), task)?;
        let st = *cb.st.read(&*lock);
        Ok(match st {
            TaskSt::Dormant => "dormant",
            TaskSt::Ready => "ready",
            TaskSt::Running => "running",
            TaskSt::Blocked => match cb.block_reason.get(&*lock) {
                wait::BlockReason::None => "blocked",
                wait::BlockReason::Delay => "blocked (delay)",
                wait::BlockReason::QueueFull => "blocked (queue full)",
                wait::BlockReason::QueueEmpty => "blocked (queue empty)",
                wait::BlockReason::Semaphore => "blocked (semaphore)",
                wait::BlockReason::Mutex => "blocked (mutex)",
                wait::BlockReason::EventGroup => "blocked (event group)",
                wait::BlockReason::StreamFull => "blocked (stream full)",
                wait::BlockReason::StreamEmpty => "blocked (stream empty)",
            },
            TaskSt::Suspended => "suspended",
            TaskSt::Terminated => "terminated",
        })
    }

    /// A task's name.
    pub fn task_name(task: TaskId) -> Result<&'static str, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_task_cb(lock.borrow_mut(), task)?;
        Ok(cb.name())
    }

    /// A task's scheduling telemetry.
    pub fn task_telemetry(task: TaskId) -> Result<TaskTelemetry, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_task_cb(lock.borrow_mut(), task)?;
        Ok(cb.telemetry.get(&*lock))
    }

    /// Store a value in one of the calling task's local-storage slots.
    pub fn task_local_set(slot: usize, value: usize) -> Result<(), QueryTaskError> {
        if slot >= LOCAL_STORAGE_SLOTS {
            return Err(QueryTaskError::BadId);
        }
        expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = current_task_cb(lock.borrow_mut());
        cb.local_storage.write(&mut *lock)[slot] = value;
        Ok(())
    }

    /// Read one of the calling task's local-storage slots.
    pub fn task_local_get(slot: usize) -> Result<usize, QueryTaskError> {
        if slot >= LOCAL_STORAGE_SLOTS {
            return Err(QueryTaskError::BadId);
        }
        expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = current_task_cb(lock.borrow_mut());
        Ok(cb.local_storage.read(&*lock)[slot])
    }
}

fn create_task_inner<Traits: KernelTraits>(
    name: &'static str,
    entry: fn(usize),
    param: usize,
    stack_size: usize,
    priority: Priority,
) -> Result<TaskId, CreateTaskError> {
    if (priority as usize) < 1 || priority as usize >= Traits::PRIORITY_LEVELS {
        return Err(CreateTaskError::BadParam);
    }
    if stack_size < Traits::STACK_MIN_SIZE {
        return Err(CreateTaskError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;

    // Claim a free control-block slot
    let (i, cb) = Traits::task_cb_pool()
        .iter()
        .enumerate()
        .find(|(_, cb)| *cb.st.read(&*lock) == TaskSt::Dormant)
        .ok_or(CreateTaskError::NoMemory)?;

    // Round the stack size up to the port's alignment
    let stack_size = (stack_size + Traits::STACK_ALIGN - 1) & !(Traits::STACK_ALIGN - 1);

    // Safety: Kernel lock active
    let stack_base =
        unsafe { Traits::allocate_memory(stack_size) }.ok_or(CreateTaskError::NoMemory)?;
    let stack = StackRegion {
        base: stack_base.as_ptr(),
        size: stack_size,
        auto: true,
    };

    init_task_cb(lock.borrow_mut(), cb, name, entry, param, stack, priority);

    // Safety: Kernel lock active, the task is being initialized
    unsafe { Traits::initialize_task_state(cb) };

    // Safety: The slot was Dormant, so the task is in no queue
    unsafe { make_ready(lock.borrow_mut(), cb) };

    let id = TaskId(id_from_index(i));
    log::debug!("created task {:?} {:?} (priority {})", id, name, priority);

    unlock_cpu_and_check_preemption(lock);
    Ok(id)
}

/// Reset a claimed control block to a pristine state for a new task.
fn init_task_cb<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static TaskCb<Traits>,
    name: &'static str,
    entry: fn(usize),
    param: usize,
    stack: StackRegion,
    priority: Priority,
) {
    // Safety: Kernel lock active; the slot is not yet visible to the
    // scheduler
    unsafe {
        *cb.name.get() = name;
        *cb.entry_point.get() = Some(entry);
        *cb.entry_param.get() = param;
        *cb.stack.get() = stack;
    }

    // Seed the overflow canary at the stack's low end
    // Safety: The region was just obtained from the stack provider
    unsafe {
        let words = stack.base as *mut u32;
        words.write(STACK_CANARY);
        words.add(1).write(STACK_CANARY);
    }

    cb.base_priority.replace(&mut *lock, priority);
    cb.effective_priority.replace(&mut *lock, priority);
    cb.block_reason
        .replace(&mut *lock, wait::BlockReason::None);
    cb.ready_link.replace(&mut *lock, None);
    cb.last_mutex_held.replace(&mut *lock, None);
    cb.affinity.replace(&mut *lock, smp::Affinity::Any);
    cb.assigned_core.replace(&mut *lock, None);
    cb.migration_pending.replace(&mut *lock, None);
    cb.local_storage
        .replace(&mut *lock, [0; LOCAL_STORAGE_SLOTS]);
    cb.telemetry.replace(&mut *lock, TaskTelemetry::INIT);
}

/// Create a task on behalf of the kernel itself (the idle tasks). Unlike
/// [`System::create_task`], priority 0 and an explicit affinity are
/// allowed.
pub(crate) fn create_kernel_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    name: &'static str,
    entry: fn(usize),
    param: usize,
    stack_size: usize,
    priority: Priority,
    affinity: smp::Affinity,
) -> Option<&'static TaskCb<Traits>> {
    let cb = Traits::task_cb_pool()
        .iter()
        .find(|cb| *cb.st.read(&*lock) == TaskSt::Dormant)?;

    let stack_size = (stack_size + Traits::STACK_ALIGN - 1) & !(Traits::STACK_ALIGN - 1);
    // Safety: Kernel lock active
    let stack_base = unsafe { Traits::allocate_memory(stack_size) }?;
    let stack = StackRegion {
        base: stack_base.as_ptr(),
        size: stack_size,
        auto: true,
    };

    init_task_cb(
        lock.borrow_mut(),
        cb,
        name,
        entry,
        param,
        stack,
        priority,
    );
    cb.affinity.replace(&mut *lock, affinity);

    // Safety: Kernel lock active, the task is being initialized
    unsafe { Traits::initialize_task_state(cb) };
    // Safety: The slot was Dormant, so the task is in no queue
    unsafe { make_ready(lock.borrow_mut(), cb) };

    Some(cb)
}

fn delete_task_inner<Traits: KernelTraits>(id: TaskId) -> Result<(), DeleteTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = live_task_cb(lock.borrow_mut(), id)?;

    let core = Traits::current_core();
    let is_self = Traits::state()
        .running_task(lock.borrow_mut(), core)
        .map_or(false, |t| core::ptr::eq(t, cb));

    match *cb.st.read(&*lock) {
        TaskSt::Dormant => unreachable!(),
        TaskSt::Terminated => Ok(()),
        TaskSt::Running if is_self => {
            // Safety: `cb` is the current task
            unsafe { exit_current_task::<Traits>(lock) }
        }
        TaskSt::Running => {
            // Running on the other core; it cannot be torn out of its
            // context asynchronously.
            Err(DeleteTaskError::BadObjectState)
        }
        st => {
            match st {
                TaskSt::Ready => {
                    let pri = cb.effective_priority.get(&*lock);
                    Traits::state()
                        .ready_queue()
                        .remove_task(lock.borrow_mut(), cb, pri);
                }
                TaskSt::Blocked => {
                    wait::abandon_wait(lock.borrow_mut(), cb);
                }
                TaskSt::Suspended => {}
                _ => unreachable!(),
            }
            mutex::abandon_held_mutexes(lock.borrow_mut(), cb);
            cb.st.replace(&mut *lock, TaskSt::Terminated);
            log::debug!("deleted task {:?} {:?}", id, cb.name());
            unlock_cpu_and_check_preemption(lock);
            Ok(())
        }
    }
}

/// Terminate the currently running task. The task's held mutexes are
/// released (waking their next waiters); the stack is reclaimed later by
/// the idle task.
///
/// # Safety
///
/// Kernel lock active (consumed). All data on the current task's stack is
/// abandoned without running destructors.
pub(crate) unsafe fn exit_current_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) -> ! {
    let core = Traits::current_core();
    let task = Traits::state()
        .running_task(lock.borrow_mut(), core)
        .unwrap();

    // Release held mutexes, waking up their next waiters (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), task);
    debug_assert!(task.last_mutex_held.read(&*lock).is_none());

    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Running);
    task.st.replace(&mut *lock, TaskSt::Terminated);

    Traits::state().set_running_task(lock.borrow_mut(), core, None);

    log::debug!("task {:?} exited", task.name());

    mem::forget(lock);

    // Safety: Kernel lock active; the task has been detached
    unsafe { Traits::exit_and_dispatch(task) }
}

/// The landing point for a task entry function that returns. Registered by
/// the port as the return address of every task's initial frame.
pub extern "C" fn task_exit_trampoline<Traits: KernelTraits>() -> ! {
    let lock = klock::lock_cpu::<Traits>()
        // The lock cannot be held here: the entry function returned from an
        // ordinary task context
        .unwrap_or_else(|_| unreachable!());
    // Safety: Task context, kernel lock consumed by `exit_current_task`
    unsafe { exit_current_task::<Traits>(lock) }
}

fn suspend_task_inner<Traits: KernelTraits>(id: TaskId) -> Result<(), SuspendTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = live_task_cb(lock.borrow_mut(), id)?;

    let core = Traits::current_core();
    let is_self = Traits::state()
        .running_task(lock.borrow_mut(), core)
        .map_or(false, |t| core::ptr::eq(t, cb));

    match *cb.st.read(&*lock) {
        TaskSt::Running if is_self => {
            cb.st.replace(&mut *lock, TaskSt::Suspended);
            drop(lock);
            // Safety: Kernel lock inactive
            unsafe { Traits::yield_cpu() };
            Ok(())
        }
        TaskSt::Ready => {
            let pri = cb.effective_priority.get(&*lock);
            Traits::state()
                .ready_queue()
                .remove_task(lock.borrow_mut(), cb, pri);
            cb.st.replace(&mut *lock, TaskSt::Suspended);
            Ok(())
        }
        TaskSt::Suspended => Ok(()),
        // Blocked tasks and tasks running on the other core cannot be
        // suspended in place
        _ => Err(SuspendTaskError::BadObjectState),
    }
}

fn resume_task_inner<Traits: KernelTraits>(id: TaskId) -> Result<(), ResumeTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = live_task_cb(lock.borrow_mut(), id)?;

    if *cb.st.read(&*lock) != TaskSt::Suspended {
        // Resuming a non-Suspended task is defined as a no-op
        return Ok(());
    }

    // Safety: The previous state is Suspended, so the task is in no queue
    unsafe { make_ready(lock.borrow_mut(), cb) };
    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

fn set_task_priority_inner<Traits: KernelTraits>(
    id: TaskId,
    priority: Priority,
) -> Result<(), SetTaskPriorityError> {
    if (priority as usize) < 1 || priority as usize >= Traits::PRIORITY_LEVELS {
        return Err(SetTaskPriorityError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = live_task_cb(lock.borrow_mut(), id)?;

    if cb.base_priority.get(&*lock) == 0 {
        // The idle tasks keep priority 0
        return Err(SetTaskPriorityError::BadParam);
    }
    if *cb.st.read(&*lock) == TaskSt::Terminated {
        return Err(SetTaskPriorityError::BadObjectState);
    }

    let old_base = cb.base_priority.replace(&mut *lock, priority);
    if old_base == priority {
        return Ok(());
    }

    // Recompute the effective priority, preserving any inheritance boost
    // from mutexes the task still holds
    let effective = mutex::evaluate_task_effective_priority(lock.borrow_mut(), cb, priority);
    set_effective_priority(lock.borrow_mut(), cb, effective);

    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Update a task's effective priority and reposition it in whichever list
/// currently holds it. Does not perform a preemption check.
pub(crate) fn set_effective_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    priority: Priority,
) {
    let old = task.effective_priority.get(&*lock);
    if old == priority {
        return;
    }

    match *task.st.read(&*lock) {
        TaskSt::Ready => {
            let ready_queue = Traits::state().ready_queue();
            ready_queue.remove_task(lock.borrow_mut(), task, old);
            task.effective_priority.replace(&mut *lock, priority);
            // Safety: The task was just unlinked
            unsafe { ready_queue.push_back_task(lock.borrow_mut(), task) };
        }
        TaskSt::Blocked => {
            task.effective_priority.replace(&mut *lock, priority);
            wait::reorder_wait_of_task(lock.borrow_mut(), task);
        }
        _ => {
            task.effective_priority.replace(&mut *lock, priority);
        }
    }
}

/// Transition the task into the Ready state and enqueue it. This function
/// doesn't do any proper cleanup for a previous state. If the previous
/// state is `Dormant`, the caller must initialize the task state first by
/// calling `initialize_task_state`.
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    smp::apply_pending_migration(lock.borrow_mut(), task);

    task.st.replace(&mut *lock, TaskSt::Ready);

    // Safety: `task` is not in the ready queue
    unsafe {
        Traits::state()
            .ready_queue()
            .push_back_task(lock.borrow_mut(), task);
    }

    smp::notify_other_cores(lock.borrow_mut(), task);
}

/// Relinquish the kernel lock. After that, if there's a higher-priority
/// Ready task than the current core's running task, call
/// `PortThreading::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    let core = Traits::current_core();
    let prev_task_priority = match Traits::state().running_task(lock.borrow_mut(), core) {
        Some(t) if *t.st.read(&*lock) == TaskSt::Running => {
            Some(t.effective_priority.get(&*lock))
        }
        _ => None,
    };

    let has_preempting_task = match prev_task_priority {
        Some(p) => Traits::state()
            .ready_queue()
            .highest_ready_priority(lock.borrow_mut(), core)
            .map_or(false, |h| h > p),
        // No runnable current task; any dispatch decision is an improvement
        None => true,
    };

    drop(lock);

    if has_preempting_task {
        // Safety: Kernel lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Make a scheduling decision for `core` and update its running task.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    core: usize,
) {
    let prev_running_task = Traits::state().running_task(lock.borrow_mut(), core);
    let prev_task_priority = match prev_running_task {
        Some(t) if *t.st.read(&*lock) == TaskSt::Running => {
            Some(t.effective_priority.get(&*lock))
        }
        _ => None,
    };

    let decision = Traits::state()
        .ready_queue()
        .pop_front_task(lock.borrow_mut(), core, prev_task_priority);

    let next_running_task = match decision {
        ScheduleDecision::SwitchTo(task) => task,
        // There's no task willing to take over, and the current one can
        // still run
        ScheduleDecision::Keep => {
            debug_assert!(prev_task_priority.is_some());
            return;
        }
    };

    if let Some(task) = next_running_task {
        task.st.replace(&mut *lock, TaskSt::Running);
        task.assigned_core.replace(&mut *lock, Some(core));

        {
            let now = timeout::tick_count_locked::<Traits>(lock.borrow_mut());
            let telemetry = task.telemetry.write(&mut *lock);
            telemetry.dispatches += 1;
            telemetry.last_dispatched = now;
        }
        smp::count_dispatch(lock.borrow_mut(), core);

        if prev_running_task.map_or(false, |prev| core::ptr::eq(prev, task)) {
            // Skip the remaining steps if the task didn't change
            return;
        }
        log::trace!("core {}: dispatching {:?}", core, task.name());
    }

    // `prev_running_task` now loses control of the processor.
    if let Some(running_task) = prev_running_task {
        match *running_task.st.read(&*lock) {
            TaskSt::Running => {
                // Preempted while still runnable
                // Safety: The previous state is Running, so the task is not
                // queued
                unsafe { make_ready(lock.borrow_mut(), running_task) };
            }
            // Already parked in another state (Blocked, Suspended,
            // Terminated) or re-enqueued (Ready)
            _ => {}
        }
    }

    Traits::state()
        .set_running_task(lock.borrow_mut(), core, next_running_task);
}

/// Transition the currently running task into the Blocked state. Returns
/// when the task has been woken up *and* dispatched again.
///
/// The current context must be waitable (this function doesn't check that).
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert_eq!(expect_waitable_context::<Traits>(), Ok(()));

    let task = current_task_cb(lock.borrow_mut());
    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Running);
    task.st.replace(&mut *lock, TaskSt::Blocked);

    loop {
        // Temporarily release the kernel lock around the context switch.
        // Safety: (1) No lock-protected state is accessed in between.
        //         (2) The lock is currently held.
        //         (3) It is re-acquired before the loop continues.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: Kernel lock inactive
        unsafe { Traits::yield_cpu() };

        // Safety: See above
        unsafe { Traits::enter_cpu_lock() };

        if *task.st.read(&*lock) == TaskSt::Running {
            break;
        }
    }
}

/// Verify the canary words at the low end of a task's stack.
pub(crate) fn canary_intact<Traits: KernelTraits>(cb: &TaskCb<Traits>) -> bool {
    let stack = cb.stack_region();
    if stack.base().is_null() {
        return true;
    }
    // Safety: The stack region is live while the task exists
    unsafe {
        let words = stack.base() as *const u32;
        words.read_volatile() == STACK_CANARY && words.add(1).read_volatile() == STACK_CANARY
    }
}

/// Reclaim Terminated tasks: return their stacks to the port's stack
/// provider and free their control-block slots. Called from the idle task.
pub(crate) fn reap_terminated_tasks<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    for cb in Traits::task_cb_pool() {
        if *cb.st.read(&*lock) != TaskSt::Terminated {
            continue;
        }

        let stack = cb.stack_region();
        if stack.auto && !stack.base.is_null() {
            // Safety: Kernel lock active; the task is Terminated so the
            // stack is no longer in use
            unsafe {
                Traits::deallocate_memory(
                    core::ptr::NonNull::new_unchecked(stack.base),
                    stack.size,
                );
            }
        }
        // Safety: The task is detached from every kernel structure
        unsafe {
            *cb.stack.get() = StackRegion::INIT;
            *cb.entry_point.get() = None;
        }
        cb.st.replace(&mut *lock, TaskSt::Dormant);
        log::trace!("reaped task {:?}", cb.name());
    }
}
