//! Simulation environment for running the Pico-RTOS kernel on a hosted
//! target.
//!
//! Each kernel task is backed by an OS thread, but only one of them — the
//! one the kernel elected as the running task — executes at any moment.
//! Displaced threads park on a scheduler condition variable and are only
//! released when the kernel elects their task again, which every thread
//! double-checks before entering the kernel lock. Preemption therefore
//! takes effect at the preempted task's next kernel entry, which is
//! sufficient for kernel semantics because every observable hand-over
//! happens at a kernel service boundary anyway.
//!
//! The tick source is a real-time timer thread that plays the role of the
//! tick interrupt: it waits for the kernel lock to be free, claims
//! interrupt precedence (task threads cannot take the lock while it is
//! active, emulating interrupt priority), invokes the kernel tick handler,
//! and performs any context switch the handler requested — the moral
//! equivalent of PendSV firing at the outermost interrupt return.
use spin::Mutex as SpinMutex;
use std::{
    cell::Cell,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Condvar, Mutex, MutexGuard, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use pico_kernel::{KernelTraits, PortThreading, PortToKernel, TaskCb};

#[doc(hidden)]
pub use pico_kernel;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState> + PortToKernel
{
    fn port_state() -> &'static State;
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The thread that runs the kernel boot phase.
    Boot,
    /// The timer thread, standing in for interrupt context.
    Interrupt,
    /// The backing thread of a task.
    Task,
}

thread_local! {
    /// The current thread's role, assigned when the port creates the
    /// thread.
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };

    /// For task threads: the address of the backed `TaskCb`.
    static THREAD_TASK: Cell<usize> = const { Cell::new(0) };

    /// For task threads: the control-block incarnation this thread backs.
    /// A recycled slot gets a new incarnation, so the thread of a deleted
    /// task can never be mistaken for the thread of its successor.
    static THREAD_GENERATION: Cell<u32> = const { Cell::new(0) };
}

/// Port-specific per-task state.
#[derive(Debug)]
pub struct TaskState {
    /// Whether a backing thread currently exists for this control block.
    ///
    /// Accessed with the scheduler lock held, so `SpinMutex` is
    /// sufficient.
    live: SpinMutex<bool>,

    /// Bumped every time the control block is (re)initialized for a task.
    generation: AtomicU32,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            live: SpinMutex::new(false),
            generation: AtomicU32::new(0),
        }
    }
}

/// Whether the calling task thread still backs the elected incarnation of
/// the current task. Relies on `TaskState` being the first field of the
/// `#[repr(C)]` task control block.
fn thread_backs_current_task(g: &SchedInner) -> bool {
    let me = THREAD_TASK.with(|t| t.get());
    if g.current != Some(me) {
        return false;
    }
    // Safety: `me` is the address of a control block in a static pool, and
    // the port task state sits at its start
    let task_state = unsafe { &*(me as *const TaskState) };
    task_state.generation.load(Ordering::Relaxed) == THREAD_GENERATION.with(|g| g.get())
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

impl pico_kernel::Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

struct SchedInner {
    /// The kernel lock flag (PRIMASK-equivalent).
    cpu_lock: bool,
    cpu_lock_owner: Option<thread::ThreadId>,

    /// The address of the `TaskCb` whose backing thread may run.
    current: Option<usize>,

    /// Set between `dispatch_first_task` and shutdown.
    started: bool,

    /// The timer thread is between "interrupt entry" and "interrupt
    /// return"; task threads must not take the kernel lock.
    int_active: bool,

    /// A context switch was requested from interrupt context and is
    /// honored at "interrupt return".
    dispatch_pending: bool,
}

struct Sched {
    m: Mutex<SchedInner>,
    cv: Condvar,
}

/// The internal state of the port.
pub struct State {
    sched: OnceLock<Sched>,
    origin: OnceLock<Instant>,
    shutdown: AtomicBool,
}

impl State {
    pub const fn new() -> Self {
        Self {
            sched: OnceLock::new(),
            origin: OnceLock::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn sched(&self) -> &Sched {
        self.sched.get_or_init(|| Sched {
            m: Mutex::new(SchedInner {
                cpu_lock: false,
                cpu_lock_owner: None,
                current: None,
                started: false,
                int_active: false,
                dispatch_pending: false,
            }),
            cv: Condvar::new(),
        })
    }

    fn guard(&self) -> MutexGuard<'_, SchedInner> {
        self.sched().m.lock().unwrap()
    }

    /// Boot the kernel and run it until [`shutdown`] is called. The kernel
    /// itself runs on dedicated threads; the calling thread blocks.
    pub fn port_boot<Traits: PortInstance>(&'static self) {
        self.origin.get_or_init(Instant::now);
        self.sched();
        self.shutdown.store(false, Ordering::SeqCst);

        log::trace!("starting the boot thread");
        thread::Builder::new()
            .name("kernel-boot".to_owned())
            .spawn(|| {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));
                // Safety: We are the port; boot expects the lock held
                unsafe {
                    <Traits as PortThreading>::enter_cpu_lock();
                    <Traits as PortToKernel>::boot();
                }
            })
            .unwrap();

        // The timer thread delivers a tick once per tick period, real time
        let tick_period =
            Duration::from_nanos(1_000_000_000 / Traits::TICK_RATE_HZ.max(1) as u64);
        log::trace!("starting the timer thread ({:?} per tick)", tick_period);
        let timer_join = thread::Builder::new()
            .name("kernel-tick".to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
                while !self.shutdown.load(Ordering::SeqCst) {
                    thread::sleep(tick_period);
                    self.inject_tick::<Traits>();
                }
            })
            .unwrap();

        // Wait for shutdown
        let sched = self.sched();
        let mut g = self.guard();
        while !self.shutdown.load(Ordering::SeqCst) {
            let (next, _) = sched
                .cv
                .wait_timeout(g, Duration::from_millis(50))
                .unwrap();
            g = next;
        }
        drop(g);

        timer_join.join().unwrap();
        log::trace!("port shut down");
    }

    /// Initiate shutdown: [`port_boot`] returns, the timer thread stops.
    /// Task threads that are parked stay parked and are leaked.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(sched) = self.sched.get() {
            drop(sched.m.lock());
            sched.cv.notify_all();
        }
    }

    /// Deliver one tick, emulating a timer interrupt.
    fn inject_tick<Traits: PortInstance>(&'static self) {
        let sched = self.sched();
        {
            let mut g = self.guard();
            if !g.started || self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            // An interrupt cannot preempt a critical section; wait until
            // the lock is free, then claim interrupt precedence
            while g.cpu_lock {
                g = sched.cv.wait(g).unwrap();
            }
            g.int_active = true;
        }

        // Safety: We are the port's tick source
        unsafe { <Traits as PortToKernel>::timer_tick() };

        let dispatch_pending = {
            let mut g = self.guard();
            g.int_active = false;
            sched.cv.notify_all();
            std::mem::take(&mut g.dispatch_pending)
        };

        // "Interrupt return": honor a switch requested by the handler
        if dispatch_pending {
            self.dispatch::<Traits>();
        }
    }

    /// Run the kernel's scheduling pass and transfer control to the task it
    /// elected. If the calling thread is a task thread that lost the
    /// processor, it parks here until re-elected.
    fn dispatch<Traits: PortInstance>(&'static self) {
        let sched = self.sched();

        // Safety: We are the port; `choose_running_task` wants the lock
        unsafe { <Traits as PortThreading>::enter_cpu_lock() };
        // Safety: Kernel lock active
        unsafe { <Traits as PortToKernel>::choose_running_task() };
        // Publish the decision while still holding the kernel lock, so
        // concurrent dispatchers cannot interleave stale elections
        {
            // Safety: Kernel lock active, so the cell is stable
            let next = unsafe { *Traits::state().running_task_ptr(0) };
            let mut g = self.guard();
            g.current = next.map(|cb| cb as *const TaskCb<Traits> as usize);
            if let Some(cb) = next {
                self.spawn_backing_thread_if_needed::<Traits>(cb);
            }
            sched.cv.notify_all();
        }
        // Safety: We hold the kernel lock
        unsafe { <Traits as PortThreading>::leave_cpu_lock() };

        if THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task {
            let mut g = self.guard();
            while !thread_backs_current_task(&g) && !self.shutdown.load(Ordering::SeqCst) {
                g = sched.cv.wait(g).unwrap();
            }
        }
    }

    /// Create the OS thread backing `cb`, if it doesn't exist yet. Called
    /// with the kernel lock held.
    fn spawn_backing_thread_if_needed<Traits: PortInstance>(
        &'static self,
        cb: &'static TaskCb<Traits>,
    ) {
        let mut live = cb.port_task_state.live.lock();
        if *live {
            return;
        }
        *live = true;
        let generation = cb.port_task_state.generation.load(Ordering::Relaxed);

        log::trace!("spawning a thread for task {:?}", cb.name());
        thread::Builder::new()
            .name(format!("task-{}", cb.name()))
            .spawn(move || task_thread_body::<Traits>(cb, generation))
            .unwrap();
    }

    unsafe fn enter_cpu_lock<Traits: PortInstance>(&self) {
        let sched = self.sched();
        let me = thread::current().id();
        let role = THREAD_ROLE.with(|role| role.get());

        let mut g = self.guard();
        assert_ne!(g.cpu_lock_owner, Some(me), "the kernel lock is not recursive");
        while !lock_obtainable(&g, role, me) {
            g = sched.cv.wait(g).unwrap();
        }
        g.cpu_lock = true;
        g.cpu_lock_owner = Some(me);
    }

    unsafe fn try_enter_cpu_lock<Traits: PortInstance>(&self) -> bool {
        let sched = self.sched();
        let me = thread::current().id();
        let role = THREAD_ROLE.with(|role| role.get());

        let mut g = self.guard();
        if g.cpu_lock_owner == Some(me) {
            // Already held by this context
            return false;
        }
        while !lock_obtainable(&g, role, me) {
            g = sched.cv.wait(g).unwrap();
        }
        g.cpu_lock = true;
        g.cpu_lock_owner = Some(me);
        true
    }

    unsafe fn leave_cpu_lock<Traits: PortInstance>(&self) {
        let sched = self.sched();
        let mut g = self.guard();
        debug_assert!(g.cpu_lock);
        g.cpu_lock = false;
        g.cpu_lock_owner = None;
        drop(g);
        sched.cv.notify_all();
    }

    fn is_cpu_lock_active(&self) -> bool {
        if self.sched.get().is_none() {
            return false;
        }
        self.guard().cpu_lock_owner == Some(thread::current().id())
    }

    fn microsecond_now(&self) -> u64 {
        self.origin.get_or_init(Instant::now).elapsed().as_micros() as u64
    }

    fn idle_wait(&self) {
        // Let the timer thread run; the next kernel entry parks us if the
        // idle task lost the processor meanwhile
        thread::sleep(Duration::from_micros(50));
    }
}

/// Whether a thread of the given role may take the kernel lock now: the
/// lock must be free, interrupt precedence must be respected, and a
/// preempted task thread must first be re-elected (its next kernel entry is
/// its preemption point).
fn lock_obtainable(g: &SchedInner, role: ThreadRole, _me: thread::ThreadId) -> bool {
    if g.cpu_lock {
        return false;
    }
    match role {
        ThreadRole::Interrupt => true,
        ThreadRole::Task => !g.int_active && (!g.started || thread_backs_current_task(g)),
        ThreadRole::Boot | ThreadRole::Unknown => !g.int_active,
    }
}

fn task_thread_body<Traits: PortInstance>(cb: &'static TaskCb<Traits>, generation: u32) {
    THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
    THREAD_TASK.with(|t| t.set(cb as *const TaskCb<Traits> as usize));
    THREAD_GENERATION.with(|g| g.set(generation));

    let state = Traits::port_state();
    let sched = state.sched();

    // Wait to be elected for the first time
    {
        let mut g = state.guard();
        while !thread_backs_current_task(&g) && !state.shutdown.load(Ordering::SeqCst) {
            g = sched.cv.wait(g).unwrap();
        }
        if state.shutdown.load(Ordering::SeqCst) {
            return;
        }
    }

    log::debug!("task {:?} is now running", cb.name());

    if let Some(entry) = cb.entry_point() {
        entry(cb.entry_param());
    }

    // The entry function returned; terminate the task through the kernel
    pico_kernel::task::task_exit_trampoline::<Traits>()
}

/// These are `State`'s entry points for the `PortThreading` impl generated
/// by [`use_port!`]. Keeping them on inherent methods lets the macro body
/// stay minimal.
impl State {
    #[doc(hidden)]
    pub unsafe fn port_enter_cpu_lock<Traits: PortInstance>(&self) {
        // Safety: Forwarded contract
        unsafe { self.enter_cpu_lock::<Traits>() }
    }

    #[doc(hidden)]
    pub unsafe fn port_leave_cpu_lock<Traits: PortInstance>(&self) {
        // Safety: Forwarded contract
        unsafe { self.leave_cpu_lock::<Traits>() }
    }

    #[doc(hidden)]
    pub unsafe fn port_try_enter_cpu_lock<Traits: PortInstance>(&self) -> bool {
        // Safety: Forwarded contract
        unsafe { self.try_enter_cpu_lock::<Traits>() }
    }

    #[doc(hidden)]
    pub fn port_is_cpu_lock_active(&self) -> bool {
        self.is_cpu_lock_active()
    }

    #[doc(hidden)]
    pub fn port_is_task_context(&self) -> bool {
        THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task
    }

    #[doc(hidden)]
    pub fn port_is_interrupt_context(&self) -> bool {
        THREAD_ROLE.with(|role| role.get()) == ThreadRole::Interrupt
    }

    #[doc(hidden)]
    pub unsafe fn port_yield_cpu<Traits: PortInstance>(&'static self) {
        {
            let mut g = self.guard();
            if !g.started {
                // Nothing to switch before the first dispatch
                return;
            }
            if self.port_is_interrupt_context() {
                // Deferred to the outermost "interrupt return"
                g.dispatch_pending = true;
                return;
            }
        }
        self.dispatch::<Traits>();
    }

    #[doc(hidden)]
    pub unsafe fn port_exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        task: &'static TaskCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch({:?})", task.name());

        // Allow the control-block slot to be recycled with a fresh thread
        *task.port_task_state.live.lock() = false;

        // We arrive here with the kernel lock held; elect the next task
        // Safety: Kernel lock active
        unsafe { <Traits as PortToKernel>::choose_running_task() };
        {
            // Safety: Kernel lock active, so the cell is stable
            let next = unsafe { *Traits::state().running_task_ptr(0) };
            let mut g = self.guard();
            g.current = next.map(|cb| cb as *const TaskCb<Traits> as usize);
            if let Some(cb) = next {
                self.spawn_backing_thread_if_needed::<Traits>(cb);
            }
            self.sched().cv.notify_all();
        }
        // Safety: We hold the kernel lock
        unsafe { <Traits as PortThreading>::leave_cpu_lock() };

        // This thread's task is gone; the thread itself is parked forever
        loop {
            thread::park();
        }
    }

    #[doc(hidden)]
    pub unsafe fn port_dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");

        {
            let mut g = self.guard();
            g.started = true;
        }
        // Safety: Kernel lock active (boot contract); the kernel already
        // elected the first task
        let next = unsafe { *Traits::state().running_task_ptr(0) };
        {
            let mut g = self.guard();
            g.current = next.map(|cb| cb as *const TaskCb<Traits> as usize);
            if let Some(cb) = next {
                self.spawn_backing_thread_if_needed::<Traits>(cb);
            }
            self.sched().cv.notify_all();
        }
        // Safety: We hold the kernel lock
        unsafe { <Traits as PortThreading>::leave_cpu_lock() };

        // The boot phase is over; this thread is parked forever
        loop {
            thread::park();
        }
    }

    #[doc(hidden)]
    pub fn port_idle_wait(&self) {
        self.idle_wait();
    }

    #[doc(hidden)]
    pub fn port_microsecond_now(&self) -> u64 {
        self.microsecond_now()
    }

    #[doc(hidden)]
    pub unsafe fn port_allocate_memory(&self, size: usize) -> Option<NonNull<u8>> {
        let boxed = vec![0u8; size.max(1)].into_boxed_slice();
        NonNull::new(Box::into_raw(boxed) as *mut u8)
    }

    #[doc(hidden)]
    pub unsafe fn port_deallocate_memory(&self, ptr: NonNull<u8>, size: usize) {
        // Safety: Produced by `port_allocate_memory` with the same size
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                ptr.as_ptr(),
                size.max(1),
            )));
        }
    }

    #[doc(hidden)]
    pub unsafe fn port_initialize_task_state<Traits: PortInstance>(
        &self,
        task: &'static TaskCb<Traits>,
    ) {
        // A new incarnation: the backing thread is created lazily at first
        // dispatch, and any thread left over from a previous task in this
        // slot can no longer be elected
        task.port_task_state.generation.fetch_add(1, Ordering::Relaxed);
        *task.port_task_state.live.lock() = false;
    }
}

/// Boot the kernel instance bound to `Traits` and block until
/// [`shutdown`] is called.
pub fn boot<Traits: PortInstance>() {
    Traits::port_state().port_boot::<Traits>();
}

/// Shut the kernel instance bound to `Traits` down, unblocking
/// [`boot`].
pub fn shutdown<Traits: PortInstance>() {
    Traits::port_state().request_shutdown();
}

/// Implement the port traits on a kernel trait type.
///
/// ```ignore
/// pico_port_std::use_port!(unsafe struct SystemTraits);
/// pico_kernel::build_kernel! {
///     kernel SystemTraits { /* … */ }
/// }
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::pico_kernel::{PortThreading, PortTimer, TaskCb};
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelCfg` (provided by `build_kernel!`)
            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: TaskState = TaskState::new();
                const STACK_MIN_SIZE: usize = 64;
                const STACK_ALIGN: usize = 16;

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.port_enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.port_leave_cpu_lock::<Self>() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.port_try_enter_cpu_lock::<Self>() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.port_is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.port_is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.port_is_interrupt_context()
                }

                fn current_core() -> usize {
                    0
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.port_initialize_task_state::<Self>(task) }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.port_yield_cpu::<Self>() }
                }

                unsafe fn request_reschedule(core: usize) {
                    // The simulator executes everything on one core
                    let _ = core;
                }

                unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> ! {
                    unsafe { PORT_STATE.port_exit_and_dispatch::<Self>(task) }
                }

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.port_dispatch_first_task::<Self>() }
                }

                fn idle_wait() {
                    PORT_STATE.port_idle_wait()
                }

                unsafe fn allocate_memory(
                    size: usize,
                ) -> Option<core::ptr::NonNull<u8>> {
                    unsafe { PORT_STATE.port_allocate_memory(size) }
                }

                unsafe fn deallocate_memory(ptr: core::ptr::NonNull<u8>, size: usize) {
                    unsafe { PORT_STATE.port_deallocate_memory(ptr, size) }
                }
            }

            unsafe impl PortTimer for $SystemTraits {
                fn microsecond_now() -> u64 {
                    PORT_STATE.port_microsecond_now()
                }
            }
        }
    };
}
