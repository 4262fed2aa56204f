//! The Pico-RTOS kernel: a small preemptive real-time kernel for single- and
//! dual-core Cortex-M0+ class targets.
//!
//! The kernel is generic over a *kernel trait type* — an application-defined
//! type on which the application (via [`build_kernel!`]) and a port crate
//! (via its `use_port!` macro) implement the configuration and platform
//! traits. All kernel services are provided as associated functions of
//! [`System`]`<Traits>`.
//!
//! # Contexts
//!
//! - **Task context** — code running on a task's stack. All services are
//!   available; blocking services ([`System::sleep_ms`],
//!   [`System::lock_mutex`], …) are available only here.
//! - **Interrupt context** — the tick handler and application ISRs. Only
//!   non-blocking services may be used (`Timeout::Immediate`, `set_bits`,
//!   `give_semaphore`, …). Context switches requested from an interrupt are
//!   deferred until the outermost ISR returns.
//!
//! # Kernel lock
//!
//! There is one logical kernel lock (interrupts masked on the current core;
//! a spinlock between cores on dual-core builds). Every mutable kernel
//! structure is wrapped in a [`klock::CpuLockCell`], so access without the
//! lock token is a compile error rather than a race.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::{marker::PhantomData, mem, num::NonZeroUsize, ptr::NonNull};

pub mod error;
pub mod event_group;
mod idle;
mod klock;
pub mod mutex;
pub mod queue;
pub mod semaphore;
mod smp;
pub mod stream_buffer;
pub mod task;
pub mod timeout;
pub mod timer;
pub mod utils;
mod wait;

pub use self::{
    error::ResultCode,
    event_group::{EventBits, EventGroupCb, EventGroupId, EventWaitFlags},
    mutex::{MutexCb, MutexId},
    queue::{QueueCb, QueueId},
    semaphore::{SemaphoreCb, SemaphoreId},
    smp::{Affinity, CoreStats},
    stream_buffer::{StreamBufferCb, StreamBufferId, StreamGrant, StreamStats},
    task::{TaskCb, TaskId, TaskSt},
    timeout::Timeout,
    timer::{TimerCb, TimerId},
    utils::Init,
    wait::{BlockReason, WaitQueueStats},
};

/// Unsigned tick count. Ticks wrap around; they are compared through signed
/// differences so that ordering survives the wrap.
pub type UTicks = u32;

/// Task priority. Higher values are more urgent; priority 0 is reserved for
/// the per-core idle tasks.
pub type Priority = u8;

/// Object identifier: a 1-based index into the respective control block
/// pool.
pub type Id = NonZeroUsize;

/// The hard upper bound of [`KernelCfg::PRIORITY_LEVELS`] (one bitmap word).
pub const MAX_PRIORITY_LEVELS: usize = 32;

/// The hard upper bound of [`KernelCfg::NUM_CORES`].
pub const MAX_CORES: usize = 2;

/// The word written twice to the low end of every task stack and verified by
/// the idle task's integrity scan.
pub const STACK_CANARY: u32 = 0xdead_beef;

/// Implemented by a port on the kernel trait type to provide the threading
/// environment: interrupt masking, context switching, stack memory, and task
/// frame construction.
///
/// # Safety
///
/// Implementing this trait incorrectly breaks the kernel's memory safety.
/// Only meant to be implemented by a port crate's `use_port!` macro.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Port-specific per-task state. Placed at the very beginning of
    /// [`TaskCb`] so context-switch handlers can locate it by pointer.
    type PortTaskState: Send + Sync + Init + core::fmt::Debug + 'static;

    /// The initial value of [`Self::PortTaskState`] for each task.
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// The smallest stack size (bytes) `initialize_task_state` supports.
    const STACK_MIN_SIZE: usize;

    /// Required stack alignment (bytes).
    const STACK_ALIGN: usize;

    /// Acquire the kernel lock: mask interrupts on the current core and, on
    /// dual-core targets, take the inter-core spinlock.
    ///
    /// # Safety
    ///
    /// The lock must not already be held by the current context.
    unsafe fn enter_cpu_lock();

    /// Release the kernel lock, restoring the interrupt mask saved by the
    /// matching [`Self::enter_cpu_lock`].
    ///
    /// # Safety
    ///
    /// The lock must be held by the current context.
    unsafe fn leave_cpu_lock();

    /// Acquire the kernel lock, returning `false` if the current context
    /// already holds it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Whether the current context holds the kernel lock.
    fn is_cpu_lock_active() -> bool;

    /// Whether the current context is a task context.
    fn is_task_context() -> bool;

    /// Whether the current context is an interrupt context (the tick handler
    /// or an application ISR). The port tracks the interrupt nesting level;
    /// context switches requested while this is `true` are deferred until
    /// the outermost ISR returns.
    fn is_interrupt_context() -> bool;

    /// The zero-based identifier of the executing core.
    fn current_core() -> usize;

    /// Build the initial context of `task` so that its first dispatch enters
    /// the task's entry function, and a return from the entry function falls
    /// through to the kernel's exit trampoline.
    ///
    /// # Safety
    ///
    /// Kernel lock active; the task is being (re)initialized and is not
    /// runnable on any core.
    unsafe fn initialize_task_state(task: &'static task::TaskCb<Self>);

    /// Request a context switch on the current core (PendSV-equivalent).
    /// The switch happens immediately in a task context, or at the outermost
    /// ISR return in an interrupt context.
    ///
    /// # Safety
    ///
    /// Kernel lock inactive.
    unsafe fn yield_cpu();

    /// Request a scheduling pass on another core.
    ///
    /// # Safety
    ///
    /// May be called with the kernel lock active. `core` ≠ the current core.
    unsafe fn request_reschedule(core: usize);

    /// Discard the current context and dispatch the next task. Called when a
    /// task terminates itself.
    ///
    /// # Safety
    ///
    /// Kernel lock active; `task` was the running task of the current core
    /// and has already been detached from the scheduler.
    unsafe fn exit_and_dispatch(task: &'static task::TaskCb<Self>) -> !;

    /// Start scheduling: dispatch the task chosen by the first
    /// `choose_running_task` pass. Never returns.
    ///
    /// # Safety
    ///
    /// Kernel lock active; called exactly once per core at the end of boot.
    unsafe fn dispatch_first_task() -> !;

    /// Put the core to sleep until the next interrupt (`wfi`-equivalent).
    /// Called by the idle task with the kernel lock inactive.
    fn idle_wait();

    /// Obtain `size` bytes of kernel memory (task stacks, queue storage,
    /// stream rings), aligned to [`Self::STACK_ALIGN`]. The kernel never
    /// calls a global allocator itself.
    ///
    /// # Safety
    ///
    /// Kernel lock active.
    unsafe fn allocate_memory(size: usize) -> Option<NonNull<u8>>;

    /// Return memory obtained from [`Self::allocate_memory`].
    ///
    /// # Safety
    ///
    /// Kernel lock active; `ptr`/`size` came from `allocate_memory` and
    /// nothing references the region anymore.
    unsafe fn deallocate_memory(ptr: NonNull<u8>, size: usize);
}

/// Implemented by a port on the kernel trait type to provide the time base.
///
/// The port arranges for [`PortToKernel::timer_tick`] to be invoked once per
/// kernel tick (`1000 / KernelCfg::TICK_RATE_HZ` milliseconds).
///
/// # Safety
///
/// Only meant to be implemented by a port crate's `use_port!` macro.
pub unsafe trait PortTimer: Sized + 'static {
    /// A monotonic microsecond counter.
    fn microsecond_now() -> u64;
}

/// The combination of all port traits.
pub trait Port: PortThreading + PortTimer {}
impl<T: PortThreading + PortTimer> Port for T {}

/// Static kernel configuration, implemented on the kernel trait type by
/// [`build_kernel!`].
///
/// # Safety
///
/// The pool accessors must return pinned statics that live for the duration
/// of the program. Only meant to be implemented by [`build_kernel!`].
pub unsafe trait KernelCfg: Port {
    const NUM_TASKS: usize;
    const NUM_MUTEXES: usize;
    const NUM_SEMAPHORES: usize;
    const NUM_QUEUES: usize;
    const NUM_EVENT_GROUPS: usize;
    const NUM_STREAM_BUFFERS: usize;
    const NUM_TIMERS: usize;

    /// Number of priority levels (1..=[`MAX_PRIORITY_LEVELS`]). Priority 0
    /// is the idle priority; tasks are created with 1..PRIORITY_LEVELS.
    const PRIORITY_LEVELS: usize;

    /// 1 for uniprocessor builds, 2 for dual-core builds.
    const NUM_CORES: usize;

    /// Kernel ticks per second.
    const TICK_RATE_HZ: u32;

    /// Upper bound of timer callbacks dispatched by one tick; the remainder
    /// are deferred to the next tick.
    const MAX_TIMERS_PER_TICK: usize;

    /// Stack size of the per-core idle tasks.
    const IDLE_STACK_SIZE: usize;

    /// The idle task scans every task stack's canary words once per this
    /// many idle iterations.
    const CANARY_SCAN_INTERVAL: u32;

    /// Period (ticks) of the load-balance pass on dual-core builds.
    const LOAD_BALANCE_INTERVAL: UTicks;

    /// Smallest length (bytes) accepted by the stream-buffer zero-copy path.
    const ZERO_COPY_THRESHOLD: usize;

    /// The function invoked during boot, after the idle tasks exist and
    /// before the first dispatch. This is where the application creates its
    /// initial tasks and kernel objects.
    const STARTUP: fn();

    fn state() -> &'static State<Self>;
    fn task_cb_pool() -> &'static [task::TaskCb<Self>];
    fn mutex_cb_pool() -> &'static [mutex::MutexCb<Self>];
    fn semaphore_cb_pool() -> &'static [semaphore::SemaphoreCb<Self>];
    fn queue_cb_pool() -> &'static [queue::QueueCb<Self>];
    fn event_group_cb_pool() -> &'static [event_group::EventGroupCb<Self>];
    fn stream_buffer_cb_pool() -> &'static [stream_buffer::StreamBufferCb<Self>];
    fn timer_cb_pool() -> &'static [timer::TimerCb<Self>];

    #[inline]
    fn get_task_cb(i: usize) -> Option<&'static task::TaskCb<Self>> {
        Self::task_cb_pool().get(i)
    }
    #[inline]
    fn get_mutex_cb(i: usize) -> Option<&'static mutex::MutexCb<Self>> {
        Self::mutex_cb_pool().get(i)
    }
    #[inline]
    fn get_semaphore_cb(i: usize) -> Option<&'static semaphore::SemaphoreCb<Self>> {
        Self::semaphore_cb_pool().get(i)
    }
    #[inline]
    fn get_queue_cb(i: usize) -> Option<&'static queue::QueueCb<Self>> {
        Self::queue_cb_pool().get(i)
    }
    #[inline]
    fn get_event_group_cb(i: usize) -> Option<&'static event_group::EventGroupCb<Self>> {
        Self::event_group_cb_pool().get(i)
    }
    #[inline]
    fn get_stream_buffer_cb(i: usize) -> Option<&'static stream_buffer::StreamBufferCb<Self>> {
        Self::stream_buffer_cb_pool().get(i)
    }
    #[inline]
    fn get_timer_cb(i: usize) -> Option<&'static timer::TimerCb<Self>> {
        Self::timer_cb_pool().get(i)
    }
}

/// The combination of every trait a fully-wired kernel trait type
/// implements.
pub trait KernelTraits: Port + KernelCfg + 'static {}
impl<T: Port + KernelCfg + 'static> KernelTraits for T {}

/// The facade through which every kernel service is invoked:
/// `System::<Traits>::create_task(…)`, `System::<Traits>::sleep_ms(…)`, ….
pub struct System<Traits>(PhantomData<Traits>);

/// Kernel entry points invoked by the port.
///
/// # Safety
///
/// These methods are only meant to be called by the port, from the contexts
/// documented on each method.
pub trait PortToKernel {
    /// Boot the kernel on the primary core: create the idle tasks, run the
    /// application startup function, elect the first task and dispatch it.
    ///
    /// # Safety
    ///
    /// Kernel lock active; called exactly once, on core 0.
    unsafe fn boot() -> !;

    /// Boot a secondary core: elect its first task and dispatch it.
    ///
    /// # Safety
    ///
    /// Kernel lock active; called exactly once per secondary core, after
    /// [`Self::boot`] has initialized the kernel.
    unsafe fn secondary_boot() -> !;

    /// Make a scheduling decision for the current core and update its
    /// running task. Called from the context-switch handler.
    ///
    /// # Safety
    ///
    /// Kernel lock active.
    unsafe fn choose_running_task();

    /// The tick handler. Called by the port's tick source once per tick,
    /// from an interrupt context with the kernel lock inactive.
    ///
    /// # Safety
    ///
    /// Must only be called by the port's tick source.
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: The port entered the kernel lock before calling us
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        timeout::init_timebase(lock.borrow_mut());
        idle::create_idle_tasks(lock.borrow_mut());

        // Run the application startup function outside the kernel lock so
        // that it can use the ordinary object-creation services.
        drop(lock);
        (Traits::STARTUP)();
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        log::debug!("kernel boot: dispatching the first task");
        task::choose_next_running_task(lock.borrow_mut(), Traits::current_core());
        mem::forget(lock);

        // Safety: Kernel lock active, boot context
        unsafe { Traits::dispatch_first_task() }
    }

    unsafe fn secondary_boot() -> ! {
        // Safety: The port entered the kernel lock before calling us
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        task::choose_next_running_task(lock.borrow_mut(), Traits::current_core());
        mem::forget(lock);

        // Safety: Kernel lock active, boot context
        unsafe { Traits::dispatch_first_task() }
    }

    unsafe fn choose_running_task() {
        // Safety: The port holds the kernel lock while calling us
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        task::choose_next_running_task(lock.borrow_mut(), Traits::current_core());
        // The port retains the lock across this call
        mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}

/// The global state of one kernel instance. Instantiated as a static by
/// [`build_kernel!`].
pub struct State<Traits: PortThreading> {
    /// Per-core scheduler states. Only the first
    /// [`KernelCfg::NUM_CORES`] entries are used.
    cores: [CoreState<Traits>; MAX_CORES],

    /// The global ready queue, shared by every core.
    ready_queue: task::readyqueue::ReadyQueue<Traits>,

    /// The time base and the software timer list.
    timeouts: timeout::TimeoutGlobals<Traits>,
    timers: timer::TimerGlobals<Traits>,

    /// The diagnostic error ring described in the error-handling design.
    errors: error::ErrorLog<Traits>,

    /// Hook invoked when the idle task detects a corrupted stack canary.
    stack_overflow_hook: klock::CpuLockCell<Traits, Option<fn(TaskId, &'static str)>>,
}

impl<Traits: PortThreading> Init for State<Traits> {
    const INIT: Self = Self {
        cores: Init::INIT,
        ready_queue: Init::INIT,
        timeouts: Init::INIT,
        timers: Init::INIT,
        errors: Init::INIT,
        stack_overflow_hook: klock::CpuLockCell::new(None),
    };
}

/// Scheduler state of one core.
pub(crate) struct CoreState<Traits: PortThreading> {
    /// The task currently running on this core. Held in a [`utils::RawCell`]
    /// rather than a `CpuLockCell` so that a port's context-switch handler
    /// can locate it from assembler code ([`State::running_task_ptr`]); all
    /// Rust-side accesses still go through the lock token.
    running_task: utils::RawCell<Option<&'static task::TaskCb<Traits>>>,

    /// This core's idle task, once created.
    idle_task: klock::CpuLockCell<Traits, Option<&'static task::TaskCb<Traits>>>,

    stats: klock::CpuLockCell<Traits, smp::CoreStats>,
}

impl<Traits: PortThreading> Init for CoreState<Traits> {
    const INIT: Self = Self {
        running_task: utils::RawCell::new(None),
        idle_task: klock::CpuLockCell::new(None),
        stats: klock::CpuLockCell::new(CoreStats::INIT),
    };
}

impl<Traits: PortThreading> State<Traits> {
    /// The task currently running on `core`.
    pub(crate) fn running_task(
        &self,
        _lock: klock::CpuLockTokenRefMut<'_, Traits>,
        core: usize,
    ) -> Option<&'static task::TaskCb<Traits>> {
        // Safety: The lock token proves the kernel lock is held
        unsafe { *self.cores[core].running_task.get() }
    }

    pub(crate) fn set_running_task(
        &self,
        _lock: klock::CpuLockTokenRefMut<'_, Traits>,
        core: usize,
        task: Option<&'static task::TaskCb<Traits>>,
    ) {
        // Safety: The lock token proves the kernel lock is held
        unsafe { *self.cores[core].running_task.get() = task };
    }

    /// A raw pointer to `core`'s running-task slot, for use by a port's
    /// context-switch handler.
    pub fn running_task_ptr(
        &self,
        core: usize,
    ) -> *mut Option<&'static task::TaskCb<Traits>> {
        self.cores[core].running_task.get()
    }

    pub(crate) fn core(&self, core: usize) -> &CoreState<Traits> {
        &self.cores[core]
    }

    pub(crate) fn ready_queue(&self) -> &task::readyqueue::ReadyQueue<Traits> {
        &self.ready_queue
    }

    pub(crate) fn timeouts(&self) -> &timeout::TimeoutGlobals<Traits> {
        &self.timeouts
    }

    pub(crate) fn timers(&self) -> &timer::TimerGlobals<Traits> {
        &self.timers
    }

    pub(crate) fn errors(&self) -> &error::ErrorLog<Traits> {
        &self.errors
    }

    pub(crate) fn stack_overflow_hook(
        &self,
    ) -> &klock::CpuLockCell<Traits, Option<fn(TaskId, &'static str)>> {
        &self.stack_overflow_hook
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// The current value of the monotonic tick counter.
    pub fn tick_count() -> UTicks {
        timeout::tick_count::<Traits>()
    }

    /// Milliseconds since boot, derived from the tick counter.
    pub fn time_ms() -> u64 {
        Self::tick_count() as u64 * 1000 / Traits::TICK_RATE_HZ as u64
    }

    /// Microseconds since boot, from the platform's monotonic counter.
    pub fn uptime_us() -> u64 {
        timeout::uptime_us::<Traits>()
    }

    /// Install the handler invoked when a stack canary check fails. The
    /// handler runs in the idle task's context after the offending task has
    /// been forced to the Terminated state; the default behavior (no
    /// handler) is to halt the core.
    pub fn set_stack_overflow_hook(hook: fn(TaskId, &'static str)) {
        if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
            Traits::state()
                .stack_overflow_hook()
                .replace(&mut *lock, Some(hook));
        }
    }

    /// Scheduling statistics of one core.
    pub fn core_stats(core: usize) -> Option<CoreStats> {
        if core >= Traits::NUM_CORES {
            return None;
        }
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        Some(Traits::state().core(core).stats.get(&*lock.borrow_mut()))
    }
}

/// Convert a pool slot index to a 1-based object [`Id`].
#[inline]
pub(crate) fn id_from_index(i: usize) -> Id {
    // Never fails: pool indices are bounded well below `usize::MAX`
    NonZeroUsize::new(i + 1).unwrap()
}

/// Instantiate the kernel's static state on a kernel trait type and
/// implement [`KernelCfg`] on it.
///
/// ```ignore
/// pico_port_std::use_port!(unsafe struct SystemTraits);
/// pico_kernel::build_kernel! {
///     kernel SystemTraits {
///         max_tasks: 8,
///         priority_levels: 16,
///         num_cores: 1,
///         tick_rate_hz: 1000,
///         max_mutexes: 4,
///         max_semaphores: 4,
///         max_queues: 4,
///         max_event_groups: 4,
///         max_stream_buffers: 4,
///         max_timers: 8,
///         startup: app_startup,
///     }
/// }
/// ```
#[macro_export]
macro_rules! build_kernel {
    (
        kernel $Traits:ty {
            max_tasks: $max_tasks:expr,
            priority_levels: $priority_levels:expr,
            num_cores: $num_cores:expr,
            tick_rate_hz: $tick_rate_hz:expr,
            max_mutexes: $max_mutexes:expr,
            max_semaphores: $max_semaphores:expr,
            max_queues: $max_queues:expr,
            max_event_groups: $max_event_groups:expr,
            max_stream_buffers: $max_stream_buffers:expr,
            max_timers: $max_timers:expr,
            startup: $startup:expr
            $(, idle_stack_size: $idle_stack_size:expr )?
            $(, canary_scan_interval: $canary_scan_interval:expr )?
            $(, load_balance_interval: $load_balance_interval:expr )?
            $(, zero_copy_threshold: $zero_copy_threshold:expr )?
            $(, max_timers_per_tick: $max_timers_per_tick:expr )?
            $(,)?
        }
    ) => {
        const _: () = {
            use $crate::utils::Init;

            static KERNEL_STATE: $crate::State<$Traits> = Init::INIT;
            static TASK_CB_POOL: [$crate::task::TaskCb<$Traits>; $max_tasks] =
                [const { Init::INIT }; $max_tasks];
            static MUTEX_CB_POOL: [$crate::mutex::MutexCb<$Traits>; $max_mutexes] =
                [const { Init::INIT }; $max_mutexes];
            static SEMAPHORE_CB_POOL: [$crate::semaphore::SemaphoreCb<$Traits>;
                $max_semaphores] = [const { Init::INIT }; $max_semaphores];
            static QUEUE_CB_POOL: [$crate::queue::QueueCb<$Traits>; $max_queues] =
                [const { Init::INIT }; $max_queues];
            static EVENT_GROUP_CB_POOL: [$crate::event_group::EventGroupCb<$Traits>;
                $max_event_groups] = [const { Init::INIT }; $max_event_groups];
            static STREAM_BUFFER_CB_POOL: [$crate::stream_buffer::StreamBufferCb<$Traits>;
                $max_stream_buffers] = [const { Init::INIT }; $max_stream_buffers];
            static TIMER_CB_POOL: [$crate::timer::TimerCb<$Traits>; $max_timers] =
                [const { Init::INIT }; $max_timers];

            // Safety: We are `build_kernel!`, so it's okay to implement this
            unsafe impl $crate::KernelCfg for $Traits {
                const NUM_TASKS: usize = $max_tasks;
                const NUM_MUTEXES: usize = $max_mutexes;
                const NUM_SEMAPHORES: usize = $max_semaphores;
                const NUM_QUEUES: usize = $max_queues;
                const NUM_EVENT_GROUPS: usize = $max_event_groups;
                const NUM_STREAM_BUFFERS: usize = $max_stream_buffers;
                const NUM_TIMERS: usize = $max_timers;
                const PRIORITY_LEVELS: usize = {
                    assert!(
                        $priority_levels >= 2
                            && $priority_levels <= $crate::MAX_PRIORITY_LEVELS
                    );
                    $priority_levels
                };
                const NUM_CORES: usize = {
                    assert!($num_cores >= 1 && $num_cores <= $crate::MAX_CORES);
                    $num_cores
                };
                const TICK_RATE_HZ: u32 = $tick_rate_hz;
                const MAX_TIMERS_PER_TICK: usize =
                    $crate::__kernel_cfg_default!($($max_timers_per_tick)?, 16);
                const IDLE_STACK_SIZE: usize =
                    $crate::__kernel_cfg_default!($($idle_stack_size)?, 4096);
                const CANARY_SCAN_INTERVAL: u32 =
                    $crate::__kernel_cfg_default!($($canary_scan_interval)?, 64);
                const LOAD_BALANCE_INTERVAL: $crate::UTicks =
                    $crate::__kernel_cfg_default!($($load_balance_interval)?, 100);
                const ZERO_COPY_THRESHOLD: usize =
                    $crate::__kernel_cfg_default!($($zero_copy_threshold)?, 64);
                const STARTUP: fn() = $startup;

                #[inline]
                fn state() -> &'static $crate::State<$Traits> {
                    &KERNEL_STATE
                }
                #[inline]
                fn task_cb_pool() -> &'static [$crate::task::TaskCb<$Traits>] {
                    &TASK_CB_POOL
                }
                #[inline]
                fn mutex_cb_pool() -> &'static [$crate::mutex::MutexCb<$Traits>] {
                    &MUTEX_CB_POOL
                }
                #[inline]
                fn semaphore_cb_pool() -> &'static [$crate::semaphore::SemaphoreCb<$Traits>] {
                    &SEMAPHORE_CB_POOL
                }
                #[inline]
                fn queue_cb_pool() -> &'static [$crate::queue::QueueCb<$Traits>] {
                    &QUEUE_CB_POOL
                }
                #[inline]
                fn event_group_cb_pool(
                ) -> &'static [$crate::event_group::EventGroupCb<$Traits>] {
                    &EVENT_GROUP_CB_POOL
                }
                #[inline]
                fn stream_buffer_cb_pool(
                ) -> &'static [$crate::stream_buffer::StreamBufferCb<$Traits>] {
                    &STREAM_BUFFER_CB_POOL
                }
                #[inline]
                fn timer_cb_pool() -> &'static [$crate::timer::TimerCb<$Traits>] {
                    &TIMER_CB_POOL
                }
            }
        };
    };
}

/// Internal helper for [`build_kernel!`] — selects an explicitly-provided
/// configuration value or the default.
#[doc(hidden)]
#[macro_export]
macro_rules! __kernel_cfg_default {
    ($value:expr, $default:expr) => {
        $value
    };
    (, $default:expr) => {
        $default
    };
}
