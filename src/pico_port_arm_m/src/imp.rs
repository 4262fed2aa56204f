//! The port implementation proper. Only builds for bare-metal targets.
use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use cortex_m::peripheral::{scb::SystemHandler, syst::SystClkSource, SCB};
use pico_kernel::{KernelTraits, PortThreading, PortToKernel, TaskCb};

use crate::{heap::FreeList, ThreadingOptions};

/// Implemented on a kernel trait type by [`use_port!`](crate::use_port).
///
/// # Safety
///
/// Only meant to be implemented by `use_port!`.
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState> + PortToKernel + ThreadingOptions
{
    fn port_state() -> &'static State;

    /// The kernel heap arena created by `use_port!`.
    fn heap_arena() -> (*mut u8, usize);
}

/// Port-specific per-task state: the saved process stack pointer.
///
/// `TaskCb` guarantees this sits at offset 0, which is what lets
/// [`switch_context`] store and load it with one pointer indirection.
#[derive(Debug)]
#[repr(C)]
pub struct TaskState {
    sp: UnsafeCell<u32>,
}

// Safety: Only touched by the context-switch path, with interrupts masked.
unsafe impl Sync for TaskState {}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            sp: UnsafeCell::new(0),
        }
    }
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

/// The number of `u32`s in the scratch area that absorbs the register save
/// of the boot context's one and only PendSV entry.
const BOOT_SCRATCH_WORDS: usize = 16;

/// The internal state of the port.
pub struct State {
    /// The kernel memory free list. Guarded by the kernel lock.
    heap: UnsafeCell<FreeList>,

    /// Set by `dispatch_first_task`; cleared never. Before this, PendSV and
    /// the kernel tick stay dormant.
    started: AtomicBool,

    /// Per-core flag: the first context switch discards the boot context
    /// instead of saving it.
    boot_context_discarded: [AtomicBool; 2],

    /// The port's own tick counter, feeding the microsecond clock.
    tick_count: AtomicU32,

    /// The SysTick reload value, for sub-tick interpolation.
    systick_reload: AtomicU32,

    /// Where the boot context's PSP points when the first PendSV stacks
    /// registers.
    boot_scratch: UnsafeCell<[u32; BOOT_SCRATCH_WORDS]>,
}

// Safety: The mutable parts are either atomics or guarded by the kernel
// lock.
unsafe impl Sync for State {}

impl State {
    pub const fn new() -> Self {
        Self {
            heap: UnsafeCell::new(FreeList::empty()),
            started: AtomicBool::new(false),
            boot_context_discarded: [AtomicBool::new(false), AtomicBool::new(false)],
            tick_count: AtomicU32::new(0),
            systick_reload: AtomicU32::new(0),
            boot_scratch: UnsafeCell::new([0; BOOT_SCRATCH_WORDS]),
        }
    }

    /// Initialize the hardware and boot the kernel. See
    /// [`boot`](crate::boot).
    ///
    /// # Safety
    ///
    /// Called exactly once, from the reset path.
    pub(crate) unsafe fn port_boot<Traits: PortInstance>() -> ! {
        cortex_m::interrupt::disable();

        let state = Traits::port_state();
        let (heap_base, heap_size) = Traits::heap_arena();
        // Safety: The arena is ours alone; interrupts are off
        unsafe { (*state.heap.get()).init(heap_base, heap_size) };

        // Safety: Nobody else owns the peripherals this early
        let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

        // PendSV must have the lowest priority so it only preempts thread
        // mode; SysTick sits above it
        // Safety: We don't make priority-based critical sections
        unsafe {
            peripherals
                .SCB
                .set_priority(SystemHandler::PendSV, 0xff);
            peripherals
                .SCB
                .set_priority(SystemHandler::SysTick, 0x80);
        }

        let reload = Traits::SYSTICK_CLOCK_HZ / Traits::TICK_RATE_HZ - 1;
        state.systick_reload.store(reload, Ordering::Relaxed);
        peripherals.SYST.set_clock_source(SystClkSource::Core);
        peripherals.SYST.set_reload(reload);
        peripherals.SYST.clear_current();
        peripherals.SYST.enable_interrupt();
        peripherals.SYST.enable_counter();

        // Safety: We are the port; the kernel lock is active (PRIMASK set)
        unsafe { <Traits as PortToKernel>::boot() }
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        // Point PSP at the scratch area so the first PendSV's register
        // save lands somewhere harmless; the boot context is then
        // abandoned for good.
        let scratch_top =
            self.boot_scratch.get() as usize + BOOT_SCRATCH_WORDS * core::mem::size_of::<u32>();
        // Safety: The scratch area is reserved for exactly this
        unsafe { cortex_m::register::psp::write(scratch_top as u32) };

        self.started.store(true, Ordering::SeqCst);

        SCB::set_pendsv();

        // Release the kernel lock; the pended PendSV takes over at once
        // Safety: The lock is active per this function's contract
        unsafe { self.leave_cpu_lock() };

        loop {
            cortex_m::asm::wfi();
        }
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        _task: &'static TaskCb<Traits>,
    ) -> ! {
        // The kernel has already detached the task and cleared the running
        // task, so the upcoming context switch won't save our context
        SCB::set_pendsv();

        // Safety: The lock is active per this function's contract
        unsafe { self.leave_cpu_lock() };

        // PendSV fires before anything else happens in thread mode
        loop {
            cortex_m::asm::wfi();
        }
    }

    pub fn yield_cpu(&self) {
        if !self.started.load(Ordering::Relaxed) {
            // Nothing to switch before the first dispatch
            return;
        }
        core::sync::atomic::compiler_fence(Ordering::Release);
        SCB::set_pendsv();
        cortex_m::asm::dsb();
        core::sync::atomic::compiler_fence(Ordering::Acquire);
    }

    pub fn request_reschedule(core: usize) {
        let _ = core;
        #[cfg(feature = "rp2040-smp")]
        // The other core's idle `wfe`/scheduler poll picks this up
        cortex_m::asm::sev();
    }

    pub unsafe fn enter_cpu_lock(&self) {
        cortex_m::interrupt::disable();
        #[cfg(feature = "rp2040-smp")]
        sio_spinlock_claim();
    }

    pub unsafe fn leave_cpu_lock(&self) {
        #[cfg(feature = "rp2040-smp")]
        sio_spinlock_release();
        // Safety: Leaving the kernel critical section
        unsafe { cortex_m::interrupt::enable() };
    }

    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        if self.is_cpu_lock_active() {
            false
        } else {
            // Safety: The lock is not held by this context
            unsafe { self.enter_cpu_lock() };
            true
        }
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        cortex_m::register::primask::read().is_active()
    }

    pub fn is_task_context(&self) -> bool {
        !Self::is_interrupt_context() && self.started.load(Ordering::Relaxed)
    }

    pub fn is_interrupt_context() -> bool {
        !matches!(
            SCB::vect_active(),
            cortex_m::peripheral::scb::VectActive::ThreadMode
        )
    }

    pub fn current_core() -> usize {
        #[cfg(feature = "rp2040-smp")]
        {
            // SIO CPUID reads 0 on core 0 and 1 on core 1
            // Safety: Reading a read-only architectural register
            unsafe { (0xd000_0000 as *const u32).read_volatile() as usize }
        }
        #[cfg(not(feature = "rp2040-smp"))]
        0
    }

    pub fn idle_wait<Traits: PortInstance>() {
        if Traits::USE_WFI {
            cortex_m::asm::wfi();
        }
    }

    pub fn microsecond_now<Traits: PortInstance>(&self) -> u64 {
        let us_per_tick = 1_000_000u64 / Traits::TICK_RATE_HZ as u64;
        let ticks = self.tick_count.load(Ordering::Relaxed) as u64;

        let reload = self.systick_reload.load(Ordering::Relaxed) as u64;
        if reload == 0 {
            return ticks * us_per_tick;
        }
        // SysTick counts down from the reload value
        // Safety: Reading the SYST current-value register
        let current = unsafe { (0xe000_e018 as *const u32).read_volatile() } as u64;
        ticks * us_per_tick + (reload - current.min(reload)) * us_per_tick / (reload + 1)
    }

    pub unsafe fn allocate_memory<Traits: PortInstance>(
        &self,
        size: usize,
    ) -> Option<NonNull<u8>> {
        // Safety: Kernel lock active per the trait contract
        let heap = unsafe { &mut *self.heap.get() };
        heap.allocate(size).and_then(NonNull::new)
    }

    pub unsafe fn deallocate_memory<Traits: PortInstance>(
        &self,
        ptr: NonNull<u8>,
        _size: usize,
    ) {
        // Safety: Kernel lock active; `ptr` came from `allocate_memory`
        unsafe { (*self.heap.get()).free(ptr.as_ptr()) };
    }

    /// Build the initial context of a task: a hardware exception frame that
    /// "returns" into the entry function, plus a zeroed software frame.
    pub unsafe fn initialize_task_state<Traits: PortInstance>(
        &self,
        task: &'static TaskCb<Traits>,
    ) {
        let stack = task.stack_region();
        let entry = task
            .entry_point()
            .unwrap_or_else(|| unreachable!("task created without an entry point"));

        let mut sp = stack.top() as *mut u32;

        // Hardware-stacked exception frame: R0-R3, R12, LR, PC, xPSR
        // Safety: The stack region was sized by the kernel
        unsafe {
            sp = sp.sub(8);
            sp.write(task.entry_param() as u32); // R0: the entry parameter
            sp.add(1).write(0); // R1
            sp.add(2).write(0); // R2
            sp.add(3).write(0); // R3
            sp.add(4).write(0); // R12
            // LR: a returning entry function lands in the exit trampoline
            sp.add(5)
                .write(pico_kernel::task::task_exit_trampoline::<Traits> as usize as u32);
            // PC: the stacked address must have the Thumb bit clear
            sp.add(6).write(entry as usize as u32 & !1);
            // xPSR: only the Thumb state bit
            sp.add(7).write(0x0100_0000);

            // Software frame: R4-R11
            sp = sp.sub(8);
            for i in 0..8 {
                sp.add(i).write(0);
            }

            *task.port_task_state.sp.get() = sp as u32;
        }
    }
}

/// The Rust half of the PendSV handler: saves the outgoing task's stack
/// pointer, runs the scheduling decision, and returns the incoming task's
/// stack pointer.
///
/// # Safety
///
/// Only meant to be called by the PendSV handler emitted by
/// [`use_port!`](crate::use_port), with `old_sp` pointing at the register
/// frame it just stacked.
pub unsafe extern "C" fn switch_context<Traits: PortInstance>(old_sp: u32) -> u32 {
    let state = Traits::port_state();

    // PendSV runs with interrupts enabled; the scheduling decision still
    // needs the kernel lock
    // Safety: PendSV never preempts a critical section
    unsafe { state.enter_cpu_lock() };

    let core = State::current_core();
    let running_ptr = Traits::state().running_task_ptr(core);

    if state.boot_context_discarded[core].swap(true, Ordering::Relaxed) {
        // Safety: Kernel lock active; the cell is stable
        if let Some(prev) = unsafe { *running_ptr } {
            // Safety: `prev` was executing on `old_sp`'s stack
            unsafe { *prev.port_task_state.sp.get() = old_sp };
        }
    }
    // else: the first switch on this core discards the boot context

    // Safety: Kernel lock active
    unsafe { <Traits as PortToKernel>::choose_running_task() };

    // The idle task is always runnable
    // Safety: Kernel lock active; the cell is stable
    let next = unsafe { *running_ptr }.unwrap_or_else(|| unreachable!());
    // Safety: `next` is suspended, so its saved stack pointer is stable
    let next_sp = unsafe { *next.port_task_state.sp.get() };

    // Safety: We hold the kernel lock
    unsafe { state.leave_cpu_lock() };

    next_sp
}

/// The Rust half of the SysTick handler.
///
/// # Safety
///
/// Only meant to be called by the SysTick handler emitted by
/// [`use_port!`](crate::use_port).
pub unsafe fn systick_handler<Traits: PortInstance>() {
    let state = Traits::port_state();
    state.tick_count.fetch_add(1, Ordering::Relaxed);

    if state.started.load(Ordering::Relaxed) {
        // Safety: We are the port's tick source
        unsafe { <Traits as PortToKernel>::timer_tick() };
    }
}

#[cfg(feature = "rp2040-smp")]
mod sio {
    //! The inter-core half of the kernel lock: RP2040 SIO hardware
    //! spinlock 31, the conventional system spinlock.
    const SPINLOCK31: *mut u32 = 0xd000_017c as *mut u32;

    pub(super) fn sio_spinlock_claim() {
        // Reading the spinlock register returns nonzero exactly when the
        // lock was free and is now claimed
        // Safety: Architectural register access
        while unsafe { SPINLOCK31.read_volatile() } == 0 {
            core::hint::spin_loop();
        }
    }

    pub(super) fn sio_spinlock_release() {
        // Safety: Any write releases the lock
        unsafe { SPINLOCK31.write_volatile(1) };
    }
}

#[cfg(feature = "rp2040-smp")]
use sio::{sio_spinlock_claim, sio_spinlock_release};

/// Boot a secondary core into the kernel once the primary core's kernel is
/// up. The application is responsible for the platform-specific core
/// launch (e.g. the RP2040 mailbox protocol) and for pointing the core's
/// VTOR at the same vector table.
///
/// # Safety
///
/// Called exactly once, on the secondary core, after the primary core's
/// [`boot`](crate::boot) reached its first dispatch.
#[cfg(feature = "rp2040-smp")]
pub unsafe fn boot_secondary<Traits: PortInstance>() -> ! {
    cortex_m::interrupt::disable();

    // Safety: Secondary core, before any kernel activity here
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };
    // Safety: Same rationale as the primary core
    unsafe {
        peripherals
            .SCB
            .set_priority(cortex_m::peripheral::scb::SystemHandler::PendSV, 0xff);
    }

    // Safety: We are the port; the kernel lock is active (PRIMASK set)
    unsafe { <Traits as PortToKernel>::secondary_boot() }
}
