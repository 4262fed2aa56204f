//! Armv6-M (Cortex-M0+) port for the Pico-RTOS kernel.
//!
//! The context switch runs in PendSV, configured with the lowest exception
//! priority so it only ever preempts thread mode: the handler stacks
//! R4-R11 below the outgoing task's process stack pointer, asks the kernel
//! for the next task, and unstacks the incoming task's registers. A switch
//! requested from an interrupt handler is simply a pended PendSV — the
//! hardware takes it at the outermost exception return, which realizes the
//! deferred-switch rule without any bookkeeping.
//!
//! Every task (the idle tasks included) runs on its own process stack;
//! handler mode keeps the main stack to itself.
//!
//! The tick source is SysTick. Kernel memory (task stacks, queue and
//! stream storage) comes from a fixed arena managed by a first-fit free
//! list ([`heap`]).
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

// On hosted targets only the allocator (and its tests) builds
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
mod heap;

#[cfg(target_os = "none")]
mod imp;

#[cfg(target_os = "none")]
pub use imp::{switch_context, systick_handler, PortInstance, State, TaskState};

#[cfg(all(target_os = "none", feature = "rp2040-smp"))]
pub use imp::boot_secondary;

#[doc(hidden)]
pub use pico_kernel;

/// Port configuration, implemented by the application next to
/// [`use_port!`].
pub trait ThreadingOptions {
    /// The frequency driving SysTick, used to derive the tick reload value
    /// and the microsecond clock.
    const SYSTICK_CLOCK_HZ: u32;

    /// Whether the idle loop executes `wfi`. Disable for debug probes that
    /// dislike sleep states.
    const USE_WFI: bool = true;
}

/// Implement the port traits on a kernel trait type and install the
/// exception handlers.
///
/// ```ignore
/// pico_port_arm_m::use_port!(unsafe struct SystemTraits, kernel_heap_size = 32768);
///
/// impl pico_port_arm_m::ThreadingOptions for SystemTraits {
///     const SYSTICK_CLOCK_HZ: u32 = 125_000_000;
/// }
///
/// pico_kernel::build_kernel! {
///     kernel SystemTraits { /* … */ }
/// }
///
/// #[cortex_m_rt::entry]
/// fn main() -> ! {
///     unsafe { pico_port_arm_m::boot::<SystemTraits>() }
/// }
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $crate::use_port!(unsafe $vis struct $SystemTraits, kernel_heap_size = 16384);
    };
    (unsafe $vis:vis struct $SystemTraits:ident, kernel_heap_size = $heap_size:expr) => {
        $vis struct $SystemTraits;

        mod port_arm_m_impl {
            use super::$SystemTraits;
            use $crate::pico_kernel::{PortThreading, PortTimer, TaskCb};
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            #[repr(C, align(8))]
            struct HeapArena([u8; $heap_size]);
            static mut KERNEL_HEAP_ARENA: HeapArena = HeapArena([0; $heap_size]);

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }

                fn heap_arena() -> (*mut u8, usize) {
                    (core::ptr::addr_of_mut!(KERNEL_HEAP_ARENA) as *mut u8, $heap_size)
                }
            }

            // Assume `$SystemTraits: KernelCfg` (provided by `build_kernel!`)
            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: TaskState = TaskState::new();
                const STACK_MIN_SIZE: usize = 256;
                const STACK_ALIGN: usize = 8;

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    State::is_interrupt_context()
                }

                fn current_core() -> usize {
                    State::current_core()
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                unsafe fn yield_cpu() {
                    PORT_STATE.yield_cpu()
                }

                unsafe fn request_reschedule(core: usize) {
                    State::request_reschedule(core)
                }

                unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(task) }
                }

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                fn idle_wait() {
                    State::idle_wait::<Self>()
                }

                unsafe fn allocate_memory(
                    size: usize,
                ) -> Option<core::ptr::NonNull<u8>> {
                    unsafe { PORT_STATE.allocate_memory::<Self>(size) }
                }

                unsafe fn deallocate_memory(ptr: core::ptr::NonNull<u8>, size: usize) {
                    unsafe { PORT_STATE.deallocate_memory::<Self>(ptr, size) }
                }
            }

            unsafe impl PortTimer for $SystemTraits {
                fn microsecond_now() -> u64 {
                    PORT_STATE.microsecond_now::<Self>()
                }
            }

            /// The PendSV handler: the actual context switch.
            ///
            /// Frame layout on the process stack, low address first:
            /// `[r4-r7, r8-r11]`, below the hardware-stacked exception
            /// frame.
            #[unsafe(naked)]
            #[no_mangle]
            pub unsafe extern "C" fn PendSV() {
                core::arch::naked_asm!(
                    "
                    mrs r0, psp
                    subs r0, r0, #32
                    stmia r0!, {{r4-r7}}
                    mov r4, r8
                    mov r5, r9
                    mov r6, r10
                    mov r7, r11
                    stmia r0!, {{r4-r7}}
                    subs r0, r0, #32

                    bl {switch_context}

                    adds r0, r0, #16
                    ldmia r0!, {{r4-r7}}
                    mov r8, r4
                    mov r9, r5
                    mov r10, r6
                    mov r11, r7
                    msr psp, r0
                    subs r0, r0, #32
                    ldmia r0!, {{r4-r7}}
                    ldr r0, ={exc_return}
                    bx r0
                    ",
                    switch_context = sym $crate::switch_context::<$SystemTraits>,
                    exc_return = const 0xfffffffdu32,
                )
            }

            /// The SysTick handler: the kernel tick.
            #[no_mangle]
            pub extern "C" fn SysTick() {
                unsafe { $crate::systick_handler::<$SystemTraits>() }
            }
        }
    };
}

/// Boot the kernel on the current (primary) core. Never returns.
///
/// # Safety
///
/// Must be called exactly once, from the reset path, before interrupts are
/// enabled.
#[cfg(target_os = "none")]
pub unsafe fn boot<Traits: PortInstance>() -> ! {
    // Safety: Forwarded contract
    unsafe { State::port_boot::<Traits>() }
}
