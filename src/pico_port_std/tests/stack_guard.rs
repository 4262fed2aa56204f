//! The idle task's stack canary scan.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

mod canary_scan {
    use super::*;
    use pico_kernel::{KernelCfg, System, TaskId};

    pico_port_std::use_port!(unsafe struct SystemTraits);
    pico_kernel::build_kernel! {
        kernel SystemTraits {
            max_tasks: 8,
            priority_levels: 16,
            num_cores: 1,
            tick_rate_hz: 1000,
            max_mutexes: 1,
            max_semaphores: 1,
            max_queues: 1,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
            // Scan on every idle pass so the violation is caught promptly
            canary_scan_interval: 1,
        }
    }
    type Sys = System<SystemTraits>;

    static VICTIM_ID: AtomicUsize = AtomicUsize::new(0);
    static HOOK_FIRED: AtomicBool = AtomicBool::new(false);
    static HOOK_MATCHED: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        Sys::set_stack_overflow_hook(on_overflow);
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn on_overflow(task: TaskId, name: &'static str) {
        HOOK_FIRED.store(true, Ordering::SeqCst);
        if task.get() == VICTIM_ID.load(Ordering::SeqCst) && name == "victim" {
            HOOK_MATCHED.store(true, Ordering::SeqCst);
        }
    }

    fn victim(_: usize) {
        // Park forever; the driver vandalizes our stack from outside
        Sys::sleep_ms(60_000).unwrap();
    }

    fn driver(_: usize) {
        let victim_id = Sys::create_task("victim", victim, 0, 4096, 2).unwrap();
        VICTIM_ID.store(victim_id.get(), Ordering::SeqCst);

        // Let the victim run and block
        Sys::sleep_ms(10).unwrap();

        // Overwrite the canary words at the low end of the victim's stack,
        // as a stack overflow would
        let cb = SystemTraits::get_task_cb(victim_id.get() - 1).unwrap();
        let stack = cb.stack_region();
        // Safety: The victim is parked; we deliberately vandalize the
        // guard area (and only the guard area)
        unsafe {
            (stack.base() as *mut u32).write(0x0bad_f00d);
        }

        // The idle task's next scan detects the violation, forces the
        // victim out, and raises the hook
        Sys::sleep_ms(50).unwrap();
        assert!(HOOK_FIRED.load(Ordering::SeqCst));
        assert!(HOOK_MATCHED.load(Ordering::SeqCst));

        // The victim is gone: either still Terminated or already reaped
        match Sys::task_state(victim_id) {
            Ok(st) => assert_eq!(st, pico_kernel::TaskSt::Terminated),
            Err(_) => {} // reaped; the id is dead
        }

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn corrupted_canary_kills_the_task_and_raises_the_hook() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}
