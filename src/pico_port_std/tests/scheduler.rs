//! Scheduler behavior: lifecycle, priorities, round-robin, suspension.
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

mod basic_lifecycle {
    use super::*;
    use pico_kernel::{System, TaskSt};

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
        }
    }
    type Sys = System<SystemTraits>;

    static DONE: AtomicBool = AtomicBool::new(false);
    static CHILD_RAN: AtomicBool = AtomicBool::new(false);

    fn startup() {
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn child(arg: usize) {
        assert_eq!(arg, 0x1234);
        CHILD_RAN.store(true, Ordering::SeqCst);
    }

    fn driver(_: usize) {
        let me = Sys::current_task().unwrap();
        assert_eq!(Sys::task_name(me).unwrap(), "driver");
        assert_eq!(Sys::task_priority(me).unwrap(), 8);
        assert_eq!(Sys::task_state(me).unwrap(), TaskSt::Running);
        assert_eq!(Sys::task_state_str(me).unwrap(), "running");

        // A higher-priority task preempts us the moment it is created
        let child_id = Sys::create_task("child", child, 0x1234, 4096, 9).unwrap();
        assert!(CHILD_RAN.load(Ordering::SeqCst));

        // The child has returned; its slot is Terminated until the idle
        // task reaps it
        let st = Sys::task_state(child_id);
        assert!(
            matches!(st, Ok(TaskSt::Terminated)) || st.is_err(),
            "unexpected state: {:?}",
            st
        );

        // Timed sleep advances the clock by at least the requested amount
        let before = Sys::tick_count();
        Sys::sleep_ms(20).unwrap();
        let elapsed = Sys::tick_count().wrapping_sub(before);
        assert!(elapsed >= 20, "only {} ticks elapsed", elapsed);

        // Task-local storage is per-task and uninterpreted
        Sys::task_local_set(0, 0xfeed).unwrap();
        assert_eq!(Sys::task_local_get(0).unwrap(), 0xfeed);
        assert_eq!(Sys::task_local_get(1).unwrap(), 0);

        // Telemetry has recorded at least our dispatches
        let telemetry = Sys::task_telemetry(me).unwrap();
        assert!(telemetry.dispatches >= 1);

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn basic_lifecycle() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}

mod round_robin {
    use super::*;
    use pico_kernel::System;

    pico_port_std::use_port!(unsafe struct SystemTraits);
    pico_kernel::build_kernel! {
        kernel SystemTraits {
            max_tasks: 8,
            priority_levels: 16,
            num_cores: 1,
            tick_rate_hz: 100,
            max_mutexes: 1,
            max_semaphores: 1,
            max_queues: 1,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static TRACE: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    static FINISHED: AtomicUsize = AtomicUsize::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    const LAPS: usize = 5;

    fn startup() {
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn walker(tag: usize) {
        for _ in 0..LAPS {
            TRACE.lock().unwrap().push(tag);
            Sys::yield_now().unwrap();
        }
        FINISHED.fetch_add(1, Ordering::SeqCst);
    }

    fn driver(_: usize) {
        Sys::create_task("walker-a", walker, 1, 4096, 3).unwrap();
        Sys::create_task("walker-b", walker, 2, 4096, 3).unwrap();

        // Both walkers are below us; let them run to completion
        while FINISHED.load(Ordering::SeqCst) < 2 {
            Sys::sleep_ms(10).unwrap();
        }

        let trace = TRACE.lock().unwrap();
        assert_eq!(trace.len(), 2 * LAPS);
        assert_eq!(trace.iter().filter(|&&t| t == 1).count(), LAPS);
        assert_eq!(trace.iter().filter(|&&t| t == 2).count(), LAPS);
        // Round-robin on yield keeps the walkers in lockstep: at no point
        // does one get more than two laps ahead (one glitch is possible
        // when a tick rotation lands between a push and its yield)
        let mut lead: i32 = 0;
        for &tag in trace.iter() {
            lead += if tag == 1 { 1 } else { -1 };
            assert!(lead.abs() <= 2, "lost alternation: {:?}", *trace);
        }
        drop(trace);

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn equal_priority_tasks_alternate_on_yield() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}

mod suspend_resume {
    use super::*;
    use pico_kernel::{System, TaskSt};

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
        }
    }
    type Sys = System<SystemTraits>;

    static COUNTER: AtomicU32 = AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn ticker(_: usize) {
        loop {
            COUNTER.fetch_add(1, Ordering::SeqCst);
            Sys::sleep_ms(1).unwrap();
        }
    }

    fn driver(_: usize) {
        let ticker_id = Sys::create_task("ticker", ticker, 0, 4096, 3).unwrap();

        Sys::sleep_ms(20).unwrap();
        assert!(COUNTER.load(Ordering::SeqCst) > 0);

        // A Blocked task cannot be suspended in place
        if Sys::task_state(ticker_id).unwrap() == TaskSt::Blocked {
            assert!(Sys::suspend_task(ticker_id).is_err());
        }

        // Wait until it is Ready, then suspend it
        loop {
            if Sys::task_state(ticker_id).unwrap() == TaskSt::Ready {
                break;
            }
            std::thread::yield_now();
        }
        Sys::suspend_task(ticker_id).unwrap();
        assert_eq!(Sys::task_state(ticker_id).unwrap(), TaskSt::Suspended);

        // A suspended task makes no progress, even across many ticks
        let frozen = COUNTER.load(Ordering::SeqCst);
        Sys::sleep_ms(30).unwrap();
        assert_eq!(COUNTER.load(Ordering::SeqCst), frozen);

        // Resuming is idempotent for non-Suspended tasks, and wakes this
        // one up
        Sys::resume_task(ticker_id).unwrap();
        Sys::sleep_ms(20).unwrap();
        assert!(COUNTER.load(Ordering::SeqCst) > frozen);

        Sys::delete_task(ticker_id).unwrap();

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn suspended_tasks_make_no_progress() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}

mod affinity {
    use super::*;
    use pico_kernel::{Affinity, System, TaskSt};

    pico_port_std::use_port!(unsafe struct SystemTraits);
    pico_kernel::build_kernel! {
        kernel SystemTraits {
            max_tasks: 8,
            priority_levels: 16,
            num_cores: 2,
            tick_rate_hz: 1000,
            max_mutexes: 1,
            max_semaphores: 1,
            max_queues: 1,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static PINNED_RAN: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn pinned(_: usize) {
        PINNED_RAN.store(true, Ordering::SeqCst);
    }

    fn driver(_: usize) {
        // The simulator executes core 0 only; a task pinned to core 1
        // stays Ready indefinitely
        let pinned_id = Sys::create_task("pinned", pinned, 0, 4096, 2).unwrap();
        Sys::set_task_affinity(pinned_id, Affinity::Core(1)).unwrap();
        assert_eq!(Sys::task_affinity(pinned_id).unwrap(), Affinity::Core(1));

        Sys::sleep_ms(30).unwrap();
        assert!(!PINNED_RAN.load(Ordering::SeqCst));
        assert_eq!(Sys::task_state(pinned_id).unwrap(), TaskSt::Ready);

        // Out-of-range cores are rejected
        assert!(Sys::set_task_affinity(pinned_id, Affinity::Core(2)).is_err());

        // Released back to `Any`, core 0 picks it up at its next idle gap
        Sys::set_task_affinity(pinned_id, Affinity::Any).unwrap();
        Sys::sleep_ms(10).unwrap();
        assert!(PINNED_RAN.load(Ordering::SeqCst));

        // The scheduler keeps per-core statistics: everything so far
        // happened on core 0, whose idle task also exists
        let stats0 = Sys::core_stats(0).unwrap();
        assert!(stats0.dispatches > 0);
        assert!(Sys::core_stats(1).is_some());
        assert!(Sys::core_stats(2).is_none());

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn affinity_gates_the_scheduler() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}
