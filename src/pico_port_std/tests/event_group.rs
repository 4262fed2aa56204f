//! Event group behavior: wait-any/wait-all, clear-on-exit, deletion.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;

mod wait_all_with_clear {
    use super::*;
    use pico_kernel::{EventGroupId, EventWaitFlags, System, Timeout};

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
            max_event_groups: 2,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static EVENTS: OnceLock<EventGroupId> = OnceLock::new();
    static WAKE_SNAPSHOT: AtomicU32 = AtomicU32::new(0);
    static WAITER_WOKE: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        EVENTS.set(Sys::create_event_group().unwrap()).unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    /// Waits for all of `0b1011` with clear-on-exit.
    fn waiter(_: usize) {
        let events = *EVENTS.get().unwrap();
        let snapshot = Sys::wait_bits(
            events,
            0b1011,
            EventWaitFlags::ALL | EventWaitFlags::CLEAR,
            Timeout::Forever,
        )
        .unwrap();
        WAKE_SNAPSHOT.store(snapshot, Ordering::SeqCst);
        WAITER_WOKE.store(true, Ordering::SeqCst);
    }

    fn driver(_: usize) {
        let events = *EVENTS.get().unwrap();

        // A bit outside the waited mask, planted up front; it must survive
        // the waiter's clear-on-exit
        Sys::set_bits(events, 0b0100).unwrap();

        Sys::create_task("waiter", waiter, 0, 4096, 9).unwrap();
        // The waiter outranks us, so it is already blocked by now
        assert!(!WAITER_WOKE.load(Ordering::SeqCst));

        // First half of the condition: not sufficient for wait-all
        Sys::set_bits(events, 0b0010).unwrap();
        Sys::sleep_ms(5).unwrap();
        assert!(!WAITER_WOKE.load(Ordering::SeqCst));

        // Second half completes the condition; the waiter preempts us here
        Sys::set_bits(events, 0b1001).unwrap();
        assert!(WAITER_WOKE.load(Ordering::SeqCst));

        // The snapshot contains the full satisfied mask…
        assert_eq!(WAKE_SNAPSHOT.load(Ordering::SeqCst) & 0b1011, 0b1011);
        // …the waited bits were cleared atomically at wake-up…
        assert_eq!(Sys::get_bits(events).unwrap() & 0b1011, 0);
        // …and unrelated bits are untouched
        assert_eq!(Sys::get_bits(events).unwrap(), 0b0100);

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn wait_all_with_clear_on_exit() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}

mod polling_and_idempotence {
    use super::*;
    use pico_kernel::{
        error::WaitEventGroupError, EventGroupId, EventWaitFlags, System, Timeout,
    };

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
            max_event_groups: 2,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static EVENTS: OnceLock<EventGroupId> = OnceLock::new();
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        EVENTS.set(Sys::create_event_group().unwrap()).unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn driver(_: usize) {
        let events = *EVENTS.get().unwrap();

        // Setting and clearing are idempotent
        Sys::set_bits(events, 0b0011).unwrap();
        Sys::set_bits(events, 0b0011).unwrap();
        assert_eq!(Sys::get_bits(events).unwrap(), 0b0011);
        Sys::clear_bits(events, 0b0001).unwrap();
        Sys::clear_bits(events, 0b0001).unwrap();
        assert_eq!(Sys::get_bits(events).unwrap(), 0b0010);

        // Wait-any is satisfied without blocking; no clear was requested
        let snapshot = Sys::wait_bits(
            events,
            0b0110,
            EventWaitFlags::empty(),
            Timeout::Immediate,
        )
        .unwrap();
        assert_eq!(snapshot, 0b0010);
        assert_eq!(Sys::get_bits(events).unwrap(), 0b0010);

        // Wait-all cannot be satisfied: a poll reports would-block, a
        // bounded wait times out
        assert_eq!(
            Sys::wait_bits(events, 0b0110, EventWaitFlags::ALL, Timeout::Immediate),
            Err(WaitEventGroupError::Empty)
        );
        assert_eq!(
            Sys::wait_bits(events, 0b0110, EventWaitFlags::ALL, Timeout::Ms(10)),
            Err(WaitEventGroupError::Timeout)
        );

        // An empty mask is rejected
        assert_eq!(
            Sys::wait_bits(events, 0, EventWaitFlags::empty(), Timeout::Immediate),
            Err(WaitEventGroupError::BadParam)
        );

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn polling_and_idempotence() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}
