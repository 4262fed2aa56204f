//! Counting semaphore behavior, including the tick-driven timeout.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;

mod tick_driven_timeout {
    use super::*;
    use pico_kernel::{error::TakeSemaphoreError, SemaphoreId, System, Timeout};

    pico_port_std::use_port!(unsafe struct SystemTraits);
    pico_kernel::build_kernel! {
        kernel SystemTraits {
            max_tasks: 8,
            priority_levels: 16,
            num_cores: 1,
            tick_rate_hz: 1000,
            max_mutexes: 1,
            max_semaphores: 2,
            max_queues: 1,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static SEMAPHORE: OnceLock<SemaphoreId> = OnceLock::new();
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        SEMAPHORE
            .set(Sys::create_semaphore(0, 4).unwrap())
            .unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn driver(_: usize) {
        let semaphore = *SEMAPHORE.get().unwrap();

        // Nobody gives: the bounded take expires at the deadline tick with
        // a timed-out disposition
        let before = Sys::tick_count();
        assert_eq!(
            Sys::take_semaphore(semaphore, Timeout::Ms(5)),
            Err(TakeSemaphoreError::Timeout)
        );
        let elapsed = Sys::tick_count().wrapping_sub(before);
        assert!(elapsed >= 5, "woke after only {} ticks", elapsed);

        // The count is untouched and we are no longer in the wait list
        assert_eq!(Sys::semaphore_count(semaphore).unwrap(), 0);
        let stats = Sys::semaphore_wait_stats(semaphore).unwrap();
        assert_eq!(stats.len, 0);
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.dequeued, 1);

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn bounded_take_times_out_on_the_tick() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}

mod token_handoff {
    use super::*;
    use pico_kernel::{SemaphoreId, System, Timeout};

    pico_port_std::use_port!(unsafe struct SystemTraits);
    pico_kernel::build_kernel! {
        kernel SystemTraits {
            max_tasks: 8,
            priority_levels: 16,
            num_cores: 1,
            tick_rate_hz: 1000,
            max_mutexes: 1,
            max_semaphores: 2,
            max_queues: 1,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static SEMAPHORE: OnceLock<SemaphoreId> = OnceLock::new();
    static CONSUMED: AtomicU32 = AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        SEMAPHORE
            .set(Sys::create_semaphore(1, 2).unwrap())
            .unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn consumer(_: usize) {
        let semaphore = *SEMAPHORE.get().unwrap();
        loop {
            Sys::take_semaphore(semaphore, Timeout::Forever).unwrap();
            CONSUMED.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn driver(_: usize) {
        let semaphore = *SEMAPHORE.get().unwrap();

        // The initial token is immediately available
        Sys::take_semaphore(semaphore, Timeout::Immediate).unwrap();
        assert_eq!(Sys::semaphore_count(semaphore).unwrap(), 0);

        // Saturation: a give at the ceiling succeeds but the count stays
        // put
        Sys::give_semaphore(semaphore).unwrap();
        Sys::give_semaphore(semaphore).unwrap();
        Sys::give_semaphore(semaphore).unwrap();
        assert_eq!(Sys::semaphore_count(semaphore).unwrap(), 2);

        // A waiter consumes the banked tokens, then blocks; further gives
        // transfer straight to it without touching the count
        Sys::create_task("consumer", consumer, 0, 4096, 3).unwrap();
        Sys::sleep_ms(20).unwrap();
        assert_eq!(CONSUMED.load(Ordering::SeqCst), 2);
        assert_eq!(Sys::semaphore_count(semaphore).unwrap(), 0);

        for _ in 0..3 {
            Sys::give_semaphore(semaphore).unwrap();
            Sys::sleep_ms(5).unwrap();
        }
        assert_eq!(CONSUMED.load(Ordering::SeqCst), 5);
        assert_eq!(Sys::semaphore_count(semaphore).unwrap(), 0);

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn tokens_transfer_to_waiters_directly() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}
