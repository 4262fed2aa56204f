//! Mutex semantics: priority inheritance, recursion, ownership rules.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

mod priority_inheritance {
    use super::*;
    use pico_kernel::{BlockReason, MutexId, System, TaskSt, Timeout};

    pico_port_std::use_port!(unsafe struct SystemTraits);
    pico_kernel::build_kernel! {
        kernel SystemTraits {
            max_tasks: 8,
            priority_levels: 16,
            num_cores: 1,
            tick_rate_hz: 1000,
            max_mutexes: 2,
            max_semaphores: 1,
            max_queues: 1,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static MUTEX: OnceLock<MutexId> = OnceLock::new();

    static LOW_HOLDS_LOCK: AtomicBool = AtomicBool::new(false);
    static RELEASE_REQUESTED: AtomicBool = AtomicBool::new(false);
    static MID_RAN: AtomicBool = AtomicBool::new(false);
    static HIGH_STARTED: AtomicBool = AtomicBool::new(false);
    static HIGH_GOT_LOCK: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        MUTEX.set(Sys::create_mutex().unwrap()).unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    /// Priority 1. Takes the mutex, then works until told to release it.
    fn low(_: usize) {
        let mutex = *MUTEX.get().unwrap();
        Sys::lock_mutex(mutex, Timeout::Forever).unwrap();
        LOW_HOLDS_LOCK.store(true, Ordering::SeqCst);

        // Busy work: while boosted, this starves every priority below the
        // boost
        while !RELEASE_REQUESTED.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }

        Sys::unlock_mutex(mutex).unwrap();
        // Not boosted anymore; block for good
        Sys::sleep_ms(10_000).unwrap();
    }

    /// Priority 2. Must not run while `low` is boosted above it.
    fn mid(_: usize) {
        MID_RAN.store(true, Ordering::SeqCst);
    }

    /// Priority 3. Blocks on the mutex, donating its priority to `low`.
    fn high(_: usize) {
        let mutex = *MUTEX.get().unwrap();
        HIGH_STARTED.store(true, Ordering::SeqCst);
        Sys::lock_mutex(mutex, Timeout::Forever).unwrap();

        // Ownership was transferred to us atomically on unlock
        assert_eq!(Sys::mutex_owner(mutex).unwrap(), Sys::current_task().ok());
        assert_eq!(Sys::mutex_lock_count(mutex).unwrap(), 1);
        HIGH_GOT_LOCK.store(true, Ordering::SeqCst);

        Sys::unlock_mutex(mutex).unwrap();
    }

    fn driver(_: usize) {
        let mutex = *MUTEX.get().unwrap();

        let low_id = Sys::create_task("low", low, 0, 4096, 1).unwrap();

        // Let `low` take the mutex
        Sys::sleep_ms(20).unwrap();
        assert!(LOW_HOLDS_LOCK.load(Ordering::SeqCst));
        assert_eq!(Sys::task_effective_priority(low_id).unwrap(), 1);
        assert_eq!(Sys::mutex_owner(mutex).unwrap(), Some(low_id));

        // `high` blocks on the mutex, boosting `low` to priority 3
        let high_id = Sys::create_task("high", high, 0, 4096, 3).unwrap();
        Sys::sleep_ms(20).unwrap();
        assert!(HIGH_STARTED.load(Ordering::SeqCst));
        assert_eq!(Sys::task_state(high_id).unwrap(), TaskSt::Blocked);
        assert_eq!(
            Sys::task_block_reason(high_id).unwrap(),
            BlockReason::Mutex
        );
        assert_eq!(Sys::task_effective_priority(low_id).unwrap(), 3);
        assert_eq!(Sys::task_priority(low_id).unwrap(), 1);

        // `mid` is Ready but must not run: the boosted holder outranks it
        let mid_id = Sys::create_task("mid", mid, 0, 4096, 2).unwrap();
        Sys::sleep_ms(30).unwrap();
        assert!(!MID_RAN.load(Ordering::SeqCst));
        assert_eq!(Sys::task_state(mid_id).unwrap(), TaskSt::Ready);

        // Release: `high` takes over the mutex, `low` reverts to priority 1,
        // and `mid` finally gets the processor
        RELEASE_REQUESTED.store(true, Ordering::SeqCst);
        Sys::sleep_ms(30).unwrap();
        assert!(HIGH_GOT_LOCK.load(Ordering::SeqCst));
        assert!(MID_RAN.load(Ordering::SeqCst));
        assert_eq!(Sys::task_effective_priority(low_id).unwrap(), 1);
        assert_eq!(Sys::mutex_owner(mutex).unwrap(), None);

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn priority_inheritance_single_hop() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}

mod ownership_rules {
    use super::*;
    use pico_kernel::{
        error::{LockMutexError, UnlockMutexError},
        MutexId, System, Timeout,
    };

    pico_port_std::use_port!(unsafe struct SystemTraits);
    pico_kernel::build_kernel! {
        kernel SystemTraits {
            max_tasks: 8,
            priority_levels: 16,
            num_cores: 1,
            tick_rate_hz: 1000,
            max_mutexes: 2,
            max_semaphores: 1,
            max_queues: 1,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static MUTEX: OnceLock<MutexId> = OnceLock::new();
    static HOLDER_READY: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        MUTEX.set(Sys::create_mutex().unwrap()).unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn holder(_: usize) {
        let mutex = *MUTEX.get().unwrap();
        Sys::lock_mutex(mutex, Timeout::Forever).unwrap();
        HOLDER_READY.store(true, Ordering::SeqCst);
        Sys::sleep_ms(10_000).unwrap();
    }

    fn driver(_: usize) {
        let mutex = *MUTEX.get().unwrap();

        // Recursive locking nests and unwinds
        Sys::lock_mutex(mutex, Timeout::Forever).unwrap();
        Sys::lock_mutex(mutex, Timeout::Forever).unwrap();
        Sys::lock_mutex(mutex, Timeout::Immediate).unwrap();
        assert_eq!(Sys::mutex_lock_count(mutex).unwrap(), 3);
        Sys::unlock_mutex(mutex).unwrap();
        Sys::unlock_mutex(mutex).unwrap();
        assert_eq!(Sys::mutex_lock_count(mutex).unwrap(), 1);
        Sys::unlock_mutex(mutex).unwrap();
        assert_eq!(Sys::mutex_owner(mutex).unwrap(), None);

        // Unlocking what we don't own is refused with no state change
        assert_eq!(
            Sys::unlock_mutex(mutex),
            Err(UnlockMutexError::NotOwner)
        );

        // Contention: a lower-priority task takes the mutex and parks
        let holder_id = Sys::create_task("holder", holder, 0, 4096, 2).unwrap();
        Sys::sleep_ms(20).unwrap();
        assert!(HOLDER_READY.load(Ordering::SeqCst));

        // Immediate and bounded attempts fail while it is held elsewhere
        assert_eq!(
            Sys::try_lock_mutex(mutex),
            Err(LockMutexError::Timeout)
        );
        let before = Sys::tick_count();
        assert_eq!(
            Sys::lock_mutex(mutex, Timeout::Ms(15)),
            Err(LockMutexError::Timeout)
        );
        assert!(Sys::tick_count().wrapping_sub(before) >= 15);

        // We never became a waiter permanently: the wait queue is empty
        let stats = Sys::mutex_wait_stats(mutex).unwrap();
        assert_eq!(stats.len, 0);
        assert_eq!(stats.enqueued, stats.dequeued);

        // The unlock-by-timeout didn't disturb ownership
        assert_eq!(Sys::mutex_owner(mutex).unwrap(), Some(holder_id));

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn ownership_and_recursion_rules() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}

mod deletion {
    use super::*;
    use pico_kernel::{error::LockMutexError, MutexId, System, Timeout};

    pico_port_std::use_port!(unsafe struct SystemTraits);
    pico_kernel::build_kernel! {
        kernel SystemTraits {
            max_tasks: 8,
            priority_levels: 16,
            num_cores: 1,
            tick_rate_hz: 1000,
            max_mutexes: 2,
            max_semaphores: 1,
            max_queues: 1,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static MUTEX: OnceLock<MutexId> = OnceLock::new();
    static WAITER_RESULT: OnceLock<Result<(), LockMutexError>> = OnceLock::new();
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        MUTEX.set(Sys::create_mutex().unwrap()).unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn waiter(_: usize) {
        let mutex = *MUTEX.get().unwrap();
        let result = Sys::lock_mutex(mutex, Timeout::Forever);
        WAITER_RESULT.set(result).unwrap();
    }

    fn driver(_: usize) {
        let mutex = *MUTEX.get().unwrap();

        // Hold the mutex so the waiter actually blocks
        Sys::lock_mutex(mutex, Timeout::Forever).unwrap();
        Sys::create_task("waiter", waiter, 0, 4096, 2).unwrap();
        Sys::sleep_ms(20).unwrap();

        // Deleting the mutex wakes the waiter with a `Deleted` disposition
        Sys::delete_mutex(mutex).unwrap();
        Sys::sleep_ms(20).unwrap();
        assert_eq!(WAITER_RESULT.get(), Some(&Err(LockMutexError::Deleted)));

        // The identifier is dead now
        assert!(Sys::lock_mutex(mutex, Timeout::Immediate).is_err());

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn deletion_wakes_waiters() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}
