//! Software timer behavior: periodic reload, one-shot latching, stop and
//! period changes.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;

mod periodic_and_one_shot {
    use super::*;
    use pico_kernel::{System, TimerId};

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
            max_timers: 4,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static PERIODIC_FIRED: AtomicU32 = AtomicU32::new(0);
    static ONE_SHOT_FIRED: AtomicU32 = AtomicU32::new(0);
    static ONE_SHOT_ARG: AtomicU32 = AtomicU32::new(0);
    static ONE_SHOT: OnceLock<TimerId> = OnceLock::new();
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn on_periodic(_: usize) {
        PERIODIC_FIRED.fetch_add(1, Ordering::SeqCst);
    }

    /// Timer callbacks run outside the kernel critical section, so kernel
    /// services are available here.
    fn on_one_shot(arg: usize) {
        ONE_SHOT_FIRED.fetch_add(1, Ordering::SeqCst);
        ONE_SHOT_ARG.store(arg as u32, Ordering::SeqCst);
        let timer = *ONE_SHOT.get().unwrap();
        assert_eq!(Sys::is_timer_running(timer), Ok(false));
    }

    fn driver(_: usize) {
        let periodic =
            Sys::create_timer("periodic", on_periodic, 0, 10, true).unwrap();
        let one_shot =
            Sys::create_timer("one-shot", on_one_shot, 0x77, 25, false).unwrap();
        ONE_SHOT.set(one_shot).unwrap();

        // Created timers are stopped
        assert_eq!(Sys::is_timer_running(periodic), Ok(false));

        Sys::start_timer(periodic).unwrap();
        Sys::start_timer(one_shot).unwrap();
        assert!(Sys::is_timer_running(periodic).unwrap());
        assert!(Sys::timer_remaining_ticks(one_shot).unwrap() <= 25);

        Sys::sleep_ms(100).unwrap();

        // The periodic timer reloads itself; the one-shot fired exactly
        // once and latched its expiry
        let fired = PERIODIC_FIRED.load(Ordering::SeqCst);
        assert!((5..=15).contains(&fired), "fired {} times", fired);
        assert_eq!(ONE_SHOT_FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(ONE_SHOT_ARG.load(Ordering::SeqCst), 0x77);
        assert!(Sys::timer_expired(one_shot).unwrap());
        assert!(!Sys::is_timer_running(one_shot).unwrap());

        // Stopping the periodic timer ends the callbacks
        Sys::stop_timer(periodic).unwrap();
        let frozen = PERIODIC_FIRED.load(Ordering::SeqCst);
        Sys::sleep_ms(50).unwrap();
        assert_eq!(PERIODIC_FIRED.load(Ordering::SeqCst), frozen);

        // Restarting a one-shot clears the latch
        Sys::start_timer(one_shot).unwrap();
        assert!(!Sys::timer_expired(one_shot).unwrap());
        Sys::sleep_ms(50).unwrap();
        assert_eq!(ONE_SHOT_FIRED.load(Ordering::SeqCst), 2);

        // Deletion disarms
        Sys::delete_timer(one_shot).unwrap();
        assert!(Sys::is_timer_running(one_shot).is_err());

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn periodic_reload_and_one_shot_latch() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}
