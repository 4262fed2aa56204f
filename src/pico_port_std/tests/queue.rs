//! Message queue behavior, including the capacity-1 ping-pong exchange.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

mod ping_pong {
    use super::*;
    use pico_kernel::{QueueId, System, Timeout};

    pico_port_std::use_port!(unsafe struct SystemTraits);
    pico_kernel::build_kernel! {
        kernel SystemTraits {
            max_tasks: 8,
            priority_levels: 16,
            num_cores: 1,
            tick_rate_hz: 100,
            max_mutexes: 1,
            max_semaphores: 1,
            max_queues: 2,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static QUEUE: OnceLock<QueueId> = OnceLock::new();
    static RECEIVED: Mutex<Vec<u32>> = Mutex::new(Vec::new());
    static SENDER_DONE: AtomicBool = AtomicBool::new(false);
    static RECEIVER_DONE: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        QUEUE.set(Sys::create_queue(4, 1).unwrap()).unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn sender(_: usize) {
        let queue = *QUEUE.get().unwrap();
        for i in 0u32..4 {
            Sys::send_queue(queue, &i.to_le_bytes(), Timeout::Forever).unwrap();
        }
        SENDER_DONE.store(true, Ordering::SeqCst);
    }

    fn receiver(_: usize) {
        let queue = *QUEUE.get().unwrap();
        for _ in 0..4 {
            let mut item = [0u8; 4];
            Sys::receive_queue(queue, &mut item, Timeout::Forever).unwrap();
            RECEIVED.lock().unwrap().push(u32::from_le_bytes(item));
        }
        RECEIVER_DONE.store(true, Ordering::SeqCst);
    }

    fn driver(_: usize) {
        let queue = *QUEUE.get().unwrap();

        // Equal priorities; the sender gets the first turn
        Sys::create_task("sender", sender, 0, 4096, 3).unwrap();
        Sys::create_task("receiver", receiver, 0, 4096, 3).unwrap();

        while !(SENDER_DONE.load(Ordering::SeqCst) && RECEIVER_DONE.load(Ordering::SeqCst)) {
            Sys::sleep_ms(10).unwrap();
        }

        // Every item arrived intact and in order; nothing was lost or torn
        assert_eq!(*RECEIVED.lock().unwrap(), [0, 1, 2, 3]);
        assert_eq!(Sys::queue_len(queue).unwrap(), 0);

        // With a one-slot queue the sender had to block at least once, and
        // everyone who blocked was woken again
        let (send_stats, recv_stats) = Sys::queue_wait_stats(queue).unwrap();
        assert!(send_stats.enqueued >= 1);
        assert_eq!(send_stats.len, 0);
        assert_eq!(send_stats.enqueued, send_stats.dequeued);
        assert_eq!(recv_stats.len, 0);
        assert_eq!(recv_stats.enqueued, recv_stats.dequeued);

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn capacity_one_ping_pong() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}

mod edge_cases {
    use super::*;
    use pico_kernel::{
        error::{PeekQueueError, ReceiveQueueError, SendQueueError},
        QueueId, System, Timeout,
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
            max_queues: 2,
            max_event_groups: 1,
            max_stream_buffers: 1,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static QUEUE: OnceLock<QueueId> = OnceLock::new();
    static SINK_HITS: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        QUEUE.set(Sys::create_queue(8, 2).unwrap()).unwrap();
        Sys::set_error_sink(|_code| {
            SINK_HITS.fetch_add(1, Ordering::SeqCst);
        });
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn driver(_: usize) {
        let queue = *QUEUE.get().unwrap();

        // Item size is enforced
        assert_eq!(
            Sys::send_queue(queue, &[0u8; 3], Timeout::Immediate),
            Err(SendQueueError::BadParam)
        );

        // Peek observes without consuming
        Sys::send_queue(queue, b"AAAAAAAA", Timeout::Immediate).unwrap();
        Sys::send_queue(queue, b"BBBBBBBB", Timeout::Immediate).unwrap();
        let mut item = [0u8; 8];
        Sys::peek_queue(queue, &mut item).unwrap();
        assert_eq!(&item, b"AAAAAAAA");
        assert_eq!(Sys::queue_len(queue).unwrap(), 2);

        // The queue is at capacity; a non-blocking send is refused and a
        // bounded one times out
        assert_eq!(
            Sys::send_queue(queue, b"CCCCCCCC", Timeout::Immediate),
            Err(SendQueueError::Full)
        );
        assert_eq!(
            Sys::send_queue(queue, b"CCCCCCCC", Timeout::Ms(10)),
            Err(SendQueueError::Timeout)
        );

        // Drain in order
        Sys::receive_queue(queue, &mut item, Timeout::Immediate).unwrap();
        assert_eq!(&item, b"AAAAAAAA");
        Sys::receive_queue(queue, &mut item, Timeout::Immediate).unwrap();
        assert_eq!(&item, b"BBBBBBBB");

        // Empty again
        assert_eq!(
            Sys::receive_queue(queue, &mut item, Timeout::Immediate),
            Err(ReceiveQueueError::Empty)
        );
        assert_eq!(
            Sys::peek_queue(queue, &mut item),
            Err(PeekQueueError::Empty)
        );

        // A queue with no room for even one more item still reports its
        // geometry faithfully
        assert_eq!(Sys::queue_capacity(queue).unwrap(), 2);

        // The BadParam usage error landed in the error ring (and fired the
        // sink); the Full/Empty/Timeout contention outcomes did not
        let log = Sys::error_log_snapshot();
        assert!(log
            .iter()
            .any(|e| e.code == pico_kernel::ResultCode::BadParam));
        assert!(!log.iter().any(|e| {
            matches!(
                e.code,
                pico_kernel::ResultCode::Full
                    | pico_kernel::ResultCode::Empty
                    | pico_kernel::ResultCode::Timeout
            )
        }));
        assert!(SINK_HITS.load(Ordering::SeqCst) >= 1);

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn sizes_timeouts_and_peek() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}
