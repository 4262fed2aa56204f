//! Stream buffer behavior: framing, truncation, blocking flow control, and
//! the zero-copy path.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

mod truncation {
    use super::*;
    use pico_kernel::{error::ReceiveStreamError, StreamBufferId, System, Timeout};

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
            max_stream_buffers: 2,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static STREAM: OnceLock<StreamBufferId> = OnceLock::new();
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        STREAM
            .set(Sys::create_stream_buffer(256).unwrap())
            .unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn driver(_: usize) {
        let stream = *STREAM.get().unwrap();

        assert_eq!(
            Sys::send_stream(stream, b"HELLOWORLD", Timeout::Immediate).unwrap(),
            10
        );
        assert_eq!(Sys::stream_peek_length(stream).unwrap(), Some(10));

        // A short destination truncates the message; the tail of the
        // message is discarded along with it
        let mut out = [0u8; 4];
        assert_eq!(
            Sys::receive_stream(stream, &mut out, Timeout::Immediate).unwrap(),
            4
        );
        assert_eq!(&out, b"HELL");

        assert!(Sys::is_stream_empty(stream).unwrap());
        assert_eq!(Sys::stream_bytes_available(stream).unwrap(), 0);
        assert_eq!(
            Sys::receive_stream(stream, &mut out, Timeout::Immediate),
            Err(ReceiveStreamError::Empty)
        );

        // The accounting invariant held throughout
        assert_eq!(Sys::stream_free_space(stream).unwrap(), 255);

        let stats = Sys::stream_stats(stream).unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_sent, 10);
        assert_eq!(stats.bytes_received, 4);
        assert_eq!(stats.peak_usage, 14);

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn short_reads_truncate_and_discard() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}

mod blocking_flow {
    use super::*;
    use pico_kernel::{StreamBufferId, System, Timeout};

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
            max_stream_buffers: 2,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    /// Small enough that the producer must repeatedly wait for the
    /// consumer to free space.
    const STREAM_SIZE: usize = 64;
    const MESSAGES: usize = 32;

    static STREAM: OnceLock<StreamBufferId> = OnceLock::new();
    static RECEIVED: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());
    static PRODUCED: AtomicUsize = AtomicUsize::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        STREAM
            .set(Sys::create_stream_buffer(STREAM_SIZE).unwrap())
            .unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn message(i: usize) -> Vec<u8> {
        // Variable lengths exercise the wrap-aware copies
        let len = 1 + (i * 7) % 23;
        (0..len).map(|j| (i * 31 + j) as u8).collect()
    }

    fn producer(_: usize) {
        let stream = *STREAM.get().unwrap();
        for i in 0..MESSAGES {
            let msg = message(i);
            assert_eq!(
                Sys::send_stream(stream, &msg, Timeout::Forever).unwrap(),
                msg.len()
            );
            PRODUCED.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn consumer(_: usize) {
        let stream = *STREAM.get().unwrap();
        for _ in 0..MESSAGES {
            let mut out = [0u8; 64];
            let n = Sys::receive_stream(stream, &mut out, Timeout::Forever).unwrap();
            RECEIVED.lock().unwrap().push(out[..n].to_vec());
        }
        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    fn driver(_: usize) {
        Sys::create_task("producer", producer, 0, 4096, 3).unwrap();
        Sys::create_task("consumer", consumer, 0, 4096, 2).unwrap();
        // The workers finish the test on their own
    }

    #[test]
    fn messages_flow_through_a_small_buffer() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));

        let received = RECEIVED.lock().unwrap();
        assert_eq!(received.len(), MESSAGES);
        for (i, msg) in received.iter().enumerate() {
            assert_eq!(*msg, message(i), "message {} was damaged", i);
        }
        assert_eq!(PRODUCED.load(Ordering::SeqCst), MESSAGES);
    }
}

mod zero_copy {
    use super::*;
    use pico_kernel::{error::StreamGrantError, StreamBufferId, System, Timeout};

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
            max_stream_buffers: 2,
            max_timers: 1,
            startup: startup,
        }
    }
    type Sys = System<SystemTraits>;

    static STREAM: OnceLock<StreamBufferId> = OnceLock::new();
    static DONE: AtomicBool = AtomicBool::new(false);

    fn startup() {
        STREAM
            .set(Sys::create_stream_buffer(1024).unwrap())
            .unwrap();
        Sys::create_task("driver", driver, 0, 4096, 8).unwrap();
    }

    fn driver(_: usize) {
        let stream = *STREAM.get().unwrap();

        // Below the zero-copy threshold the grant is refused
        assert_eq!(
            Sys::stream_send_grant(stream, 8),
            Err(StreamGrantError::BadParam)
        );

        // Reserve 200 bytes, write 150, commit 150
        let grant = Sys::stream_send_grant(stream, 200).unwrap();
        assert_eq!(grant.capacity(), 200);

        // Only one grant may be outstanding
        assert_eq!(
            Sys::stream_send_grant(stream, 100),
            Err(StreamGrantError::GrantInUse)
        );

        // The reservation is invisible until committed
        assert!(Sys::is_stream_empty(stream).unwrap());

        for i in 0..150u8 {
            // Safety: Writing within the granted capacity
            unsafe { grant.as_mut_ptr().add(i as usize).write(i) };
        }
        Sys::stream_send_complete(stream, 150).unwrap();

        // The committed header carries the actual length
        assert_eq!(Sys::stream_peek_length(stream).unwrap(), Some(150));

        let mut out = [0u8; 200];
        assert_eq!(
            Sys::receive_stream(stream, &mut out, Timeout::Immediate).unwrap(),
            150
        );
        assert!((0..150u8).eq(out[..150].iter().copied()));
        assert_eq!(Sys::stream_bytes_available(stream).unwrap(), 0);

        // Zero-copy receive: round-trip a message through raw pointers
        Sys::send_stream(stream, b"grant me", Timeout::Immediate).unwrap();
        let (ptr, len) = Sys::stream_receive_grant(stream).unwrap();
        assert_eq!(len, 8);
        let mut seen = [0u8; 8];
        // Safety: Reading within the granted message
        unsafe { core::ptr::copy_nonoverlapping(ptr.as_ptr(), seen.as_mut_ptr(), len) };
        assert_eq!(&seen, b"grant me");
        Sys::stream_receive_complete(stream).unwrap();
        assert!(Sys::is_stream_empty(stream).unwrap());

        DONE.store(true, Ordering::SeqCst);
        pico_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn zero_copy_send_and_receive() {
        let _ = env_logger::builder().is_test(true).try_init();
        pico_port_std::boot::<SystemTraits>();
        assert!(DONE.load(Ordering::SeqCst));
    }
}
