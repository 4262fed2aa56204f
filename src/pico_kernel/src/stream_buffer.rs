//! Stream buffers: byte-oriented variable-length messages in a circular
//! buffer.
//!
//! Each message is stored as a little-endian `u32` length followed by that
//! many payload bytes, wrapping around the end of the buffer as needed. One
//! byte is kept unused so a full buffer is distinguishable from an empty
//! one. A receiver that offers a smaller destination gets the message
//! truncated and the remainder of that message discarded.
//!
//! The optional zero-copy path grants the caller a pointer directly into
//! the ring; it requires the whole frame to be contiguous (no wrap) and at
//! most one grant may be active per buffer at a time.
use core::{fmt, ptr::NonNull};

use crate::{
    error::{
        CreateStreamBufferError, DeleteStreamBufferError, QueryObjectError, ReceiveStreamError,
        SendStreamError, StreamGrantError, WaitError,
    },
    id_from_index, klock, task, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue, WaitQueueStats},
    Id, KernelTraits, PortThreading, System, Timeout,
};

/// Identifies a stream buffer. See [`System::create_stream_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamBufferId(pub(crate) Id);

/// Bytes of framing prepended to every message.
const HEADER_BYTES: usize = 4;

/// Transfer statistics of one stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub messages_sent: u32,
    pub messages_received: u32,
    /// Payload bytes accepted from senders.
    pub bytes_sent: u32,
    /// Payload bytes delivered to receivers (after truncation).
    pub bytes_received: u32,
    /// Highest occupancy (framing included) ever observed.
    pub peak_usage: usize,
    /// Corruption-triggered resets.
    pub resets: u32,
}

impl Init for StreamStats {
    const INIT: Self = Self {
        messages_sent: 0,
        messages_received: 0,
        bytes_sent: 0,
        bytes_received: 0,
        peak_usage: 0,
        resets: 0,
    };
}

/// An outstanding zero-copy operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    /// `send_grant` handed out the frame starting at `frame_off`, with room
    /// for `cap` payload bytes.
    Send { frame_off: usize, cap: usize },
    /// `receive_grant` exposed a message occupying `consumed` bytes
    /// (framing included) at the tail.
    Receive { consumed: usize },
}

/// The circular buffer itself: pure offset arithmetic plus wrap-aware byte
/// copies. All accesses happen under the kernel lock; this type carries no
/// locking of its own.
#[derive(Clone, Copy)]
pub(crate) struct StreamRing {
    buf: *mut u8,
    size: usize,
    /// Byte offset of the next write.
    head: usize,
    /// Byte offset of the next read.
    tail: usize,
    /// Bytes in use, framing included. One byte of `size` is always kept
    /// free: `bytes_avail + free_space() + 1 == size`.
    bytes_avail: usize,
    grant: Option<Grant>,
    stats: StreamStats,
}

// Safety: The buffer is only touched under the kernel lock (or through an
// outstanding grant, which is exclusive).
unsafe impl Send for StreamRing {}

impl Init for StreamRing {
    const INIT: Self = Self {
        buf: core::ptr::null_mut(),
        size: 0,
        head: 0,
        tail: 0,
        bytes_avail: 0,
        grant: None,
        stats: StreamStats::INIT,
    };
}

/// Message decoding failed; the buffer must be reset.
#[derive(Debug)]
struct CorruptError;

impl StreamRing {
    fn new(buf: *mut u8, size: usize) -> Self {
        Self {
            buf,
            size,
            head: 0,
            tail: 0,
            bytes_avail: 0,
            grant: None,
            stats: StreamStats::INIT,
        }
    }

    fn free_space(&self) -> usize {
        self.size - 1 - self.bytes_avail
    }

    fn is_empty(&self) -> bool {
        self.bytes_avail == 0
    }

    fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// The largest payload this buffer can ever hold.
    fn max_message(&self) -> usize {
        self.size - 1 - HEADER_BYTES
    }

    /// Copy `n` bytes into the ring at byte offset `at`, wrapping.
    ///
    /// # Safety
    ///
    /// `at < size`; `n` bytes fit in the ring; `src` is readable for `n`
    /// bytes.
    unsafe fn copy_in(&mut self, at: usize, src: *const u8, n: usize) {
        let first = n.min(self.size - at);
        // Safety: Both pieces stay within the buffer
        unsafe {
            core::ptr::copy_nonoverlapping(src, self.buf.add(at), first);
            core::ptr::copy_nonoverlapping(src.add(first), self.buf, n - first);
        }
    }

    /// Copy `n` bytes out of the ring from byte offset `at`, wrapping.
    ///
    /// # Safety
    ///
    /// `at < size`; `n ≤ size`; `dst` is writable for `n` bytes.
    unsafe fn copy_out(&self, at: usize, dst: *mut u8, n: usize) {
        let first = n.min(self.size - at);
        // Safety: Both pieces stay within the buffer
        unsafe {
            core::ptr::copy_nonoverlapping(self.buf.add(at), dst, first);
            core::ptr::copy_nonoverlapping(self.buf, dst.add(first), n - first);
        }
    }

    /// Append one message.
    ///
    /// # Safety
    ///
    /// `HEADER_BYTES + len ≤ free_space()`; `data` is readable for `len`
    /// bytes.
    unsafe fn write_message(&mut self, data: *const u8, len: usize) {
        debug_assert!(HEADER_BYTES + len <= self.free_space());

        let header = (len as u32).to_le_bytes();
        // Safety: Fits per the contract
        unsafe {
            self.copy_in(self.head, header.as_ptr(), HEADER_BYTES);
            self.copy_in((self.head + HEADER_BYTES) % self.size, data, len);
        }
        self.head = (self.head + HEADER_BYTES + len) % self.size;
        self.bytes_avail += HEADER_BYTES + len;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len as u32;
        self.stats.peak_usage = self.stats.peak_usage.max(self.bytes_avail);
    }

    /// The payload length of the next message, without consuming anything.
    fn peek_length(&self) -> Option<usize> {
        if self.bytes_avail < HEADER_BYTES {
            return None;
        }
        let mut header = [0u8; HEADER_BYTES];
        // Safety: At least a header is available
        unsafe { self.copy_out(self.tail, header.as_mut_ptr(), HEADER_BYTES) };
        Some(u32::from_le_bytes(header) as usize)
    }

    /// Validate the next message's header against the buffer contents.
    fn check_next_message(&self) -> Result<usize, CorruptError> {
        let len = self.peek_length().ok_or(CorruptError)?;
        if len > self.max_message() || HEADER_BYTES + len > self.bytes_avail {
            return Err(CorruptError);
        }
        Ok(len)
    }

    /// Pop the next message into `out`, truncating to `max_len` and
    /// discarding the remainder.
    ///
    /// # Safety
    ///
    /// At least a header is available; `out` is writable for `max_len`
    /// bytes.
    unsafe fn read_message(&mut self, out: *mut u8, max_len: usize) -> Result<usize, CorruptError> {
        let len = self.check_next_message()?;

        let n = len.min(max_len);
        // Safety: The message is in the buffer; `out` holds `n ≤ max_len`
        unsafe { self.copy_out((self.tail + HEADER_BYTES) % self.size, out, n) };

        self.tail = (self.tail + HEADER_BYTES + len) % self.size;
        self.bytes_avail -= HEADER_BYTES + len;

        self.stats.messages_received += 1;
        self.stats.bytes_received += n as u32;
        Ok(n)
    }

    /// Discard the entire contents, keeping the statistics.
    fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.bytes_avail = 0;
        self.grant = None;
    }

    /// Begin a zero-copy send: reserve a contiguous frame for up to `cap`
    /// payload bytes and return the payload's byte offset.
    ///
    /// The frame must not wrap. If the buffer is empty it is realigned to
    /// offset 0 first, which maximizes the contiguous space.
    fn send_grant(&mut self, cap: usize) -> Option<usize> {
        debug_assert!(self.grant.is_none());
        let needed = HEADER_BYTES + cap;
        if needed > self.free_space() {
            return None;
        }

        if self.head + needed > self.size {
            if self.is_empty() {
                self.head = 0;
                self.tail = 0;
            } else {
                return None;
            }
        }

        self.grant = Some(Grant::Send {
            frame_off: self.head,
            cap,
        });
        Some(self.head + HEADER_BYTES)
    }

    /// Commit a zero-copy send with the number of payload bytes actually
    /// written.
    fn send_complete(&mut self, actual: usize) -> Result<(), ()> {
        let Some(Grant::Send { frame_off, cap }) = self.grant else {
            return Err(());
        };
        if actual > cap {
            return Err(());
        }
        self.grant = None;

        let header = (actual as u32).to_le_bytes();
        // Safety: The frame was reserved contiguously at `frame_off`
        unsafe { self.copy_in(frame_off, header.as_ptr(), HEADER_BYTES) };

        self.head = (frame_off + HEADER_BYTES + actual) % self.size;
        self.bytes_avail += HEADER_BYTES + actual;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += actual as u32;
        self.stats.peak_usage = self.stats.peak_usage.max(self.bytes_avail);
        Ok(())
    }

    /// Begin a zero-copy receive: expose the next message if its frame is
    /// contiguous. Returns the payload's byte offset and length.
    fn receive_grant(&mut self) -> Result<Option<(usize, usize)>, CorruptError> {
        debug_assert!(self.grant.is_none());
        if self.bytes_avail < HEADER_BYTES {
            return Ok(None);
        }
        let len = self.check_next_message()?;

        if self.tail + HEADER_BYTES + len > self.size {
            // The frame wraps; only the copying interface can read it
            return Ok(None);
        }

        self.grant = Some(Grant::Receive {
            consumed: HEADER_BYTES + len,
        });
        Ok(Some((self.tail + HEADER_BYTES, len)))
    }

    /// Finish a zero-copy receive, consuming the exposed message.
    fn receive_complete(&mut self) -> Result<(), ()> {
        let Some(Grant::Receive { consumed }) = self.grant else {
            return Err(());
        };
        self.grant = None;

        self.tail = (self.tail + consumed) % self.size;
        self.bytes_avail -= consumed;

        self.stats.messages_received += 1;
        self.stats.bytes_received += (consumed - HEADER_BYTES) as u32;
        Ok(())
    }
}

/// A writable window into a stream buffer handed out by
/// [`System::stream_send_grant`].
///
/// Write up to [`Self::capacity`] bytes through [`Self::as_mut_ptr`], then
/// commit with [`System::stream_send_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGrant {
    ptr: NonNull<u8>,
    cap: usize,
}

impl StreamGrant {
    /// The start of the reserved payload region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// How many payload bytes the region can hold.
    pub fn capacity(&self) -> usize {
        self.cap
    }
}

/// *Stream buffer control block* — the state data of a stream buffer.
pub struct StreamBufferCb<Traits: PortThreading> {
    /// Whether this pool slot is in use.
    pub(crate) slot: klock::CpuLockCell<Traits, bool>,

    pub(crate) ring: klock::CpuLockCell<Traits, StreamRing>,

    /// Tasks blocked reading from an empty buffer.
    pub(crate) reader_queue: WaitQueue<Traits>,

    /// Tasks blocked writing to a full buffer.
    pub(crate) writer_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for StreamBufferCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        slot: klock::CpuLockCell::new(false),
        ring: klock::CpuLockCell::new(StreamRing::INIT),
        reader_queue: WaitQueue::INIT,
        writer_queue: WaitQueue::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for StreamBufferCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamBufferCb")
            .field("self", &(self as *const _))
            .field("reader_queue", &self.reader_queue)
            .field("writer_queue", &self.writer_queue)
            .finish()
    }
}

fn live_stream_cb<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    id: StreamBufferId,
) -> Result<&'static StreamBufferCb<Traits>, crate::error::BadIdError> {
    let cb =
        Traits::get_stream_buffer_cb(id.0.get() - 1).ok_or(crate::error::BadIdError::BadId)?;
    if cb.slot.get(&*lock) {
        Ok(cb)
    } else {
        Err(crate::error::BadIdError::BadId)
    }
}

/// Serve blocked readers from the ring, in priority order, while complete
/// messages are available.
fn deliver_to_readers<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static StreamBufferCb<Traits>,
    ring: &mut StreamRing,
) {
    cb.reader_queue
        .wake_up_while(lock.borrow_mut(), |payload, lock| match payload {
            WaitPayload::StreamReceive {
                out,
                max_len,
                received,
            } => {
                if ring.bytes_avail < HEADER_BYTES {
                    return false;
                }
                // Safety: The reader's buffer outlives its wait
                match unsafe { ring.read_message(out.as_ptr(), *max_len) } {
                    Ok(n) => {
                        received.read(&*lock).set(n);
                        true
                    }
                    Err(CorruptError) => {
                        // Heal in place; the blocked reader keeps waiting
                        ring.reset();
                        ring.stats.resets += 1;
                        false
                    }
                }
            }
            _ => unreachable!(),
        });
}

/// Admit blocked writers, in priority order, while their messages fit.
fn admit_writers<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static StreamBufferCb<Traits>,
    ring: &mut StreamRing,
) {
    cb.writer_queue
        .wake_up_while(lock.borrow_mut(), |payload, _| match payload {
            WaitPayload::StreamSend { data, len } => {
                if HEADER_BYTES + *len > ring.free_space() {
                    return false;
                }
                // Safety: The writer's message outlives its wait
                unsafe { ring.write_message(data.as_ptr(), *len) };
                true
            }
            _ => unreachable!(),
        });
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a stream buffer of `size` bytes of ring storage. The largest
    /// single message it can carry is `size - 5` bytes.
    pub fn create_stream_buffer(size: usize) -> Result<StreamBufferId, CreateStreamBufferError> {
        crate::error::reported::<Traits, _, _>((|| {
            if size <= HEADER_BYTES + 1 {
                return Err(CreateStreamBufferError::BadParam);
            }
            let mut lock = klock::lock_cpu::<Traits>()?;

            let (i, cb) = Traits::stream_buffer_cb_pool()
                .iter()
                .enumerate()
                .find(|(_, cb)| !cb.slot.get(&*lock))
                .ok_or(CreateStreamBufferError::NoMemory)?;

            // Safety: Kernel lock active
            let buf = unsafe { Traits::allocate_memory(size) }
                .ok_or(CreateStreamBufferError::NoMemory)?;

            cb.slot.replace(&mut *lock, true);
            cb.ring
                .replace(&mut *lock, StreamRing::new(buf.as_ptr(), size));

            Ok(StreamBufferId(id_from_index(i)))
        })())
    }

    /// Send one message of `data.len()` bytes, blocking for up to `timeout`
    /// until the buffer has room for the whole frame. Returns the number of
    /// payload bytes accepted (always `data.len()` on success).
    ///
    /// With [`Timeout::Immediate`] this may be called from interrupt
    /// context.
    pub fn send_stream(
        id: StreamBufferId,
        data: &[u8],
        timeout: Timeout,
    ) -> Result<usize, SendStreamError> {
        crate::error::reported::<Traits, _, _>(send_inner::<Traits>(id, data, timeout))
    }

    /// Receive the next message into `out`. A message longer than `out` is
    /// truncated and its remainder discarded. Returns the number of bytes
    /// copied.
    pub fn receive_stream(
        id: StreamBufferId,
        out: &mut [u8],
        timeout: Timeout,
    ) -> Result<usize, ReceiveStreamError> {
        crate::error::reported::<Traits, _, _>(receive_inner::<Traits>(id, out, timeout))
    }

    /// Begin a zero-copy send of up to `len` payload bytes. Fails with
    /// `Full` when a contiguous frame is unavailable, with `GrantInUse`
    /// when another grant is outstanding, and with `BadParam` when `len` is
    /// below the configured zero-copy threshold or beyond the buffer's
    /// capacity.
    pub fn stream_send_grant(
        id: StreamBufferId,
        len: usize,
    ) -> Result<StreamGrant, StreamGrantError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_stream_cb(lock.borrow_mut(), id)?;
            let mut ring = cb.ring.get(&*lock);

            if len < Traits::ZERO_COPY_THRESHOLD || len > ring.max_message() {
                return Err(StreamGrantError::BadParam);
            }
            if ring.grant.is_some() {
                return Err(StreamGrantError::GrantInUse);
            }

            let payload_off = ring.send_grant(len).ok_or(StreamGrantError::Full)?;
            let grant = StreamGrant {
                // Safety: The offset is within the live ring storage
                ptr: unsafe { NonNull::new_unchecked(ring.buf.add(payload_off)) },
                cap: len,
            };
            cb.ring.replace(&mut *lock, ring);
            Ok(grant)
        })())
    }

    /// Commit a zero-copy send: `actual_len` is patched into the frame
    /// header and the message becomes visible to receivers.
    pub fn stream_send_complete(
        id: StreamBufferId,
        actual_len: usize,
    ) -> Result<(), StreamGrantError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_stream_cb(lock.borrow_mut(), id)?;
            let mut ring = cb.ring.get(&*lock);

            ring.send_complete(actual_len)
                .map_err(|()| StreamGrantError::BadParam)?;
            deliver_to_readers(lock.borrow_mut(), cb, &mut ring);
            cb.ring.replace(&mut *lock, ring);

            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        })())
    }

    /// Begin a zero-copy receive of the next message. Returns a pointer to
    /// the payload inside the ring and the payload length. Fails with
    /// `Empty` when no message is queued and with `Full` when the next
    /// message wraps the ring (use [`System::receive_stream`] then).
    pub fn stream_receive_grant(
        id: StreamBufferId,
    ) -> Result<(NonNull<u8>, usize), StreamGrantError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_stream_cb(lock.borrow_mut(), id)?;
            let mut ring = cb.ring.get(&*lock);

            if ring.grant.is_some() {
                return Err(StreamGrantError::GrantInUse);
            }
            if ring.is_empty() {
                return Err(StreamGrantError::Empty);
            }

            match ring.receive_grant() {
                Ok(Some((payload_off, len))) => {
                    // Safety: The offset is within the live ring storage
                    let ptr = unsafe { NonNull::new_unchecked(ring.buf.add(payload_off)) };
                    cb.ring.replace(&mut *lock, ring);
                    Ok((ptr, len))
                }
                Ok(None) => Err(StreamGrantError::Full),
                Err(CorruptError) => {
                    ring.reset();
                    ring.stats.resets += 1;
                    cb.ring.replace(&mut *lock, ring);
                    Err(StreamGrantError::Corrupted)
                }
            }
        })())
    }

    /// Finish a zero-copy receive, consuming the exposed message and waking
    /// blocked writers.
    pub fn stream_receive_complete(id: StreamBufferId) -> Result<(), StreamGrantError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_stream_cb(lock.borrow_mut(), id)?;
            let mut ring = cb.ring.get(&*lock);

            ring.receive_complete()
                .map_err(|()| StreamGrantError::BadParam)?;
            admit_writers(lock.borrow_mut(), cb, &mut ring);
            cb.ring.replace(&mut *lock, ring);

            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        })())
    }

    /// Discard the buffer's entire contents, then admit blocked writers.
    pub fn flush_stream(id: StreamBufferId) -> Result<(), QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_stream_cb(lock.borrow_mut(), id)?;
        let mut ring = cb.ring.get(&*lock);

        ring.reset();
        admit_writers(lock.borrow_mut(), cb, &mut ring);
        cb.ring.replace(&mut *lock, ring);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// The payload length of the next queued message, if any. Does not
    /// consume anything.
    pub fn stream_peek_length(id: StreamBufferId) -> Result<Option<usize>, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_stream_cb(lock.borrow_mut(), id)?;
        Ok(cb.ring.get(&*lock).peek_length())
    }

    /// Bytes currently stored, framing included.
    pub fn stream_bytes_available(id: StreamBufferId) -> Result<usize, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_stream_cb(lock.borrow_mut(), id)?;
        Ok(cb.ring.get(&*lock).bytes_avail)
    }

    /// Bytes that can still be stored, framing included.
    pub fn stream_free_space(id: StreamBufferId) -> Result<usize, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_stream_cb(lock.borrow_mut(), id)?;
        Ok(cb.ring.get(&*lock).free_space())
    }

    /// Whether the buffer holds no data at all.
    pub fn is_stream_empty(id: StreamBufferId) -> Result<bool, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_stream_cb(lock.borrow_mut(), id)?;
        Ok(cb.ring.get(&*lock).is_empty())
    }

    /// Whether the buffer has no free space at all.
    pub fn is_stream_full(id: StreamBufferId) -> Result<bool, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_stream_cb(lock.borrow_mut(), id)?;
        Ok(cb.ring.get(&*lock).is_full())
    }

    /// Transfer statistics.
    pub fn stream_stats(id: StreamBufferId) -> Result<StreamStats, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_stream_cb(lock.borrow_mut(), id)?;
        Ok(cb.ring.get(&*lock).stats)
    }

    /// Zero the transfer statistics.
    pub fn reset_stream_stats(id: StreamBufferId) -> Result<(), QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_stream_cb(lock.borrow_mut(), id)?;
        let mut ring = cb.ring.get(&*lock);
        ring.stats = StreamStats::INIT;
        cb.ring.replace(&mut *lock, ring);
        Ok(())
    }

    /// Occupancy counters of the reader and writer wait queues.
    pub fn stream_wait_stats(
        id: StreamBufferId,
    ) -> Result<(WaitQueueStats, WaitQueueStats), QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_stream_cb(lock.borrow_mut(), id)?;
        Ok((
            cb.reader_queue.stats(lock.borrow_mut()),
            cb.writer_queue.stats(lock.borrow_mut()),
        ))
    }

    /// Delete a stream buffer, waking all blocked readers and writers with
    /// a `Deleted` disposition and releasing the storage.
    pub fn delete_stream_buffer(id: StreamBufferId) -> Result<(), DeleteStreamBufferError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_stream_cb(lock.borrow_mut(), id)?;

            cb.reader_queue
                .wake_up_all_with(lock.borrow_mut(), Err(WaitError::Deleted));
            cb.writer_queue
                .wake_up_all_with(lock.borrow_mut(), Err(WaitError::Deleted));

            let ring = cb.ring.replace(&mut *lock, StreamRing::INIT);
            if !ring.buf.is_null() {
                // Safety: Kernel lock active; nothing references the
                // storage anymore
                unsafe {
                    Traits::deallocate_memory(NonNull::new_unchecked(ring.buf), ring.size);
                }
            }
            cb.slot.replace(&mut *lock, false);

            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        })())
    }
}

fn send_inner<Traits: KernelTraits>(
    id: StreamBufferId,
    data: &[u8],
    timeout: Timeout,
) -> Result<usize, SendStreamError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != Timeout::Immediate {
        task::expect_waitable_context::<Traits>()?;
    }
    let cb = live_stream_cb(lock.borrow_mut(), id)?;
    let mut ring = cb.ring.get(&*lock);

    if data.len() > ring.max_message() {
        return Err(SendStreamError::BadParam);
    }

    if HEADER_BYTES + data.len() <= ring.free_space() {
        // Safety: Fits (checked above); `data` is a live slice
        unsafe { ring.write_message(data.as_ptr(), data.len()) };
        deliver_to_readers(lock.borrow_mut(), cb, &mut ring);
        cb.ring.replace(&mut *lock, ring);
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(data.len());
    }

    match timeout {
        Timeout::Immediate => Err(SendStreamError::Full),
        Timeout::Forever => {
            cb.writer_queue.wait(
                lock.borrow_mut(),
                WaitPayload::StreamSend {
                    data: NonNull::new(data.as_ptr() as *mut u8).unwrap(),
                    len: data.len(),
                },
            )?;
            Ok(data.len())
        }
        Timeout::Ms(ms) => {
            cb.writer_queue.wait_timeout(
                lock.borrow_mut(),
                WaitPayload::StreamSend {
                    data: NonNull::new(data.as_ptr() as *mut u8).unwrap(),
                    len: data.len(),
                },
                timeout::ticks_from_ms::<Traits>(ms),
            )?;
            Ok(data.len())
        }
    }
}

fn receive_inner<Traits: KernelTraits>(
    id: StreamBufferId,
    out: &mut [u8],
    timeout: Timeout,
) -> Result<usize, ReceiveStreamError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != Timeout::Immediate {
        task::expect_waitable_context::<Traits>()?;
    }
    let cb = live_stream_cb(lock.borrow_mut(), id)?;
    let mut ring = cb.ring.get(&*lock);

    if ring.bytes_avail >= HEADER_BYTES {
        // Safety: A header is available; `out` is a live slice
        match unsafe { ring.read_message(out.as_mut_ptr(), out.len()) } {
            Ok(n) => {
                admit_writers(lock.borrow_mut(), cb, &mut ring);
                cb.ring.replace(&mut *lock, ring);
                task::unlock_cpu_and_check_preemption(lock);
                Ok(n)
            }
            Err(CorruptError) => {
                ring.reset();
                ring.stats.resets += 1;
                // The freed space can admit blocked writers again
                admit_writers(lock.borrow_mut(), cb, &mut ring);
                cb.ring.replace(&mut *lock, ring);
                Err(ReceiveStreamError::Corrupted)
            }
        }
    } else {
        let payload = |out: &mut [u8]| WaitPayload::StreamReceive {
            out: NonNull::new(out.as_mut_ptr()).unwrap(),
            max_len: out.len(),
            received: klock::CpuLockCell::new(core::cell::Cell::new(0)),
        };

        let result = match timeout {
            Timeout::Immediate => return Err(ReceiveStreamError::Empty),
            Timeout::Forever => cb.reader_queue.wait(lock.borrow_mut(), payload(out))?,
            Timeout::Ms(ms) => cb.reader_queue.wait_timeout(
                lock.borrow_mut(),
                payload(out),
                timeout::ticks_from_ms::<Traits>(ms),
            )?,
        };

        // The number of copied bytes was recorded by the waker
        if let WaitPayload::StreamReceive { received, .. } = result {
            Ok(received.read(&*lock).get())
        } else {
            unreachable!()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with_storage(size: usize) -> (StreamRing, Vec<u8>) {
        let mut storage = vec![0u8; size];
        let ring = StreamRing::new(storage.as_mut_ptr(), size);
        (ring, storage)
    }

    fn send(ring: &mut StreamRing, data: &[u8]) {
        assert!(HEADER_BYTES + data.len() <= ring.free_space());
        unsafe { ring.write_message(data.as_ptr(), data.len()) };
    }

    fn recv(ring: &mut StreamRing, max: usize) -> Vec<u8> {
        let mut out = vec![0u8; max];
        let n = unsafe { ring.read_message(out.as_mut_ptr(), max) }
            .ok()
            .expect("message should decode");
        out.truncate(n);
        out
    }

    #[test]
    fn accounting_invariant_holds() {
        let (mut ring, _storage) = ring_with_storage(64);
        assert_eq!(ring.bytes_avail + ring.free_space() + 1, 64);

        send(&mut ring, b"hello");
        assert_eq!(ring.bytes_avail, 9);
        assert_eq!(ring.bytes_avail + ring.free_space() + 1, 64);

        assert_eq!(recv(&mut ring, 16), b"hello");
        assert_eq!(ring.bytes_avail + ring.free_space() + 1, 64);
        assert!(ring.is_empty());
    }

    #[test]
    fn truncated_receive_discards_remainder() {
        let (mut ring, _storage) = ring_with_storage(256);

        send(&mut ring, b"HELLOWORLD");
        assert_eq!(recv(&mut ring, 4), b"HELL");

        // The remaining 6 payload bytes were skipped along with the header
        assert!(ring.is_empty());
        assert_eq!(ring.peek_length(), None);
    }

    #[test]
    fn messages_wrap_around() {
        let (mut ring, _storage) = ring_with_storage(32);

        // Walk the ring so that messages straddle the boundary
        for i in 0u8..20 {
            let msg = [i, i.wrapping_mul(3), i.wrapping_mul(7)];
            send(&mut ring, &msg);
            send(&mut ring, &[i ^ 0xff]);
            assert_eq!(recv(&mut ring, 8), msg);
            assert_eq!(recv(&mut ring, 8), [i ^ 0xff]);
        }
        assert_eq!(ring.stats.messages_sent, 40);
        assert_eq!(ring.stats.messages_received, 40);
    }

    #[test]
    fn exact_fit_succeeds_and_one_more_byte_does_not() {
        let (mut ring, _storage) = ring_with_storage(64);

        let fit = ring.free_space() - HEADER_BYTES;
        let data = vec![0x5a; fit];
        send(&mut ring, &data);
        assert!(ring.is_full());
        assert_eq!(ring.free_space(), 0);

        assert_eq!(recv(&mut ring, fit), data);
    }

    #[test]
    fn corrupt_header_is_detected() {
        let (mut ring, mut storage) = ring_with_storage(32);

        send(&mut ring, b"ok");
        // Overwrite the length header with nonsense
        storage[0] = 0xff;
        storage[1] = 0xff;

        let mut out = [0u8; 8];
        assert!(unsafe { ring.read_message(out.as_mut_ptr(), 8) }.is_err());
    }

    #[test]
    fn zero_copy_commit_patches_the_header() {
        let (mut ring, storage) = ring_with_storage(1024);

        let payload_off = ring.send_grant(200).expect("contiguous space");
        assert_eq!(payload_off, HEADER_BYTES);
        // The message is not visible until committed
        assert!(ring.is_empty());

        ring.send_complete(150).unwrap();
        assert_eq!(ring.peek_length(), Some(150));
        assert_eq!(&storage[..HEADER_BYTES], &150u32.to_le_bytes());

        let got = recv(&mut ring, 200);
        assert_eq!(got.len(), 150);
        assert_eq!(ring.bytes_avail, 0);
    }

    #[test]
    fn zero_copy_realigns_an_empty_ring() {
        let (mut ring, _storage) = ring_with_storage(64);

        // Park the head near the end of the buffer
        send(&mut ring, &[0u8; 50]);
        assert_eq!(recv(&mut ring, 64), [0u8; 50]);
        assert!(ring.head > 32);

        // Contiguous space is short, but the ring is empty, so the grant
        // realigns it
        let payload_off = ring.send_grant(40).expect("realigned grant");
        assert_eq!(payload_off, HEADER_BYTES);
        ring.send_complete(40).unwrap();
        assert_eq!(ring.peek_length(), Some(40));
    }

    #[test]
    fn zero_copy_receive_requires_contiguity() {
        let (mut ring, _storage) = ring_with_storage(32);

        // Lay down a message that wraps the boundary
        send(&mut ring, &[1u8; 20]);
        assert_eq!(recv(&mut ring, 32), [1u8; 20]);
        send(&mut ring, &[2u8; 16]);

        assert!(matches!(ring.receive_grant(), Ok(None)));

        // The copying interface still reads it fine
        assert_eq!(recv(&mut ring, 32), [2u8; 16]);
    }

    #[test]
    fn grant_tracks_exclusivity() {
        let (mut ring, _storage) = ring_with_storage(256);

        ring.send_grant(64).unwrap();
        assert!(ring.grant.is_some());
        ring.send_complete(64).unwrap();
        assert!(ring.grant.is_none());

        let (_, len) = ring.receive_grant().unwrap().unwrap();
        assert_eq!(len, 64);
        ring.receive_complete().unwrap();
        assert!(ring.is_empty());
    }
}
