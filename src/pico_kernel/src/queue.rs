//! Bounded message queues: fixed-size items copied by value, with separate
//! sender and receiver wait sets.
//!
//! Hand-off is done by the wake side: a sender finding a blocked receiver
//! copies the item straight into the receiver's buffer; a receiver that
//! frees a slot moves the highest-priority blocked sender's item into the
//! ring. A woken task therefore finds its operation already completed, and
//! partial copies are impossible (every copy happens inside the kernel
//! critical section).
use core::{fmt, ptr::NonNull};

use crate::{
    error::{
        CreateQueueError, DeleteQueueError, PeekQueueError, QueryObjectError, ReceiveQueueError,
        SendQueueError, WaitError,
    },
    id_from_index, klock, task, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue, WaitQueueStats},
    Id, KernelTraits, PortThreading, System, Timeout,
};

/// Identifies a message queue. See [`System::create_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) Id);

/// The storage of a queue: a ring of `capacity` slots of `item_size` bytes.
///
/// Pure index arithmetic; the byte copies are the caller's business. The
/// invariant `head = (tail + len) mod capacity` holds between calls.
#[derive(Clone, Copy)]
pub(crate) struct QueueRing {
    buf: *mut u8,
    item_size: usize,
    capacity: usize,
    /// Slot index of the next write.
    head: usize,
    /// Slot index of the next read.
    tail: usize,
    len: usize,
}

// Safety: The buffer is only touched under the kernel lock.
unsafe impl Send for QueueRing {}

impl Init for QueueRing {
    const INIT: Self = Self {
        buf: core::ptr::null_mut(),
        item_size: 0,
        capacity: 0,
        head: 0,
        tail: 0,
        len: 0,
    };
}

impl QueueRing {
    fn new(buf: *mut u8, item_size: usize, capacity: usize) -> Self {
        Self {
            buf,
            item_size,
            capacity,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Copy one item into the ring.
    ///
    /// # Safety
    ///
    /// The ring is not full; `item` points at `item_size` readable bytes.
    unsafe fn push(&mut self, item: *const u8) {
        debug_assert!(!self.is_full());
        // Safety: The slot is within the buffer
        unsafe {
            core::ptr::copy_nonoverlapping(
                item,
                self.buf.add(self.head * self.item_size),
                self.item_size,
            );
        }
        self.head = (self.head + 1) % self.capacity;
        self.len += 1;
    }

    /// Copy the oldest item out of the ring.
    ///
    /// # Safety
    ///
    /// The ring is not empty; `out` points at `item_size` writable bytes.
    unsafe fn pop(&mut self, out: *mut u8) {
        debug_assert!(!self.is_empty());
        // Safety: The slot is within the buffer
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.buf.add(self.tail * self.item_size),
                out,
                self.item_size,
            );
        }
        self.tail = (self.tail + 1) % self.capacity;
        self.len -= 1;
    }

    /// Copy the oldest item without consuming it.
    ///
    /// # Safety
    ///
    /// The ring is not empty; `out` points at `item_size` writable bytes.
    unsafe fn peek(&self, out: *mut u8) {
        debug_assert!(!self.is_empty());
        // Safety: The slot is within the buffer
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.buf.add(self.tail * self.item_size),
                out,
                self.item_size,
            );
        }
    }
}

/// *Queue control block* — the state data of a message queue.
pub struct QueueCb<Traits: PortThreading> {
    /// Whether this pool slot is in use.
    pub(crate) slot: klock::CpuLockCell<Traits, bool>,

    pub(crate) ring: klock::CpuLockCell<Traits, QueueRing>,

    /// Tasks blocked sending to a full queue.
    pub(crate) send_queue: WaitQueue<Traits>,

    /// Tasks blocked receiving from an empty queue.
    pub(crate) receive_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for QueueCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        slot: klock::CpuLockCell::new(false),
        ring: klock::CpuLockCell::new(QueueRing::INIT),
        send_queue: WaitQueue::INIT,
        receive_queue: WaitQueue::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for QueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("self", &(self as *const _))
            .field("send_queue", &self.send_queue)
            .field("receive_queue", &self.receive_queue)
            .finish()
    }
}

fn live_queue_cb<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    id: QueueId,
) -> Result<&'static QueueCb<Traits>, crate::error::BadIdError> {
    let cb = Traits::get_queue_cb(id.0.get() - 1).ok_or(crate::error::BadIdError::BadId)?;
    if cb.slot.get(&*lock) {
        Ok(cb)
    } else {
        Err(crate::error::BadIdError::BadId)
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a queue of `capacity` items of `item_size` bytes each.
    pub fn create_queue(item_size: usize, capacity: usize) -> Result<QueueId, CreateQueueError> {
        crate::error::reported::<Traits, _, _>((|| {
            if item_size == 0 || capacity == 0 {
                return Err(CreateQueueError::BadParam);
            }
            let bytes = item_size
                .checked_mul(capacity)
                .ok_or(CreateQueueError::BadParam)?;

            let mut lock = klock::lock_cpu::<Traits>()?;

            let (i, cb) = Traits::queue_cb_pool()
                .iter()
                .enumerate()
                .find(|(_, cb)| !cb.slot.get(&*lock))
                .ok_or(CreateQueueError::NoMemory)?;

            // Safety: Kernel lock active
            let buf = unsafe { Traits::allocate_memory(bytes) }
                .ok_or(CreateQueueError::NoMemory)?;

            cb.slot.replace(&mut *lock, true);
            cb.ring
                .replace(&mut *lock, QueueRing::new(buf.as_ptr(), item_size, capacity));

            Ok(QueueId(id_from_index(i)))
        })())
    }

    /// Send an item (copied by value). `item` must be exactly the queue's
    /// item size. Blocks for up to `timeout` while the queue is full.
    ///
    /// With [`Timeout::Immediate`] this may be called from interrupt
    /// context.
    pub fn send_queue(id: QueueId, item: &[u8], timeout: Timeout) -> Result<(), SendQueueError> {
        crate::error::reported::<Traits, _, _>(send_inner::<Traits>(id, item, timeout))
    }

    /// Receive the oldest item into `out` (which must hold at least one
    /// item). Blocks for up to `timeout` while the queue is empty.
    ///
    /// With [`Timeout::Immediate`] this may be called from interrupt
    /// context.
    pub fn receive_queue(
        id: QueueId,
        out: &mut [u8],
        timeout: Timeout,
    ) -> Result<(), ReceiveQueueError> {
        crate::error::reported::<Traits, _, _>(receive_inner::<Traits>(id, out, timeout))
    }

    /// Copy the oldest item into `out` without consuming it.
    pub fn peek_queue(id: QueueId, out: &mut [u8]) -> Result<(), PeekQueueError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_queue_cb(lock.borrow_mut(), id)?;
            let ring = cb.ring.get(&*lock);

            if out.len() < ring.item_size {
                return Err(PeekQueueError::BadParam);
            }
            if ring.is_empty() {
                return Err(PeekQueueError::Empty);
            }
            // Safety: Bounds checked above
            unsafe { ring.peek(out.as_mut_ptr()) };
            Ok(())
        })())
    }

    /// The number of items currently queued.
    pub fn queue_len(id: QueueId) -> Result<usize, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_queue_cb(lock.borrow_mut(), id)?;
        Ok(cb.ring.get(&*lock).len)
    }

    /// The queue's capacity in items.
    pub fn queue_capacity(id: QueueId) -> Result<usize, QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_queue_cb(lock.borrow_mut(), id)?;
        Ok(cb.ring.get(&*lock).capacity)
    }

    /// Occupancy counters of the sender and receiver wait queues.
    pub fn queue_wait_stats(
        id: QueueId,
    ) -> Result<(WaitQueueStats, WaitQueueStats), QueryObjectError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = live_queue_cb(lock.borrow_mut(), id)?;
        Ok((
            cb.send_queue.stats(lock.borrow_mut()),
            cb.receive_queue.stats(lock.borrow_mut()),
        ))
    }

    /// Delete a queue, waking all blocked senders and receivers with a
    /// `Deleted` disposition and releasing the storage.
    pub fn delete_queue(id: QueueId) -> Result<(), DeleteQueueError> {
        crate::error::reported::<Traits, _, _>((|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = live_queue_cb(lock.borrow_mut(), id)?;

            cb.send_queue
                .wake_up_all_with(lock.borrow_mut(), Err(WaitError::Deleted));
            cb.receive_queue
                .wake_up_all_with(lock.borrow_mut(), Err(WaitError::Deleted));

            let ring = cb.ring.replace(&mut *lock, QueueRing::INIT);
            if !ring.buf.is_null() {
                // Safety: Kernel lock active; nothing references the
                // storage anymore
                unsafe {
                    Traits::deallocate_memory(
                        NonNull::new_unchecked(ring.buf),
                        ring.item_size * ring.capacity,
                    );
                }
            }
            cb.slot.replace(&mut *lock, false);

            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        })())
    }
}

fn send_inner<Traits: KernelTraits>(
    id: QueueId,
    item: &[u8],
    timeout: Timeout,
) -> Result<(), SendQueueError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != Timeout::Immediate {
        task::expect_waitable_context::<Traits>()?;
    }
    let cb = live_queue_cb(lock.borrow_mut(), id)?;
    let mut ring = cb.ring.get(&*lock);

    if item.len() != ring.item_size {
        return Err(SendQueueError::BadParam);
    }

    // Receivers only block while the queue is empty, so a waiting receiver
    // means the item can be handed over directly.
    let mut delivered = false;
    cb.receive_queue
        .wake_up_while(lock.borrow_mut(), |payload, _| {
            if delivered {
                return false;
            }
            match payload {
                WaitPayload::QueueReceive { out } => {
                    // Safety: The receiver's buffer outlives its wait
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            item.as_ptr(),
                            out.as_ptr(),
                            item.len(),
                        );
                    }
                    delivered = true;
                    true
                }
                _ => unreachable!(),
            }
        });
    if delivered {
        debug_assert!(ring.is_empty());
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    if !ring.is_full() {
        // Safety: Not full; `item` has `item_size` bytes (checked above)
        unsafe { ring.push(item.as_ptr()) };
        cb.ring.replace(&mut *lock, ring);
        return Ok(());
    }

    match timeout {
        Timeout::Immediate => Err(SendQueueError::Full),
        Timeout::Forever => {
            cb.send_queue.wait(
                lock.borrow_mut(),
                WaitPayload::QueueSend {
                    item: NonNull::new(item.as_ptr() as *mut u8).unwrap(),
                },
            )?;
            Ok(())
        }
        Timeout::Ms(ms) => {
            cb.send_queue.wait_timeout(
                lock.borrow_mut(),
                WaitPayload::QueueSend {
                    item: NonNull::new(item.as_ptr() as *mut u8).unwrap(),
                },
                timeout::ticks_from_ms::<Traits>(ms),
            )?;
            Ok(())
        }
    }
}

fn receive_inner<Traits: KernelTraits>(
    id: QueueId,
    out: &mut [u8],
    timeout: Timeout,
) -> Result<(), ReceiveQueueError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != Timeout::Immediate {
        task::expect_waitable_context::<Traits>()?;
    }
    let cb = live_queue_cb(lock.borrow_mut(), id)?;
    let mut ring = cb.ring.get(&*lock);

    if out.len() < ring.item_size {
        return Err(ReceiveQueueError::BadParam);
    }

    if !ring.is_empty() {
        // Safety: Not empty; `out` holds an item (checked above)
        unsafe { ring.pop(out.as_mut_ptr()) };

        // A slot came free: admit the highest-priority blocked sender
        cb.send_queue.wake_up_while(lock.borrow_mut(), |payload, _| {
            if ring.is_full() {
                return false;
            }
            match payload {
                WaitPayload::QueueSend { item } => {
                    // Safety: The sender's item outlives its wait
                    unsafe { ring.push(item.as_ptr()) };
                    true
                }
                _ => unreachable!(),
            }
        });

        cb.ring.replace(&mut *lock, ring);
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    match timeout {
        Timeout::Immediate => Err(ReceiveQueueError::Empty),
        Timeout::Forever => {
            cb.receive_queue.wait(
                lock.borrow_mut(),
                WaitPayload::QueueReceive {
                    out: NonNull::new(out.as_mut_ptr()).unwrap(),
                },
            )?;
            Ok(())
        }
        Timeout::Ms(ms) => {
            cb.receive_queue.wait_timeout(
                lock.borrow_mut(),
                WaitPayload::QueueReceive {
                    out: NonNull::new(out.as_mut_ptr()).unwrap(),
                },
                timeout::ticks_from_ms::<Traits>(ms),
            )?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with_storage(item_size: usize, capacity: usize) -> (QueueRing, Vec<u8>) {
        let mut storage = vec![0u8; item_size * capacity];
        let ring = QueueRing::new(storage.as_mut_ptr(), item_size, capacity);
        (ring, storage)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (mut ring, _storage) = ring_with_storage(4, 3);

        for i in 0u32..3 {
            assert!(!ring.is_full());
            unsafe { ring.push(i.to_le_bytes().as_ptr()) };
        }
        assert!(ring.is_full());

        for i in 0u32..3 {
            let mut out = [0u8; 4];
            unsafe { ring.pop(out.as_mut_ptr()) };
            assert_eq!(u32::from_le_bytes(out), i);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_around() {
        let (mut ring, _storage) = ring_with_storage(2, 2);
        let mut out = [0u8; 2];

        for round in 0u8..5 {
            unsafe { ring.push([round, 0xaa].as_ptr()) };
            unsafe { ring.push([round, 0xbb].as_ptr()) };
            assert!(ring.is_full());
            assert_eq!(ring.head, ring.tail);

            unsafe { ring.pop(out.as_mut_ptr()) };
            assert_eq!(out, [round, 0xaa]);
            unsafe { ring.peek(out.as_mut_ptr()) };
            assert_eq!(out, [round, 0xbb]);
            unsafe { ring.pop(out.as_mut_ptr()) };
            assert_eq!(out, [round, 0xbb]);
            assert!(ring.is_empty());
        }
    }
}
