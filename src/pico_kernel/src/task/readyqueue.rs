//! Task ready queue implementation (internal use only).
//!
//! A per-priority intrusive FIFO list (threaded through
//! [`TaskCb::ready_link`]) plus a one-word priority bitmap for constant-time
//! highest-priority lookup. The queue is global — on dual-core builds both
//! cores pop from it, filtered by task affinity.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    smp,
    task::TaskCb,
    utils::{prio_bitmap::PrioBitmap, Init},
    KernelTraits, PortThreading, Priority, MAX_PRIORITY_LEVELS,
};

/// The outcome of a scheduling decision made by [`ReadyQueue::pop_front_task`].
pub(crate) enum ScheduleDecision<T> {
    /// Keep the current task running.
    Keep,
    /// Switch to the given task (`None` = nothing runnable).
    SwitchTo(Option<T>),
}

/// One priority level's FIFO of Ready tasks.
struct Level<Traits: PortThreading> {
    first: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
    last: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
}

impl<Traits: PortThreading> Init for Level<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        first: CpuLockCell::new(None),
        last: CpuLockCell::new(None),
    };
}

pub(crate) struct ReadyQueue<Traits: PortThreading> {
    /// Bit `p` set ⇔ `levels[p]` is non-empty.
    bitmap: CpuLockCell<Traits, PrioBitmap>,
    levels: [Level<Traits>; MAX_PRIORITY_LEVELS],
}

impl<Traits: PortThreading> Init for ReadyQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        bitmap: CpuLockCell::new(PrioBitmap::INIT),
        levels: Init::INIT,
    };
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// Insert `task` at the tail of its effective priority's FIFO.
    ///
    /// Inserting at the tail realizes both FIFO ordering among equals and
    /// round-robin rotation (a preempted or yielding task goes to the back).
    ///
    /// # Safety
    ///
    /// `task` must not currently be in the queue.
    pub(crate) unsafe fn push_back_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
    ) {
        let pri = task.effective_priority.get(&*lock) as usize;
        let level = &self.levels[pri];

        task.ready_link.replace(&mut *lock, None);
        match level.last.get(&*lock) {
            Some(last) => {
                last.ready_link.replace(&mut *lock, Some(task));
            }
            None => {
                level.first.replace(&mut *lock, Some(task));
            }
        }
        level.last.replace(&mut *lock, Some(task));
        self.bitmap.write(&mut *lock).set(pri);
    }

    /// Unlink `task` from the FIFO of the given priority level (its
    /// effective priority unless the caller is repositioning it after a
    /// priority change). Returns `false` if the task was not linked there.
    pub(crate) fn remove_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
        pri: Priority,
    ) -> bool {
        let level = &self.levels[pri as usize];

        let mut prev: Option<&'static TaskCb<Traits>> = None;
        let mut cur = level.first.get(&*lock);
        while let Some(t) = cur {
            if core::ptr::eq(t, task) {
                let next = t.ready_link.replace(&mut *lock, None);
                match prev {
                    Some(p) => {
                        p.ready_link.replace(&mut *lock, next);
                    }
                    None => {
                        level.first.replace(&mut *lock, next);
                    }
                }
                if next.is_none() {
                    level.last.replace(&mut *lock, prev);
                }
                if level.first.get(&*lock).is_none() {
                    self.bitmap.write(&mut *lock).clear(pri as usize);
                }
                return true;
            }
            prev = Some(t);
            cur = t.ready_link.get(&*lock);
        }
        false
    }

    /// Choose the next task for `core`.
    ///
    /// `prev_task_priority` is the effective priority of the task that
    /// would keep running if this decision does not preempt it, or `None`
    /// if the core has no runnable current task. Only a *strictly* higher
    /// priority task preempts; rotation among equals is realized by the
    /// caller re-enqueueing the current task before asking.
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` has been
    /// removed from the queue.
    pub(crate) fn pop_front_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        core: usize,
        prev_task_priority: Option<Priority>,
    ) -> ScheduleDecision<&'static TaskCb<Traits>> {
        let bitmap = self.bitmap.get(&*lock);
        for pri in bitmap.iter_down() {
            if let Some(prev) = prev_task_priority {
                if pri <= prev as usize {
                    return ScheduleDecision::Keep;
                }
            }

            let mut prev_link: Option<&'static TaskCb<Traits>> = None;
            let mut cur = self.levels[pri].first.get(&*lock);
            while let Some(t) = cur {
                if smp::can_run_on(lock.borrow_mut(), t, core) {
                    let next = t.ready_link.replace(&mut *lock, None);
                    let level = &self.levels[pri];
                    match prev_link {
                        Some(p) => {
                            p.ready_link.replace(&mut *lock, next);
                        }
                        None => {
                            level.first.replace(&mut *lock, next);
                        }
                    }
                    if next.is_none() {
                        level.last.replace(&mut *lock, prev_link);
                    }
                    if level.first.get(&*lock).is_none() {
                        self.bitmap.write(&mut *lock).clear(pri);
                    }
                    return ScheduleDecision::SwitchTo(Some(t));
                }
                prev_link = Some(t);
                cur = t.ready_link.get(&*lock);
            }
        }

        if prev_task_priority.is_some() {
            ScheduleDecision::Keep
        } else {
            ScheduleDecision::SwitchTo(None)
        }
    }

    /// The highest effective priority among Ready tasks that `core` is
    /// allowed to run, if any.
    pub(crate) fn highest_ready_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        core: usize,
    ) -> Option<Priority> {
        let bitmap = self.bitmap.get(&*lock);
        for pri in bitmap.iter_down() {
            let mut cur = self.levels[pri].first.get(&*lock);
            while let Some(t) = cur {
                if smp::can_run_on(lock.borrow_mut(), t, core) {
                    return Some(pri as Priority);
                }
                cur = t.ready_link.get(&*lock);
            }
        }
        None
    }
}
