//! Dual-core coordination: task affinity, sticky core assignment,
//! migration, and per-core statistics.
//!
//! Both cores share the global task graph and ready queue; each core's
//! scheduler filters its pick by [`Affinity`] and the sticky core
//! assignment. A periodic load-balance pass driven by the tick on core 0
//! reassigns `Any`-affinity tasks from the busier core to the other one —
//! immediately when the task is at a safe point (Ready), or via
//! `migration_pending` applied at its next Ready transition. Running tasks
//! and tasks pinned to a single core are never moved.
//!
//! On uniprocessor builds the same code runs with the second core's state
//! inert.
use crate::{
    error::SetAffinityError,
    klock, task,
    task::{TaskCb, TaskId, TaskSt},
    utils::Init,
    KernelTraits, System, UTicks, MAX_CORES,
};

/// Which cores a task may run on. The unset state ([`Affinity::Any`]) lets
/// the scheduler place the task freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// The task may run on either core.
    Any,
    /// The task is pinned to the given core.
    Core(usize),
}

impl Init for Affinity {
    const INIT: Self = Self::Any;
}

/// Per-core scheduling statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreStats {
    /// Context switches that dispatched a task on this core.
    pub dispatches: u32,
    /// Tasks moved onto this core by the load balancer.
    pub migrations_in: u32,
    /// Tasks moved off this core by the load balancer.
    pub migrations_out: u32,
    /// Iterations of this core's idle loop.
    pub idle_loops: u32,
    /// Ticks of the current measurement window spent in a task.
    pub busy_ticks: u32,
    /// Ticks of the current measurement window spent in the idle task.
    pub idle_ticks: u32,
    /// Load of the previous measurement window, 0–100.
    pub load_percent: u8,
}

impl Init for CoreStats {
    const INIT: Self = Self {
        dispatches: 0,
        migrations_in: 0,
        migrations_out: 0,
        idle_loops: 0,
        busy_ticks: 0,
        idle_ticks: 0,
        load_percent: 0,
    };
}

/// Whether `core` is allowed to dispatch `task`: the affinity must admit
/// the core, and an `Any` task sticks to its assigned core until the load
/// balancer moves it.
pub(crate) fn can_run_on<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    core: usize,
) -> bool {
    match task.affinity.get(&*lock) {
        Affinity::Core(c) => c == core,
        Affinity::Any => match task.assigned_core.get(&*lock) {
            None => true,
            Some(c) => c == core,
        },
    }
}

/// Carry out a pending migration. Called whenever the task reaches a safe
/// point (a Ready transition).
pub(crate) fn apply_pending_migration<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let Some(target) = task.migration_pending.replace(&mut *lock, None) else {
        return;
    };
    if task.affinity.get(&*lock) != Affinity::Any {
        return;
    }

    let from = task.assigned_core.replace(&mut *lock, Some(target));
    record_migration(lock.borrow_mut(), from, target);
    log::trace!("migrated {:?} to core {}", task.name(), target);
}

/// After `task` became Ready: if it preempts another core's running task,
/// ask that core to reschedule.
pub(crate) fn notify_other_cores<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    if Traits::NUM_CORES < 2 {
        return;
    }

    let here = Traits::current_core();
    let pri = task.effective_priority.get(&*lock);
    for core in 0..Traits::NUM_CORES {
        if core == here || !can_run_on(lock.borrow_mut(), task, core) {
            continue;
        }
        let preempts = match Traits::state().running_task(lock.borrow_mut(), core) {
            Some(t) if *t.st.read(&*lock) == TaskSt::Running => {
                t.effective_priority.get(&*lock) < pri
            }
            _ => true,
        };
        if preempts {
            // Safety: `core` is not the current core
            unsafe { Traits::request_reschedule(core) };
        }
    }
}

pub(crate) fn count_dispatch<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    core: usize,
) {
    Traits::state().core(core).stats.write(&mut *lock).dispatches += 1;
}

/// Called once per iteration of a core's idle loop.
pub(crate) fn count_idle_loop<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    core: usize,
) {
    Traits::state().core(core).stats.write(&mut *lock).idle_loops += 1;
}

/// Per-tick bookkeeping: sample each core's busy/idle state, and at the
/// load-balance interval fold the window into `load_percent` and run the
/// balance pass. Called from the tick handler.
pub(crate) fn on_tick<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    now: UTicks,
) {
    for core in 0..Traits::NUM_CORES {
        let core_state = Traits::state().core(core);
        let running = Traits::state().running_task(lock.borrow_mut(), core);
        let idle = core_state.idle_task.get(&*lock);
        let is_idle = match (running, idle) {
            (Some(r), Some(i)) => core::ptr::eq(r, i),
            (None, _) => true,
            _ => false,
        };
        let stats = core_state.stats.write(&mut *lock);
        if is_idle {
            stats.idle_ticks += 1;
        } else {
            stats.busy_ticks += 1;
        }
    }

    if now % Traits::LOAD_BALANCE_INTERVAL == 0 {
        for core in 0..Traits::NUM_CORES {
            let stats = Traits::state().core(core).stats.write(&mut *lock);
            let total = stats.busy_ticks + stats.idle_ticks;
            if total != 0 {
                stats.load_percent = (stats.busy_ticks * 100 / total) as u8;
            }
            stats.busy_ticks = 0;
            stats.idle_ticks = 0;
        }

        if Traits::NUM_CORES > 1 && Traits::current_core() == 0 {
            balance::<Traits>(lock.borrow_mut());
        }
    }
}

/// One pass of the load balancer: if one core's backlog of assigned Ready
/// tasks exceeds the other's by two or more, move one `Any`-affinity task
/// over.
fn balance<Traits: KernelTraits>(mut lock: klock::CpuLockTokenRefMut<'_, Traits>) {
    let mut backlog = [0usize; MAX_CORES];
    for cb in Traits::task_cb_pool() {
        if *cb.st.read(&*lock) != TaskSt::Ready {
            continue;
        }
        match cb.affinity.get(&*lock) {
            Affinity::Core(c) => backlog[c] += 1,
            Affinity::Any => {
                if let Some(c) = cb.assigned_core.get(&*lock) {
                    backlog[c] += 1;
                }
            }
        }
    }

    let (busy, lazy) = if backlog[0] >= backlog[1] { (0, 1) } else { (1, 0) };
    if backlog[busy] < backlog[lazy] + 2 {
        return;
    }

    // Prefer a task at a safe point (Ready); fall back to marking a Blocked
    // task for migration at its next Ready transition.
    let mut fallback = None;
    for cb in Traits::task_cb_pool() {
        if cb.affinity.get(&*lock) != Affinity::Any
            || cb.assigned_core.get(&*lock) != Some(busy)
        {
            continue;
        }
        match *cb.st.read(&*lock) {
            TaskSt::Ready => {
                let pri = cb.effective_priority.get(&*lock);
                let ready_queue = Traits::state().ready_queue();
                ready_queue.remove_task(lock.borrow_mut(), cb, pri);
                cb.assigned_core.replace(&mut *lock, Some(lazy));
                // Safety: The task was just unlinked
                unsafe { ready_queue.push_back_task(lock.borrow_mut(), cb) };
                record_migration(lock.borrow_mut(), Some(busy), lazy);
                log::trace!("balanced {:?} to core {}", cb.name(), lazy);
                if lazy != Traits::current_core() {
                    // Safety: `lazy` is not the current core
                    unsafe { Traits::request_reschedule(lazy) };
                }
                return;
            }
            TaskSt::Blocked => {
                fallback.get_or_insert(cb);
            }
            _ => {}
        }
    }

    if let Some(cb) = fallback {
        cb.migration_pending.replace(&mut *lock, Some(lazy));
    }
}

fn record_migration<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    from: Option<usize>,
    to: usize,
) {
    if let Some(from) = from {
        Traits::state()
            .core(from)
            .stats
            .write(&mut *lock)
            .migrations_out += 1;
    }
    Traits::state().core(to).stats.write(&mut *lock).migrations_in += 1;
}

impl<Traits: KernelTraits> System<Traits> {
    /// Restrict (or unrestrict) the cores a task may run on.
    ///
    /// Pinning clears the sticky core assignment so the target core can
    /// pick the task up on its next scheduling pass.
    pub fn set_task_affinity(id: TaskId, affinity: Affinity) -> Result<(), SetAffinityError> {
        crate::error::reported::<Traits, _, _>((|| {
            if let Affinity::Core(c) = affinity {
                if c >= Traits::NUM_CORES {
                    return Err(SetAffinityError::BadParam);
                }
            }
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cb = task::live_task_cb(lock.borrow_mut(), id)?;
            cb.affinity.replace(&mut *lock, affinity);
            cb.assigned_core.replace(&mut *lock, None);
            cb.migration_pending.replace(&mut *lock, None);
            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        })())
    }

    /// A task's affinity.
    pub fn task_affinity(id: TaskId) -> Result<Affinity, crate::error::QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task::live_task_cb(lock.borrow_mut(), id)?;
        Ok(cb.affinity.get(&*lock))
    }

    /// The core a task is currently assigned to, if any.
    pub fn task_assigned_core(id: TaskId) -> Result<Option<usize>, crate::error::QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task::live_task_cb(lock.borrow_mut(), id)?;
        Ok(cb.assigned_core.get(&*lock))
    }
}
