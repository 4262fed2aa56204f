//! The per-core idle tasks.
//!
//! Each core owns one always-Ready task at priority 0 that (a) reclaims
//! Terminated tasks, (b) periodically verifies every live task's stack
//! canary, and (c) sleeps the core between passes.
use arrayvec::ArrayVec;

use crate::{
    klock, smp, task,
    task::{TaskId, TaskSt},
    wait, KernelTraits, MAX_CORES,
};

static IDLE_TASK_NAMES: [&str; MAX_CORES] = ["idle0", "idle1"];

/// Create one idle task per configured core. Called once during boot.
///
/// Panics if a control-block slot or stack memory cannot be obtained — a
/// kernel configured with no room for its own idle tasks cannot run.
pub(crate) fn create_idle_tasks<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    for core in 0..Traits::NUM_CORES {
        let cb = task::create_kernel_task(
            lock.borrow_mut(),
            IDLE_TASK_NAMES[core],
            idle_task_body::<Traits>,
            core,
            Traits::IDLE_STACK_SIZE,
            0,
            smp::Affinity::Core(core),
        )
        .unwrap_or_else(|| panic!("no room for the core {} idle task", core));

        Traits::state()
            .core(core)
            .idle_task
            .replace(&mut *lock, Some(cb));
    }
}

/// The idle loop. `core` is the core this instance is pinned to.
fn idle_task_body<Traits: KernelTraits>(core: usize) {
    let mut scan_countdown = Traits::CANARY_SCAN_INTERVAL;

    loop {
        {
            let mut lock = klock::lock_cpu::<Traits>().unwrap_or_else(|_| unreachable!());
            task::reap_terminated_tasks(lock.borrow_mut());
            smp::count_idle_loop(lock.borrow_mut(), core);
        }

        scan_countdown -= 1;
        if scan_countdown == 0 {
            scan_countdown = Traits::CANARY_SCAN_INTERVAL;
            scan_stack_canaries::<Traits>();
        }

        Traits::idle_wait();
    }
}

/// Check every live task's stack canary. A corrupted task is forced to the
/// Terminated state and the overflow hook is invoked; without a hook the
/// core halts.
fn scan_stack_canaries<Traits: KernelTraits>() {
    let mut offenders: ArrayVec<(TaskId, &'static str), 4> = ArrayVec::new();

    {
        let mut lock = klock::lock_cpu::<Traits>().unwrap_or_else(|_| unreachable!());

        for cb in Traits::task_cb_pool() {
            match *cb.st.read(&*lock) {
                TaskSt::Dormant | TaskSt::Terminated => continue,
                _ => {}
            }
            if task::canary_intact(cb) {
                continue;
            }

            match *cb.st.read(&*lock) {
                TaskSt::Ready => {
                    let pri = cb.effective_priority.get(&*lock);
                    Traits::state()
                        .ready_queue()
                        .remove_task(lock.borrow_mut(), cb, pri);
                }
                TaskSt::Blocked => {
                    wait::abandon_wait(lock.borrow_mut(), cb);
                }
                TaskSt::Suspended => {}
                TaskSt::Running => {
                    // Executing on the other core; it cannot be torn out of
                    // its context, but the violation is still reported
                    let _ = offenders.try_push((task::task_id_of(cb), cb.name()));
                    continue;
                }
                _ => unreachable!(),
            }

            crate::mutex::abandon_held_mutexes(lock.borrow_mut(), cb);
            cb.st.replace(&mut *lock, TaskSt::Terminated);
            let _ = offenders.try_push((task::task_id_of(cb), cb.name()));
        }
    }

    if offenders.is_empty() {
        return;
    }

    let hook = klock::lock_cpu::<Traits>()
        .ok()
        .and_then(|mut lock| Traits::state().stack_overflow_hook().get(&*lock.borrow_mut()));

    for (id, name) in &offenders {
        log::error!("stack canary corrupted: task {:?} {:?}", id, name);
        match hook {
            Some(hook) => hook(*id, name),
            None => loop {
                // No handler installed: halt this core
                Traits::idle_wait();
            },
        }
    }
}
