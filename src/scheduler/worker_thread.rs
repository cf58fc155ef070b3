//! The steal protocol, victim selection, and leapfrogging (§4.4).
//!
//! This module holds the logic shared between a worker's idle loop (looking for *any* work) and
//! a syncing owner's leapfrog loop (looking for work specifically from the worker that stole its
//! child task). Both boil down to the same primitive: try a bounded sequence of victims, steal
//! from whichever one has public work, and run whatever was stolen.

use super::deque::StealOutcome;
use super::task::{Task, Thief};
use super::{SchedulerInner, WorkerId};
use crate::util::Xorshift64;
use crossbeam_utils::Backoff;
use std::cell::Cell;

/// Attempts one steal against `victim`. On success, runs the stolen task to completion on the
/// calling thread before returning. Returns whether anything was stolen, for the caller's
/// retry/backoff bookkeeping.
pub(super) fn try_steal_from(scheduler: &SchedulerInner, victim: WorkerId) -> bool {
    let deque = &scheduler.workers[victim.0].deque;
    match deque.steal() {
        StealOutcome::Stolen(index) => {
            let cell = deque.stolen_slot(index);
            // SAFETY: winning the tail CAS in `steal()` grants exclusive access to this slot's
            // task body until we mark it completed.
            let task: &mut Task = unsafe { &mut *cell.get() };
            unsafe { task.run() };
            true
        }
        StealOutcome::Busy | StealOutcome::NoWork => false,
    }
}

/// Picks a bounded linear run of neighbor workers to probe, excluding `self_id`, per §4.4's
/// "mostly a linear scan ... periodically randomized via xorshift" hybrid policy.
pub(super) fn pick_victim(
    scheduler: &SchedulerInner,
    self_id: WorkerId,
    rng: &Cell<Xorshift64>,
    attempt: u32,
) -> WorkerId {
    let n = scheduler.workers.len();
    debug_assert!(n > 1, "stealing requires at least two workers");
    let mut state = rng.get();
    let pick = if attempt % 7 == 0 {
        // Periodic full randomization to avoid pathological repeated-neighbor patterns.
        state.gen_below(n)
    } else {
        let scan_width = scheduler.config.linear_scan_width.max(1);
        let offset = 1 + state.gen_below(scan_width.min(n - 1).max(1));
        (self_id.0 + offset) % n
    };
    rng.set(state);
    if pick == self_id.0 {
        WorkerId((pick + 1) % n)
    } else {
        WorkerId(pick)
    }
}

/// The idle work-search loop run by a worker with nothing of its own left to do: probe victims
/// until one yields work, invoking the stealing-hint callback on repeated failure, until the
/// scheduler signals shutdown.
pub(super) fn hunt_for_work(scheduler: &SchedulerInner, self_id: WorkerId, rng: &Cell<Xorshift64>) {
    let mut attempt: u32 = 0;
    let backoff = Backoff::new();
    loop {
        if !scheduler.running.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
        let victim = pick_victim(scheduler, self_id, rng, attempt);
        if try_steal_from(scheduler, victim) {
            return;
        }
        attempt = attempt.wrapping_add(1);
        if let Some(hint) = scheduler.stealing_hint {
            hint();
        } else {
            backoff.snooze();
        }
        log::trace!(
            target: "bdd_core::scheduler",
            "worker {} idle-steal attempt {attempt} against worker {} missed",
            self_id.0, victim.0
        );
        if attempt > 4096 && !scheduler.running.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
    }
}

/// Pursues `thief` to steal the work *it* spawned, per §4.4 "Sync and leapfrogging". Blocks
/// (spinning, with periodic steal attempts elsewhere) until `task` is observed completed.
pub(super) fn leapfrog(
    scheduler: &SchedulerInner,
    self_id: WorkerId,
    rng: &Cell<Xorshift64>,
    thief: WorkerId,
    task: &Task,
) {
    let mut patience = scheduler.config.leapfrog_patience;
    let backoff = Backoff::new();
    loop {
        match task.thief.load() {
            Thief::Completed => return,
            Thief::Unstolen => {
                // The thief CAS raced and lost; whoever holds the task now will complete it.
                // Spin briefly; this window is always short (§5, no suspension points).
                backoff.spin();
                continue;
            }
            Thief::Claimed => {}
        }
        if try_steal_from(scheduler, thief) {
            backoff.reset();
            continue; // We made progress on the thief's own queue; recheck completion.
        }
        if patience == 0 {
            let random_victim = pick_victim(scheduler, self_id, rng, u32::MAX);
            try_steal_from(scheduler, random_victim);
            patience = scheduler.config.leapfrog_patience;
        } else {
            patience -= 1;
            if let Some(hint) = scheduler.stealing_hint {
                hint();
            } else {
                backoff.snooze();
            }
        }
    }
}
