//! The split-point work-stealing deque (§4.4 "Deque discipline").
//!
//! A deque is divided by `split` into a private suffix `[split, head)`, touched only by the
//! owner, and a public prefix `[tail, split)`, open to thieves. `tail` and `split` are packed
//! into one `AtomicU64` so a thief's steal and an owner's shrink are each a single CAS on both
//! fields at once, packed as an explicit bit layout instead of a union so the encoding stays
//! auditable from Rust alone.

use super::task::Task;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Unpacked view of the `(tail, split)` pair. Never stored this way; exists for readable
/// call sites around the packed `AtomicU64`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TailSplit {
    pub tail: u32,
    pub split: u32,
}

impl TailSplit {
    #[inline]
    fn pack(self) -> u64 {
        (self.tail as u64) | ((self.split as u64) << 32)
    }

    #[inline]
    fn unpack(word: u64) -> Self {
        TailSplit {
            tail: word as u32,
            split: (word >> 32) as u32,
        }
    }
}

/// Outcome of a steal attempt against one victim deque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealOutcome {
    /// Won the CAS; the task at the returned index is now owned by the thief.
    Stolen(usize),
    /// Another thief won the race for the only available task; try another victim.
    Busy,
    /// The victim's public region was empty.
    NoWork,
}

/// One worker's deque: a fixed-capacity ring of [`Task`] slots plus the owner-private `head` and
/// the publicly-CAS'd `(tail, split)` pair.
pub struct Deque {
    slots: Box<[UnsafeCell<Task>]>,
    mask: usize,
    /// Packed `(tail, split)`, §4.4.
    ts: AtomicU64,
    /// Owner-private write cursor; never touched by a thief.
    head: AtomicUsize,
    /// Latches when the public region has been fully drained; reset on the next spawn.
    allstolen: AtomicBool,
    /// Set by a thief to request the owner grow the public region on its next spawn.
    movesplit: AtomicBool,
}

// SAFETY: `head` is only ever written by the owning worker. `slots` entries in `[tail, head)` may
// be read by a thief only after it wins the `ts` CAS that grants it that slot, which is the same
// discipline a lock-free split-deque needs regardless of how the slots are stored.
unsafe impl Sync for Deque {}

impl Deque {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "deque capacity must be a power of two");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(Task::empty()))
            .collect();
        Deque {
            slots,
            mask: capacity - 1,
            ts: AtomicU64::new(TailSplit { tail: 0, split: 0 }.pack()),
            head: AtomicUsize::new(0),
            allstolen: AtomicBool::new(true),
            movesplit: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    fn slot(&self, index: usize) -> &UnsafeCell<Task> {
        unsafe { self.slots.get_unchecked(index & self.mask) }
    }

    #[inline]
    pub fn tail_split(&self) -> TailSplit {
        TailSplit::unpack(self.ts.load(Ordering::Acquire))
    }

    #[inline]
    pub fn head(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }

    /// Returns the raw slot a new task should be written into before the owner advances `head`.
    /// Only ever called by the owning worker.
    #[inline]
    pub fn head_slot(&self) -> &UnsafeCell<Task> {
        self.slot(self.head())
    }

    pub fn movesplit_requested(&self) -> bool {
        self.movesplit.load(Ordering::Acquire)
    }

    pub fn is_all_stolen(&self) -> bool {
        self.allstolen.load(Ordering::Acquire)
    }

    /// Owner-side bookkeeping run immediately after writing a new task into `head_slot()`,
    /// covering both the all-stolen reset and the grow-share split move.
    pub fn after_spawn(&self) {
        let head = self.head();
        if self.allstolen.load(Ordering::Acquire) {
            self.movesplit.store(false, Ordering::Relaxed);
            self.ts.store(
                TailSplit {
                    tail: head as u32,
                    split: (head + 1) as u32,
                }
                .pack(),
                Ordering::SeqCst,
            );
            self.allstolen.store(false, Ordering::Release);
        } else if self.movesplit.load(Ordering::Acquire) {
            let ts = self.tail_split();
            let new_split = (ts.split as usize + head + 2) / 2;
            self.ts.store(
                TailSplit {
                    tail: ts.tail,
                    split: new_split as u32,
                }
                .pack(),
                Ordering::SeqCst,
            );
            self.movesplit.store(false, Ordering::Relaxed);
        }
        self.head.store(head + 1, Ordering::Relaxed);
    }

    /// Owner-side fast-path check before popping the most recently spawned task off `head`:
    /// true when nothing can have stolen it (the private region is non-empty).
    pub fn owns_top_privately(&self) -> bool {
        let ts = self.tail_split();
        (ts.split as usize) < self.head()
    }

    /// Retracts the owner's `head` by one after a fast-path sync of a private-only task.
    pub fn pop_private(&self) {
        self.head.fetch_sub(1, Ordering::Relaxed);
    }

    /// Attempts to shrink the public region so the top task becomes private again, per §4.4's
    /// "On sync with a potentially-shared task, the owner shrinks" rule. Returns `true` if the
    /// task is now guaranteed private (so the owner may run it without a thief racing it) and
    /// `false` if the region collapsed entirely (`allstolen` latched; caller must leapfrog).
    pub fn shrink_shared(&self) -> bool {
        let ts = self.tail_split();
        if ts.tail == ts.split {
            self.allstolen.store(true, Ordering::Release);
            return false;
        }
        let new_split = (ts.tail + ts.split) / 2;
        self.ts.store(
            TailSplit {
                tail: ts.tail,
                split: new_split,
            }
            .pack(),
            Ordering::SeqCst,
        );
        let tail_now = self.tail_split().tail;
        if tail_now != ts.split {
            if tail_now > new_split {
                let corrected = (tail_now + ts.split) / 2;
                self.ts.store(
                    TailSplit {
                        tail: tail_now,
                        split: corrected,
                    }
                    .pack(),
                    Ordering::SeqCst,
                );
            }
            return true;
        }
        self.allstolen.store(true, Ordering::Release);
        false
    }

    /// A thief's attempt to steal the oldest public task. Excludes the caller from its own
    /// deque by construction (callers only ever invoke this on some *other* worker's deque).
    pub fn steal(&self) -> StealOutcome {
        let ts = self.tail_split();
        if ts.tail >= ts.split {
            return StealOutcome::NoWork;
        }
        let new_ts = TailSplit {
            tail: ts.tail + 1,
            split: ts.split,
        };
        if self
            .ts
            .compare_exchange(ts.pack(), new_ts.pack(), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return StealOutcome::Busy;
        }
        StealOutcome::Stolen(ts.tail as usize)
    }

    /// Returns the slot at a raw index: either one a thief just won via [`Self::steal`], or one
    /// the owner already knows is its own (from a [`SpawnedTask`](super::SpawnedTask) handle).
    #[inline]
    pub fn stolen_slot(&self, index: usize) -> &UnsafeCell<Task> {
        self.slot(index)
    }

    pub fn request_movesplit(&self) {
        self.movesplit.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_deque_is_all_stolen() {
        let dq = Deque::new(64);
        assert!(dq.is_all_stolen());
        assert_eq!(dq.tail_split(), TailSplit { tail: 0, split: 0 });
    }

    #[test]
    fn spawn_from_all_stolen_resets_tail_split_around_head() {
        let dq = Deque::new(64);
        dq.after_spawn();
        assert!(!dq.is_all_stolen());
        let ts = dq.tail_split();
        assert_eq!(ts.tail, 0);
        assert_eq!(ts.split, 1);
        assert_eq!(dq.head(), 1);
    }

    #[test]
    fn steal_fails_on_empty_public_region() {
        let dq = Deque::new(64);
        dq.after_spawn(); // tail=0 split=1, head=1: one private slot, nothing public yet.
        assert_eq!(dq.steal(), StealOutcome::NoWork);
    }

    #[test]
    fn shrink_then_steal_then_pop_private() {
        let dq = Deque::new(64);
        for _ in 0..4 {
            dq.after_spawn();
        }
        // Force the whole region public by requesting a grow-share split and spawning once more.
        dq.request_movesplit();
        dq.after_spawn();
        let ts = dq.tail_split();
        assert!(ts.split > ts.tail, "grow-share should have made some tasks public");

        match dq.steal() {
            StealOutcome::Stolen(idx) => assert!(idx < dq.head()),
            other => panic!("expected a steal to succeed, got {other:?}"),
        }
    }

    #[test]
    fn shrink_shared_reclaims_sole_public_task_when_uncontested() {
        let dq = Deque::new(64);
        dq.after_spawn(); // tail=0, split=1: exactly one task is nominally public.
        // With no concurrent thief, shrinking that single-task window must succeed (the task
        // becomes private again), not collapse to all-stolen.
        assert!(dq.shrink_shared());
        assert!(!dq.is_all_stolen());
    }

    #[test]
    fn shrink_shared_collapses_once_the_sole_task_is_actually_stolen() {
        let dq = Deque::new(64);
        dq.after_spawn(); // tail=0, split=1.
        assert_eq!(dq.steal(), StealOutcome::Stolen(0)); // tail advances to 1.
        let collapsed = !dq.shrink_shared();
        assert!(collapsed);
        assert!(dq.is_all_stolen());
    }
}
