//! The fixed-size task record (§4.4 "Task size").
//!
//! Every spawned task, regardless of arity or payload type, is stored inline in a worker's deque
//! slot as one `Task` record: a small vtable-style function pointer plus a fixed-capacity byte
//! buffer holding the closure's captured arguments and, later, its result. Keeping the record a
//! fixed size (rather than boxing it) is what lets the deque be a flat, cache-line-friendly array
//! instead of an array of pointers.

use static_assertions::const_assert;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Maximum number of bytes a spawned closure's captured environment (and, in place, its result)
/// may occupy. Chosen generously for a handful of machine words; a closure that needs more must
/// box its payload, which is a compile-time choice for the caller, not a runtime one here.
pub const MAX_TASK_PAYLOAD: usize = 48;

const_assert!(MAX_TASK_PAYLOAD % std::mem::size_of::<usize>() == 0);

/// Tri-state life cycle of a task's ownership, expressed as a small enum rather than an
/// overloaded pointer so every state is exhaustively matched in Rust.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Thief {
    /// Nobody has stolen this task yet; only the owner may touch it.
    Unstolen = 0,
    /// Claimed by the worker whose index is carried out-of-band (the deque slot's own index is
    /// enough for the owner to identify who can have stolen it: whoever issued the winning CAS).
    Claimed = 1,
    /// The thief has finished running the task and published its result.
    Completed = 2,
}

/// The atomic cell backing a task's `thief` tri-state. A worker publishes `Completed` with a
/// release store; the syncing owner observes it with an acquire load — that edge is this crate's
/// one cross-thread happens-before relationship for task results (§5).
#[derive(Debug)]
pub struct ThiefCell(AtomicU8);

impl ThiefCell {
    #[inline]
    pub fn new() -> Self {
        ThiefCell(AtomicU8::new(Thief::Unstolen as u8))
    }

    #[inline]
    pub fn load(&self) -> Thief {
        match self.0.load(Ordering::Acquire) {
            0 => Thief::Unstolen,
            1 => Thief::Claimed,
            _ => Thief::Completed,
        }
    }

    /// Attempts the owner-to-thief handoff: succeeds only from `Unstolen`.
    #[inline]
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(
                Thief::Unstolen as u8,
                Thief::Claimed as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Publishes task completion. Called exactly once, by whichever worker (owner or thief)
    /// ends up executing the task body.
    #[inline]
    pub fn mark_completed(&self) {
        self.0.store(Thief::Completed as u8, Ordering::Release);
    }

    #[inline]
    pub fn reset(&self) {
        self.0.store(Thief::Unstolen as u8, Ordering::Relaxed);
    }
}

impl Default for ThiefCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A type-erased task body: reads its arguments out of `payload`, runs the work, and writes its
/// result back into the same bytes. Generated per-arity by the `spawn!`/`sync!`/`call!` macros
/// (§6 "task macros by arity"); never implemented by hand in client code.
pub type TaskFn = unsafe fn(payload: *mut [u8; MAX_TASK_PAYLOAD]);

/// One deque slot. `f` is `None` for an empty slot.
pub struct Task {
    pub f: Option<TaskFn>,
    pub thief: ThiefCell,
    pub payload: [u8; MAX_TASK_PAYLOAD],
}

impl Task {
    pub const fn empty() -> Self {
        Task {
            f: None,
            thief: ThiefCell(AtomicU8::new(Thief::Unstolen as u8)),
            payload: [0u8; MAX_TASK_PAYLOAD],
        }
    }

    /// Runs this task's body in place and marks it completed. Safe to call from either the owner
    /// (fast inline path) or a thief (post-steal execution) — both paths converge here.
    ///
    /// # Safety
    /// `self.f` must be `Some` and `self.payload` must hold a valid argument encoding for it.
    pub unsafe fn run(&mut self) {
        let f = self.f.take().expect("run on an empty task slot");
        unsafe { f(&mut self.payload as *mut _) };
        self.thief.mark_completed();
    }
}

/// Wraps a closure's captured arguments into a task's fixed payload buffer. Panics at the call
/// site (a compile-time-shaped error in the generated macro, per §4.4) if the payload would not
/// fit; in practice the `spawn!` macro is expected to `const_assert!` this before it ever calls
/// in, so this is a backstop, not the primary enforcement.
#[inline]
pub fn encode_payload<T: Copy>(value: T) -> [u8; MAX_TASK_PAYLOAD] {
    assert!(
        std::mem::size_of::<T>() <= MAX_TASK_PAYLOAD,
        "task payload of {} bytes exceeds MAX_TASK_PAYLOAD ({MAX_TASK_PAYLOAD})",
        std::mem::size_of::<T>()
    );
    let mut buf = [0u8; MAX_TASK_PAYLOAD];
    unsafe {
        std::ptr::copy_nonoverlapping(
            &value as *const T as *const u8,
            buf.as_mut_ptr(),
            std::mem::size_of::<T>(),
        );
    }
    buf
}

/// Reads a value back out of a task's payload buffer. Mirror of [`encode_payload`].
///
/// # Safety
/// The buffer must currently hold a valid `T`, written by a matching `encode_payload::<T>`.
#[inline]
pub unsafe fn decode_payload<T: Copy>(buf: &[u8; MAX_TASK_PAYLOAD]) -> T {
    debug_assert!(std::mem::size_of::<T>() <= MAX_TASK_PAYLOAD);
    unsafe { std::ptr::read(buf.as_ptr() as *const T) }
}

/// Process-wide monotonically increasing id, used only for worker-local diagnostics (log lines);
/// never part of the stealing protocol itself.
pub(crate) static NEXT_TASK_ID: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub(crate) fn next_task_id() -> usize {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips() {
        let encoded = encode_payload((3u32, 4u32));
        let decoded: (u32, u32) = unsafe { decode_payload(&encoded) };
        assert_eq!(decoded, (3, 4));
    }

    #[test]
    fn thief_cell_claim_is_single_winner() {
        let cell = ThiefCell::new();
        assert!(cell.try_claim());
        assert!(!cell.try_claim());
        assert_eq!(cell.load(), Thief::Claimed);
        cell.mark_completed();
        assert_eq!(cell.load(), Thief::Completed);
    }
}
