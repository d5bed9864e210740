//! Monotonic, millisecond-granularity timer wheel.
//!
//! Backed by a binary heap keyed on due time rather than an actual
//! hashed wheel: the contract only promises `Tick` is `O(k + log n)`
//! for `k` fired entries out of `n` scheduled, which a heap already
//! gives us, and it keeps cancellation and re-arm straightforward
//! (tombstone the old heap entry, push a new one) instead of needing
//! slot-rebalancing logic a real wheel would add for no behavioral gain
//! at the scale a single service's timers run at.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::ids::TimerId;
use crate::time::MonotonicTimePoint;

/// What a fired callback should do next.
pub enum TimerOutcome {
    /// One-shot timers and periodic timers that are done return this.
    Done,
    /// Periodic timers that should keep firing return this.
    Reschedule,
}

pub type TimerCallback = Box<dyn FnMut(TimerId) -> TimerOutcome + Send>;

struct Entry {
    due: MonotonicTimePoint,
    period_ms: Option<u64>,
    seq: u64,
    id: TimerId,
    callback: TimerCallback,
}

struct HeapKey {
    due: MonotonicTimePoint,
    seq: u64,
    id: TimerId,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for HeapKey {}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapKey {
    // Reversed so `BinaryHeap` (a max-heap) pops the earliest due time,
    // breaking ties by insertion order (lower `seq` first).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Monotonic timer wheel. Not `Send`/`Sync` by design — a service's timer
/// wheel is owned and driven exclusively by its loop thread.
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<HeapKey>,
    entries: HashMap<TimerId, Entry>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to first fire at `now + delay_ms`. If
    /// `period_ms` is `Some`, the timer keeps firing on that period until
    /// cancelled or the callback returns [`TimerOutcome::Done`].
    pub fn schedule(
        &mut self,
        now: MonotonicTimePoint,
        delay_ms: u64,
        period_ms: Option<u64>,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId::next();
        let due = now
            .checked_add(std::time::Duration::from_millis(delay_ms))
            .unwrap_or(now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapKey { due, seq, id });
        self.entries.insert(
            id,
            Entry {
                due,
                period_ms,
                seq,
                id,
                callback,
            },
        );
        id
    }

    /// Cancels a timer. Idempotent: cancelling an unknown or
    /// already-fired-and-removed id is not an error.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_due(&self) -> Option<MonotonicTimePoint> {
        self.heap.peek().map(|k| k.due)
    }

    /// Fires every timer due at or before `now`, in non-decreasing
    /// due-time order, ties broken by insertion order. Returns the
    /// number of callbacks invoked.
    ///
    /// A timer cancelled by its own callback (or any other callback run
    /// during this tick) does not fire again: cancellation removes the
    /// entry from `entries`, and stale heap keys left behind by
    /// cancellation or by a previous re-arm are skipped when popped.
    pub fn tick(&mut self, now: MonotonicTimePoint) -> usize {
        let mut fired = 0;
        while let Some(top) = self.heap.peek() {
            if top.due > now {
                break;
            }
            let key = self.heap.pop().expect("peeked Some");

            let Some(mut entry) = self.entries.remove(&key.id) else {
                continue; // cancelled, or a stale key from a prior re-arm
            };
            if entry.due != key.due || entry.seq != key.seq {
                // This heap key belonged to a since-superseded schedule
                // of the same id; the live entry was already re-pushed.
                self.entries.insert(key.id, entry);
                continue;
            }

            fired += 1;
            let outcome = (entry.callback)(entry.id);
            match (outcome, entry.period_ms) {
                (TimerOutcome::Reschedule, Some(period_ms)) => {
                    let next_due = now
                        .checked_add(std::time::Duration::from_millis(period_ms))
                        .unwrap_or(now);
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    entry.due = next_due;
                    entry.seq = seq;
                    self.heap.push(HeapKey {
                        due: next_due,
                        seq,
                        id: entry.id,
                    });
                    self.entries.insert(entry.id, entry);
                }
                _ => {
                    // Done, or a one-shot timer: drop the entry.
                }
            }
        }
        fired
    }
}
