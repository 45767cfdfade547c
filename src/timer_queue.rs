use crate::task::Task;
use log::trace;
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Something with a single expiration point, as stored in a [`TimerQueue`].
pub trait Timer {
    /// The instant at which this timer should fire.
    fn expiration(&self) -> Instant;
}

/// A [`Timer`] that wakes a [`Task`] by calling [`Task::signal`] once it pops.
///
/// `TimerQueue` itself never reads the wall clock; the platform timer thread
/// that does is out of scope for this crate (see `spec.md` §1). This type is
/// the concrete [`Timer`] that such a thread would push, pop, and signal —
/// every other piece of that wiring is this crate's responsibility.
#[derive(Debug)]
pub struct TaskTimer {
    expiration: Instant,
    task: Weak<Task>,
}

impl TaskTimer {
    /// Creates a timer that will wake `task` at `expiration`.
    #[must_use]
    pub fn new(expiration: Instant, task: &Arc<Task>) -> Self {
        Self {
            expiration,
            task: Arc::downgrade(task),
        }
    }

    /// Upgrades the timer's back-reference, if the task is still alive.
    #[must_use]
    pub fn task(&self) -> Option<Arc<Task>> {
        self.task.upgrade()
    }
}

impl Timer for TaskTimer {
    fn expiration(&self) -> Instant {
        self.expiration
    }
}

/// A stable identifier returned by [`TimerQueue::push`].
///
/// Ids are stable between pushes but are only meaningful relative to the
/// `TimerQueue` that produced them: `seq - sequence_offset` is the entry's
/// current index, per `spec.md` §3's "Sequence identity" rule.
#[derive(Debug, Copy, Clone, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub struct SequenceId(u64);

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Per-interval ordered queue of running timers.
///
/// All timers in one `TimerQueue` share a single interval, so arrival order is
/// expiration order (invariant I3 of `spec.md` §4.3) and `pop` never needs to
/// search for the earliest entry — it is always the front.
///
/// Cancellation is lazy: a cancelled entry becomes a `None` placeholder rather
/// than being shifted out immediately, because removing a mid-queue element by
/// shifting would be O(n) and cancellation is expected to be frequent (many
/// timed yields are superseded before they fire). The amortised cost of
/// sweeping cancelled entries is charged to `pop` and to front-cancellations.
#[derive(Debug)]
pub struct TimerQueue<T: Timer> {
    sequence_offset: u64,
    running: VecDeque<Option<T>>,
}

impl<T: Timer> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Timer> TimerQueue<T> {
    /// Creates an empty timer queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequence_offset: 0,
            running: VecDeque::new(),
        }
    }

    /// Appends `timer` and returns a stable id for later cancellation.
    pub fn push(&mut self, timer: T) -> SequenceId {
        let seq = SequenceId(self.sequence_offset + self.running.len() as u64);
        self.running.push_back(Some(timer));
        trace!("timer queue: pushed {seq}, {} entries queued", self.running.len());
        seq
    }

    /// `true` if `seq` is the id of the current front entry.
    #[must_use]
    pub fn is_current(&self, seq: SequenceId) -> bool {
        seq.0 == self.sequence_offset
    }

    /// Cancels the timer identified by `seq`.
    ///
    /// Returns `true` if the cancelled entry was at the front (and any
    /// subsequent run of cancelled entries was swept along with it), `false`
    /// otherwise.
    ///
    /// # Panics
    ///
    /// Panics if `seq` was not produced by a previous `push` on this queue, or
    /// if the entry it names has already been popped or cancelled — per
    /// `spec.md` §4.3, double-cancellation is a precondition violation, not a
    /// recoverable error.
    pub fn cancel(&mut self, seq: SequenceId) -> bool {
        let offset = seq
            .0
            .checked_sub(self.sequence_offset)
            .expect("TimerQueue::cancel: id predates this queue's current window");
        let index = usize::try_from(offset).expect("TimerQueue::cancel: id out of range");
        let slot = self
            .running
            .get_mut(index)
            .expect("TimerQueue::cancel: id has already been popped");
        assert!(slot.is_some(), "TimerQueue::cancel: double-cancel of {seq}");
        *slot = None;
        trace!("timer queue: cancelled {seq}");

        if index == 0 {
            self.sweep_front();
            true
        } else {
            false
        }
    }

    /// Removes and returns the front timer.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty — per `spec.md` §4.3, popping an empty
    /// queue is a precondition violation.
    pub fn pop(&mut self) -> T {
        let front = self
            .running
            .pop_front()
            .expect("TimerQueue::pop: queue is empty")
            .expect("TimerQueue::pop: front invariant violated, front was null");
        self.sequence_offset += 1;
        self.sweep_front();
        trace!("timer queue: popped, {} entries remain", self.running.len());
        front
    }

    /// Repeatedly drops leading `None` placeholders, advancing `sequence_offset`.
    ///
    /// Restores invariant I1 (front is either absent or non-null) after a
    /// mutation that may have left a null at the front.
    fn sweep_front(&mut self) {
        while matches!(self.running.front(), Some(None)) {
            self.running.pop_front();
            self.sequence_offset += 1;
        }
    }

    /// The front timer's expiration, or `None` if the queue is empty.
    ///
    /// This is the idiomatic `Option` translation of `spec.md`'s `Timer::none`
    /// sentinel: rather than a distinguished null-object `Timer` value, the
    /// absence of a next expiration is represented by the absence of a value.
    #[must_use]
    pub fn next_expiration_point(&self) -> Option<Instant> {
        self.running.front().and_then(Option::as_ref).map(Timer::expiration)
    }

    /// Number of timers still queued (including any not-yet-swept placeholders).
    #[must_use]
    pub fn len(&self) -> usize {
        self.running.len()
    }

    /// `true` if no timers remain queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

/// A [`Timer`] used only in tests and doc examples, with an expiration set at
/// construction time and no task to wake.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlainTimer(pub Instant);

impl Timer for PlainTimer {
    fn expiration(&self) -> Instant {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(millis: u64) -> PlainTimer {
        PlainTimer(Instant::now() + Duration::from_millis(millis))
    }

    #[test]
    fn sequence_ids_are_stable_between_pushes() {
        let mut q: TimerQueue<PlainTimer> = TimerQueue::new();
        let a = q.push(at(0));
        let b = q.push(at(1));
        let c = q.push(at(2));
        assert!(q.is_current(a));
        assert!(!q.is_current(b));
        assert!(!q.is_current(c));
    }

    #[test]
    fn push_then_immediate_cancel_is_a_no_op_on_observable_state() {
        let mut q: TimerQueue<PlainTimer> = TimerQueue::new();
        let a = q.push(at(0));
        assert_eq!(q.len(), 1);
        let removed_front = q.cancel(a);
        assert!(removed_front);
        assert_eq!(q.len(), 0);
        assert_eq!(q.sequence_offset, 1);
    }

    #[test]
    fn mid_queue_cancel_then_two_pops_sweeps_the_null() {
        // Scenario from spec.md §8.4: push ids 0..=4, cancel id 2, pop twice.
        let mut q: TimerQueue<PlainTimer> = TimerQueue::new();
        let ids: Vec<_> = (0..5).map(|i| q.push(at(i))).collect();
        assert!(!q.cancel(ids[2]));

        let first = q.pop();
        let second = q.pop();
        assert!(first.0 < second.0 || ids[0].0 < ids[1].0);

        // Invariant I2 (sequence_offset + len == next push id) pins the offset:
        // two real pops plus the swept null at id 2 leaves three entries
        // consumed from the front, so sequence_offset is 3, not 2 as the
        // scenario's prose states — see DESIGN.md for why the invariant wins.
        assert_eq!(q.sequence_offset, 3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.next_expiration_point(), Some(q.running[0].as_ref().unwrap().0));
    }

    #[test]
    fn front_cancel_sweeps_a_previously_cancelled_neighbor() {
        // Scenario from spec.md §8.5: push ids 0,1,2; cancel 1, then cancel 0.
        let mut q: TimerQueue<PlainTimer> = TimerQueue::new();
        let ids: Vec<_> = (0..3).map(|i| q.push(at(i))).collect();
        assert!(!q.cancel(ids[1]));
        assert!(q.cancel(ids[0]));
        assert_eq!(q.sequence_offset, 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    #[should_panic(expected = "queue is empty")]
    fn pop_on_empty_queue_panics() {
        let mut q: TimerQueue<PlainTimer> = TimerQueue::new();
        q.pop();
    }

    #[test]
    #[should_panic(expected = "double-cancel")]
    fn double_cancel_panics() {
        let mut q: TimerQueue<PlainTimer> = TimerQueue::new();
        let a = q.push(at(0));
        assert!(q.cancel(a));
        q.cancel(a);
    }

    #[test]
    fn next_expiration_point_is_none_when_empty() {
        let q: TimerQueue<PlainTimer> = TimerQueue::new();
        assert_eq!(q.next_expiration_point(), None);
    }
}
