use crate::engine::Engine;
use crate::timer_queue::{SequenceId, TaskTimer, TimerQueue};
use atomic::Atomic;
use bitflags::bitflags;
use log::trace;
use parking_lot::Mutex;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// An opaque, process-wide unique handle to a [`Task`].
#[derive(Debug, Copy, Clone, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

bitflags! {
    /// The activity bits of a [`Task`], stored as a single lock-free word.
    ///
    /// `PENDING_SIGNAL` is not part of the public state machine in `spec.md`
    /// §4.2 — it is the implementation detail that makes the CAS loops in
    /// [`Task::wait`]/[`Task::signal`] race-free: a `signal()` that arrives
    /// while the task is still `ACTIVE` (between the predicate check in
    /// `wait` and the transition to `WAITING_FOR_SIGNAL`) sets this bit
    /// instead of being lost, and the next `wait()` consumes it immediately.
    ///
    /// `QUEUED` is likewise an implementation detail, not part of `spec.md`'s
    /// state machine: it tracks whether the task currently has a strong
    /// reference sitting in some engine's queue, so [`Engine::add`] can
    /// short-circuit a redundant re-add. It lives in this same word rather
    /// than a separate `AtomicBool` so that "should I dequeue this task" and
    /// "did its activity just change" are one atomic decision instead of two
    /// — a `signal()` racing the tail of [`Task::step`] must see a consistent
    /// snapshot of both, or its wakeup can be dropped on the floor.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub(crate) struct Activity: u8 {
        const ACTIVE             = 0b0000_0001;
        const IDLE                = 0b0000_0010;
        const WAITING_FOR_SIGNAL  = 0b0000_0100;
        const ABORTED             = 0b0000_1000;
        const FINISHED            = 0b0001_0000;
        const KILLED              = 0b0010_0000;
        const PENDING_SIGNAL      = 0b0100_0000;
        const QUEUED              = 0b1000_0000;
    }
}

#[derive(Default)]
struct EnginePointers {
    target: Option<Weak<Engine>>,
    current: Option<Weak<Engine>>,
    default: Option<Weak<Engine>>,
}

/// How a task was resumed, passed to [`Multiplex::multiplex`].
///
/// `spec.md` §4.1/§4.3 names timed yields (`yield_ms`/`yield_frame`) but never
/// specifies what the resumed step observes; this crate resolves that by
/// letting the engine tell the task why it is running again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunType {
    /// The task was resumed by a `signal()`, or is running for the first time.
    Normal,
    /// The task was resumed because a [`TimerQueue`] entry it owned expired.
    TimedOut,
}

/// The host-supplied step function driving a [`Task`].
///
/// `multiplex` runs to completion on whichever engine invokes it and
/// communicates its decision entirely through calls back into `task`
/// (`yield_to`, `wait`, `finish`, `abort`) — there is no return value carrying
/// scheduling intent.
pub trait Multiplex: Send + Sync {
    /// Advances the task by one cooperative step.
    fn multiplex(&self, task: &Task, run_type: RunType);

    /// Called once, after the task transitions to `finished`.
    fn on_finish(&self, task: &Task) {
        let _ = task;
    }

    /// Called once, after the task transitions to `aborted` and is about to
    /// finish without running another `multiplex` step.
    fn on_abort(&self, task: &Task) {
        let _ = task;
    }
}

/// A cooperatively scheduled unit of work.
///
/// A `Task` is always held behind an `Arc`; it is enqueued on exactly one
/// engine at a time and migrates between engines following the
/// target/current/default/auxiliary priority chain described in
/// [`Task::canonical_engine`].
pub struct Task {
    id: TaskId,
    multiplex: Box<dyn Multiplex>,
    activity: Atomic<Activity>,
    pointers: Mutex<EnginePointers>,
    on_finish: Mutex<Option<Box<dyn FnOnce(&Task) + Send>>>,
    pending_timeout: AtomicBool,
    self_ref: Weak<Task>,
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("activity", &self.activity.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Creates a new, not-yet-running task wrapping `multiplex`.
    #[must_use]
    pub fn new(multiplex: impl Multiplex + 'static) -> Arc<Task> {
        Arc::new_cyclic(|self_ref| Task {
            id: TaskId::next(),
            multiplex: Box::new(multiplex),
            activity: Atomic::new(Activity::IDLE),
            pointers: Mutex::new(EnginePointers::default()),
            on_finish: Mutex::new(None),
            pending_timeout: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// This task's process-wide id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    fn arc(&self) -> Arc<Task> {
        self.self_ref
            .upgrade()
            .expect("Task::arc called while the task itself was being dropped")
    }

    /// Ors `bits` into the activity word and returns the value from before
    /// the update.
    ///
    /// `atomic::Atomic<T>` only implements `fetch_add`/`fetch_or`-style ops
    /// for built-in integer types, not arbitrary `Copy` types like
    /// `Activity`, so this is a one-step `fetch_update` loop instead (it
    /// always succeeds on the first try, since the closure never rejects).
    fn fetch_or_activity(&self, bits: Activity) -> Activity {
        self.activity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current | bits)
            })
            .expect("fetch_update with an always-Some closure never fails")
    }

    /// Marks the task active and enqueues it on its canonical engine.
    ///
    /// `default_engine`, if given, becomes the task's fallback engine for the
    /// rest of its life (used whenever it has no `target_engine` and no
    /// `current_engine`). `on_finish`, if given, is invoked exactly once, with
    /// no lock held, when the task transitions to `finished`.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if the task has already been run.
    pub fn run(
        &self,
        default_engine: Option<&Arc<Engine>>,
        on_finish: Option<Box<dyn FnOnce(&Task) + Send>>,
    ) {
        let before = self.fetch_or_activity(Activity::ACTIVE);
        debug_assert!(
            !before.intersects(Activity::ACTIVE | Activity::FINISHED | Activity::KILLED),
            "Task::run called on a task that was already run"
        );

        if let Some(engine) = default_engine {
            self.pointers.lock().default = Some(Arc::downgrade(engine));
        }
        if let Some(cb) = on_finish {
            *self.on_finish.lock() = Some(cb);
        }

        trace!("{} run", self.id);
        self.reconcile_and_enqueue();
    }

    /// Sets the task's `target_engine` without otherwise changing its state.
    ///
    /// Takes effect the next time the task is reconciled onto an engine
    /// (after the current `multiplex` step returns, or immediately if the
    /// task is idle and this call is followed by [`Task::signal`]).
    pub fn target(&self, engine: &Arc<Engine>) {
        self.pointers.lock().target = Some(Arc::downgrade(engine));
    }

    /// Requests that the task resume on `engine`, or on its current engine
    /// (falling back to the [auxiliary engine](crate::aux_engine)) if `None`.
    ///
    /// Only sets the task's `target_engine`; migration happens when the
    /// engine driving the current `multiplex` call reconciles the task after
    /// the call returns.
    pub fn yield_to(&self, engine: Option<&Arc<Engine>>) {
        let mut pointers = self.pointers.lock();
        match engine {
            Some(e) => pointers.target = Some(Arc::downgrade(e)),
            None => {
                let fallback = pointers
                    .current
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .unwrap_or_else(crate::aux_engine::aux_engine);
                pointers.target = Some(Arc::downgrade(&fallback));
            }
        }
    }

    /// Sugar for `yield_to(None)`: continue on the current engine next tick.
    pub fn yield_frame(&self) {
        self.yield_to(None);
    }

    /// Goes idle and pushes a timer that will [`signal`](Task::signal) this
    /// task again after `ms` milliseconds.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if the task's current engine has no
    /// duration budget set, since a timed yield on an unbudgeted engine can
    /// starve `mainloop`'s other tasks indefinitely once the engine sleeps.
    pub fn yield_ms(&self, queue: &mut TimerQueue<TaskTimer>, ms: u64) -> SequenceId {
        let current = self.pointers.lock().current.as_ref().and_then(Weak::upgrade);
        debug_assert!(
            current.as_ref().is_some_and(|e| e.has_max_duration()),
            "Task::yield_ms called on a task whose current engine has no duration budget"
        );

        self.wait(|| false);
        queue.push(TaskTimer::new(Instant::now() + Duration::from_millis(ms), &self.arc()))
    }

    /// Atomically checks `predicate` and, if it is false, transitions the
    /// task to `waiting_for_signal`.
    ///
    /// If a [`Task::signal`] arrives concurrently with this call, it is never
    /// lost: the transition is a compare-and-set loop over the activity bits,
    /// and a pending signal recorded mid-loop is consumed immediately rather
    /// than leaving the task parked forever.
    pub fn wait(&self, predicate: impl FnOnce() -> bool) {
        if predicate() {
            return;
        }
        loop {
            let current = self.activity.load(Ordering::Acquire);
            if current.contains(Activity::PENDING_SIGNAL) {
                let next = (current - Activity::PENDING_SIGNAL) | Activity::ACTIVE;
                if self
                    .activity
                    .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            let next = (current - Activity::ACTIVE) | Activity::IDLE | Activity::WAITING_FOR_SIGNAL;
            if self
                .activity
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Wakes a waiting task, or records one pending wake if it is currently
    /// active.
    ///
    /// A no-op if the task is already `finished` or `killed`.
    pub fn signal(&self) {
        loop {
            let current = self.activity.load(Ordering::Acquire);
            if current.intersects(Activity::FINISHED | Activity::KILLED) {
                return;
            }
            if current.contains(Activity::WAITING_FOR_SIGNAL) {
                let next =
                    (current - (Activity::WAITING_FOR_SIGNAL | Activity::IDLE)) | Activity::ACTIVE;
                if self
                    .activity
                    .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    trace!("{} signalled while waiting, resuming", self.id);
                    self.reconcile_and_enqueue();
                    return;
                }
                continue;
            }
            // Active, but not yet waiting: record the signal so it is not lost.
            let next = current | Activity::PENDING_SIGNAL;
            if next == current
                || self
                    .activity
                    .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
        }
    }

    /// Wakes a waiting task exactly like [`Task::signal`], but arranges for
    /// its next `multiplex` step to observe [`RunType::TimedOut`].
    ///
    /// Called by whatever pops this task's [`TaskTimer`](crate::TimerQueue)
    /// entry from a [`TimerQueue`](crate::TimerQueue), in place of a plain
    /// `signal()`, so `multiplex_impl` can distinguish "a timed yield
    /// expired" from "something else signalled me".
    pub fn wake_from_timeout(&self) {
        loop {
            let current = self.activity.load(Ordering::Acquire);
            if current.intersects(Activity::FINISHED | Activity::KILLED) {
                return;
            }
            if !current.contains(Activity::WAITING_FOR_SIGNAL) {
                // Already active (or about to become active via a race with
                // signal()); record nothing, the next step still runs Normal.
                return;
            }
            let next =
                (current - (Activity::WAITING_FOR_SIGNAL | Activity::IDLE)) | Activity::ACTIVE;
            if self
                .activity
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.pending_timeout.store(true, Ordering::Release);
                trace!("{} timer expired while waiting, resuming", self.id);
                self.reconcile_and_enqueue();
                return;
            }
        }
    }

    /// Marks the task aborted.
    ///
    /// Idempotent. If the task is waiting, it is woken so that its next
    /// `multiplex` step (actually `on_abort`, since `step` checks `ABORTED`
    /// before calling `multiplex`) can observe the abort and unwind; abort
    /// always eventually wins regardless of a concurrent `signal()`, since
    /// the next `step()` checks `ABORTED` unconditionally before running
    /// anything else.
    pub fn abort(&self) {
        let before = self.fetch_or_activity(Activity::ABORTED);
        if before.intersects(Activity::ABORTED | Activity::FINISHED | Activity::KILLED) {
            return;
        }
        if !before.contains(Activity::WAITING_FOR_SIGNAL) {
            return;
        }
        loop {
            let current = self.activity.load(Ordering::Acquire);
            if !current.contains(Activity::WAITING_FOR_SIGNAL) {
                return;
            }
            let next =
                (current - (Activity::WAITING_FOR_SIGNAL | Activity::IDLE)) | Activity::ACTIVE;
            if self
                .activity
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                trace!("{} aborted while waiting, resuming to unwind", self.id);
                self.reconcile_and_enqueue();
                return;
            }
        }
    }

    /// Marks the task finished. Idempotent.
    ///
    /// Cleanup (the `on_finish` hooks, dequeue bookkeeping) happens in
    /// [`Task::step`] once the current `multiplex`/`on_abort` call returns,
    /// not here.
    pub fn finish(&self) {
        self.fetch_or_activity(Activity::FINISHED);
    }

    /// Marks the task killed, dropping it the next time an engine reaches it.
    ///
    /// Idempotent. A task already sitting in an engine's queue is not spliced
    /// out immediately (there is no O(1) way to do that); it is simply
    /// skipped without running when the engine's dispatch loop reaches it. Use
    /// [`Engine::flush`] for an immediate, whole-queue drop.
    pub fn kill(&self) {
        self.activity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current | Activity::KILLED) - Activity::QUEUED)
            })
            .expect("fetch_update with an always-Some closure never fails");
    }

    /// Resolves the engine this task should run on: the first non-null of
    /// `target_engine`, `current_engine`, `default_engine`, else the
    /// [auxiliary engine](crate::aux_engine).
    #[must_use]
    pub fn canonical_engine(&self) -> Arc<Engine> {
        let pointers = self.pointers.lock();
        pointers
            .target
            .as_ref()
            .and_then(Weak::upgrade)
            .or_else(|| pointers.current.as_ref().and_then(Weak::upgrade))
            .or_else(|| pointers.default.as_ref().and_then(Weak::upgrade))
            .unwrap_or_else(crate::aux_engine::aux_engine)
    }

    fn reconcile_and_enqueue(&self) {
        let canonical = self.canonical_engine();
        self.pointers.lock().current = Some(Arc::downgrade(&canonical));
        canonical.add(self.arc());
    }

    /// `true` if this task is currently queued on some engine (including one
    /// that has not yet dequeued it to run).
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.activity.load(Ordering::Acquire).contains(Activity::QUEUED)
    }

    /// `true` if this task has been marked killed.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.activity.load(Ordering::Relaxed).contains(Activity::KILLED)
    }

    /// Atomically sets `QUEUED`. Returns `true` if it was already set (the
    /// caller should treat this as a no-op add), `false` if this call is the
    /// one that actually claimed the task for a queue.
    pub(crate) fn mark_queued(&self) -> bool {
        self.activity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current.contains(Activity::QUEUED) {
                    None
                } else {
                    Some(current | Activity::QUEUED)
                }
            })
            .is_err()
    }

    /// Attempts to clear `QUEUED`, but only if the activity word is still
    /// exactly `expected` — the snapshot `step` read right before deciding
    /// the task should be dequeued.
    ///
    /// Returns `false` if the word has since changed (typically: a
    /// concurrent `signal()`/`wake_from_timeout()` already resumed the
    /// task), in which case the caller must re-read the activity and decide
    /// again rather than blindly dropping the `QUEUED` bit out from under a
    /// wakeup that is already in flight.
    fn clear_queued(&self, expected: Activity) -> bool {
        self.activity
            .compare_exchange_weak(expected, expected - Activity::QUEUED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Runs one cooperative step of this task on behalf of `running_on`.
    ///
    /// Returns `true` if the caller should requeue the task on the same
    /// engine immediately (the common case of a still-active task whose
    /// canonical engine didn't change), `false` if the task was dropped,
    /// parked, or migrated elsewhere (in which case it has already been
    /// handled: dropped silently, or re-enqueued on its new canonical
    /// engine).
    pub(crate) fn step(self: &Arc<Self>, running_on: &Arc<Engine>) -> bool {
        let before = self.activity.load(Ordering::Acquire);
        if before.contains(Activity::KILLED) {
            trace!("{} killed before running, dropping", self.id);
            return false;
        }

        let run_type = if self.pending_timeout.swap(false, Ordering::AcqRel) {
            RunType::TimedOut
        } else {
            RunType::Normal
        };

        if before.contains(Activity::ABORTED) {
            self.multiplex.on_abort(self);
            self.fetch_or_activity(Activity::FINISHED);
        } else {
            self.multiplex.multiplex(self, run_type);
        }

        // The dequeue/requeue decision below and the `QUEUED` bit must be
        // reconciled together: a `signal()`/`wake_from_timeout()` racing this
        // tail end of `step` may flip the activity word (e.g. out of
        // `WAITING_FOR_SIGNAL`) between the load below and a plain store
        // clearing `QUEUED`. If that happens, `Engine::add`'s own
        // `mark_queued` check would see `QUEUED` still set and skip the
        // re-enqueue, orphaning the task. Looping on a CAS that targets the
        // exact snapshot just read closes that window: whichever side's CAS
        // wins first is the one that gets to decide what happens next, and
        // the loser re-reads and re-evaluates against the new state instead
        // of acting on stale information.
        loop {
            let after = self.activity.load(Ordering::Acquire);

            if after.contains(Activity::KILLED) {
                if self.clear_queued(after) {
                    return false;
                }
                continue;
            }

            if after.contains(Activity::FINISHED) {
                if !self.clear_queued(after) {
                    continue;
                }
                trace!("{} finished", self.id);
                self.multiplex.on_finish(self);
                if let Some(cb) = self.on_finish.lock().take() {
                    cb(self);
                }
                return false;
            }

            if after.contains(Activity::WAITING_FOR_SIGNAL) {
                if !self.clear_queued(after) {
                    continue;
                }
                return false;
            }

            // Still active: reconcile onto its canonical engine.
            let canonical = self.canonical_engine();
            self.pointers.lock().current = Some(Arc::downgrade(&canonical));
            if Arc::ptr_eq(&canonical, running_on) {
                return true;
            }
            if !self.clear_queued(after) {
                continue;
            }
            trace!("{} migrating to engine '{}'", self.id, canonical.name());
            canonical.add(self.clone());
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountToFive {
        count: AtomicUsize,
    }

    impl Multiplex for CountToFive {
        fn multiplex(&self, task: &Task, _run_type: RunType) {
            let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
            if n >= 5 {
                task.finish();
            } else {
                task.yield_frame();
            }
        }
    }

    #[test]
    fn fresh_task_is_idle_and_unqueued() {
        let task = Task::new(CountToFive {
            count: AtomicUsize::new(0),
        });
        assert!(!task.is_queued());
        assert_eq!(task.activity.load(Ordering::Relaxed), Activity::IDLE);
    }

    #[test]
    fn signal_on_active_task_records_pending_bit() {
        let task = Task::new(CountToFive {
            count: AtomicUsize::new(0),
        });
        task.activity.store(Activity::ACTIVE, Ordering::Relaxed);
        task.signal();
        assert!(task
            .activity
            .load(Ordering::Relaxed)
            .contains(Activity::PENDING_SIGNAL));
    }

    #[test]
    fn wait_consumes_a_pending_signal_immediately() {
        let task = Task::new(CountToFive {
            count: AtomicUsize::new(0),
        });
        task.activity
            .store(Activity::ACTIVE | Activity::PENDING_SIGNAL, Ordering::Relaxed);
        task.wait(|| false);
        let after = task.activity.load(Ordering::Relaxed);
        assert!(after.contains(Activity::ACTIVE));
        assert!(!after.contains(Activity::WAITING_FOR_SIGNAL));
    }

    #[test]
    fn abort_is_idempotent() {
        let task = Task::new(CountToFive {
            count: AtomicUsize::new(0),
        });
        task.abort();
        task.abort();
        assert!(task.activity.load(Ordering::Relaxed).contains(Activity::ABORTED));
    }

    #[test]
    fn signal_after_kill_is_a_no_op() {
        let task = Task::new(CountToFive {
            count: AtomicUsize::new(0),
        });
        task.activity
            .store(Activity::WAITING_FOR_SIGNAL | Activity::IDLE | Activity::KILLED, Ordering::Relaxed);
        task.signal();
        assert!(task.activity.load(Ordering::Relaxed).contains(Activity::KILLED));
        assert!(task
            .activity
            .load(Ordering::Relaxed)
            .contains(Activity::WAITING_FOR_SIGNAL));
    }
}
