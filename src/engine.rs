use crate::error::{Error, ErrorKind};
use crate::task::{RunType, Task};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct EngineState {
    queue: VecDeque<Arc<Task>>,
    waiting: bool,
}

/// A FIFO queue of tasks plus a bounded-time dispatch loop, bound to one host
/// thread.
///
/// An `Engine` does not spawn or own any thread itself: the host calls
/// [`Engine::mainloop`] repeatedly from whichever OS thread it has dedicated
/// to this engine. Nothing here steals work from, or shares a queue with, any
/// other `Engine`.
pub struct Engine {
    name: String,
    max_duration: AtomicU64,
    running: AtomicBool,
    state: Mutex<EngineState>,
    condvar: Condvar,
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("max_duration_ms", &self.max_duration.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with no duration budget (`mainloop` drains its queue
    /// fully, or sleeps, before returning).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Engine> {
        Arc::new(Engine {
            name: name.into(),
            max_duration: AtomicU64::new(0),
            running: AtomicBool::new(false),
            state: Mutex::new(EngineState {
                queue: VecDeque::new(),
                waiting: false,
            }),
            condvar: Condvar::new(),
        })
    }

    /// Starts building an engine with optional configuration.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> EngineBuilder {
        EngineBuilder {
            name: name.into(),
            max_duration: None,
        }
    }

    /// This engine's name, as given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` if this engine has a nonzero duration budget set.
    #[must_use]
    pub fn has_max_duration(&self) -> bool {
        self.max_duration.load(Ordering::Relaxed) != 0
    }

    /// Sets (or clears, with `Duration::ZERO`) this engine's per-`mainloop`-
    /// call duration budget.
    pub fn set_max_duration(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.max_duration.store(ms, Ordering::Relaxed);
    }

    fn max_duration(&self) -> Option<Duration> {
        match self.max_duration.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Enqueues `task` on this engine, waking it if it is sleeping.
    ///
    /// A no-op if the task is already queued somewhere: re-adding an
    /// already-queued task (e.g. a redundant `signal()` racing a pending
    /// `mainloop` dequeue) must not duplicate it in the queue, per `spec.md`
    /// §4.1's add-is-idempotent-while-queued rule.
    pub fn add(&self, task: Arc<Task>) {
        if task.mark_queued() {
            trace!("engine '{}': add skipped, task already queued", self.name);
            return;
        }
        let mut state = self.state.lock();
        state.queue.push_back(task);
        trace!("engine '{}': enqueued, {} tasks queued", self.name, state.queue.len());
        if state.waiting {
            state.waiting = false;
            self.condvar.notify_one();
        }
    }

    /// Wakes this engine if it is currently sleeping in `mainloop`. A no-op
    /// otherwise.
    pub fn wake_up(&self) {
        let mut state = self.state.lock();
        if state.waiting {
            state.waiting = false;
            self.condvar.notify_one();
        }
    }

    /// Drops every task currently queued, without running them, marking each
    /// killed.
    ///
    /// Unlike [`Task::kill`](crate::Task::kill), this is immediate: the whole
    /// queue is drained under the engine's lock.
    pub fn flush(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.queue.drain(..).collect()
        };
        debug!("engine '{}': flushed {} queued tasks", self.name, drained.len());
        for task in drained {
            task.kill();
        }
    }

    /// Runs one dispatch pass: drains the tasks queued at entry (plus any
    /// enqueued while running, subject to the duration budget), running each
    /// via one [`Task`] step, and sleeps until woken if the queue is empty
    /// when the pass completes.
    ///
    /// Always runs at least one task if the queue is non-empty at entry,
    /// regardless of how small the duration budget is. Returns (does not
    /// sleep) immediately if any task remains queued after the pass — the
    /// host is expected to call `mainloop` again promptly in that case.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if called concurrently with itself on the
    /// same engine — `spec.md` §4.1 requires engines be driven by one thread
    /// each; this is a programmer error, not a recoverable race.
    pub fn mainloop(self: &Arc<Self>) {
        let _guard = ReentrancyGuard::enter(self);

        let budget = self.max_duration();
        let started = Instant::now();

        let working = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.queue)
        };
        if working.is_empty() {
            self.sleep_until_woken();
            return;
        }

        debug!(
            "engine '{}': tick start, {} tasks, budget {:?}",
            self.name,
            working.len(),
            budget
        );

        let mut requeue = VecDeque::with_capacity(working.len());
        let mut tasks = working.into_iter();
        let mut ran = 0usize;
        for task in &mut tasks {
            let again = task.step(self);
            ran += 1;
            if again {
                requeue.push_back(task);
            }
            if let Some(budget) = budget {
                if started.elapsed() >= budget {
                    debug!(
                        "engine '{}': budget exhausted after {} tasks, deferring the rest",
                        self.name, ran
                    );
                    break;
                }
            }
        }
        // Anything left in `tasks` wasn't reached this pass; preserve FIFO
        // order by pushing it after the tasks we did run.
        requeue.extend(tasks);

        let mut state = self.state.lock();
        for task in state.queue.drain(..) {
            requeue.push_back(task);
        }
        state.queue = requeue;

        if state.queue.is_empty() {
            drop(state);
            self.sleep_until_woken();
        } else {
            trace!(
                "engine '{}': tick end, {} tasks still queued",
                self.name,
                state.queue.len()
            );
        }
    }

    fn sleep_until_woken(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if !state.queue.is_empty() {
            return;
        }
        state.waiting = true;
        trace!("engine '{}': sleeping", self.name);
        // Tolerates spurious wakeups: a stray notification just costs one
        // extra, harmless pass through an empty (or re-filled) queue.
        self.condvar.wait(&mut state);
        state.waiting = false;
        trace!("engine '{}': woke up", self.name);
    }
}

struct ReentrancyGuard<'a> {
    engine: &'a Engine,
}

impl<'a> ReentrancyGuard<'a> {
    fn enter(engine: &'a Arc<Engine>) -> Self {
        let already_running = engine.running.swap(true, Ordering::AcqRel);
        debug_assert!(
            !already_running,
            "Engine::mainloop called concurrently with itself on engine '{}'",
            engine.name
        );
        if already_running {
            warn!("engine '{}': mainloop re-entered concurrently", engine.name);
        }
        Self { engine }
    }
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        self.engine.running.store(false, Ordering::Release);
    }
}

/// Fluent constructor for an [`Engine`], validating its configuration before
/// producing one.
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    name: String,
    max_duration: Option<Duration>,
}

impl EngineBuilder {
    /// Sets the engine's duration budget.
    #[must_use]
    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    /// Validates the configuration and produces the engine.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] if the engine's name is empty.
    pub fn build(self) -> Result<Arc<Engine>, Error> {
        if self.name.trim().is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidConfig,
                "engine name must not be empty",
            ));
        }
        let engine = Engine::new(self.name);
        if let Some(duration) = self.max_duration {
            engine.set_max_duration(duration);
        }
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Multiplex, Task};
    use std::sync::atomic::AtomicUsize;

    struct Finishes;
    impl Multiplex for Finishes {
        fn multiplex(&self, task: &Task, _run_type: RunType) {
            task.finish();
        }
    }

    #[test]
    fn builder_rejects_empty_name() {
        let result = Engine::builder("   ").build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_applies_max_duration() {
        let engine = Engine::builder("test").max_duration(Duration::from_millis(5)).build().unwrap();
        assert!(engine.has_max_duration());
    }

    #[test]
    fn fresh_engine_has_no_duration_budget() {
        let engine = Engine::new("test");
        assert!(!engine.has_max_duration());
    }

    #[test]
    fn wake_up_without_sleeping_is_a_no_op() {
        let engine = Engine::new("test");
        engine.wake_up();
    }

    #[test]
    fn single_task_runs_to_completion_in_one_mainloop_call() {
        let engine = Engine::new("test");
        let task = Task::new(Finishes);
        task.run(Some(&engine), None);

        // `mainloop` sleeps until woken once its queue drains to empty, which
        // it will here as soon as the task finishes; drive it from a
        // dedicated thread and release that sleep with `wake_up` rather than
        // blocking the test thread on the same call.
        let handle = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.mainloop())
        };
        let start = std::time::Instant::now();
        while task.is_queued() {
            assert!(start.elapsed() < Duration::from_secs(5), "task never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
        engine.wake_up();
        handle.join().unwrap();

        assert!(!task.is_queued());
    }

    #[test]
    fn flush_kills_every_queued_task_without_running_it() {
        let engine = Engine::new("test");
        let ran = Arc::new(AtomicUsize::new(0));
        struct NeverRuns(Arc<AtomicUsize>);
        impl Multiplex for NeverRuns {
            fn multiplex(&self, task: &Task, _run_type: RunType) {
                self.0.fetch_add(1, Ordering::Relaxed);
                task.finish();
            }
        }
        let task = Task::new(NeverRuns(ran.clone()));
        task.run(Some(&engine), None);
        engine.flush();
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        assert!(task.is_killed());
    }
}
