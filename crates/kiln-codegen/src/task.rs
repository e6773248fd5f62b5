//! Generation tasks with prerequisite edges, run on a rayon thread pool.
//!
//! A task is spawned only once all of its prerequisites have completed, so
//! worker threads never block on other tasks.

use std::sync::{
    Arc, Condvar, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use crate::error::CodegenError;

type Continuation = Box<dyn FnOnce() + Send>;

struct TaskState<T> {
    result: Option<T>,
    continuations: Vec<Continuation>,
}

struct TaskInner<T> {
    name: &'static str,
    state: Mutex<TaskState<T>>,
    done: Condvar,
}

/// Handle to the eventual result of a generation step.
pub struct Task<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<T> Task<T> {
    fn pending(name: &'static str) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name,
                state: Mutex::new(TaskState {
                    result: None,
                    continuations: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// A task that has already completed with `value`.
    pub fn ready(value: T) -> Self {
        let task = Self::pending("ready");
        task.complete(value);
        task
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn is_completed(&self) -> bool {
        self.lock().result.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskState<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, value: T) {
        let continuations = {
            let mut state = self.lock();
            debug_assert!(state.result.is_none(), "task {} completed twice", self.inner.name);
            state.result = Some(value);
            std::mem::take(&mut state.continuations)
        };
        self.inner.done.notify_all();
        continuations.into_iter().for_each(|continuation| continuation());
    }

    /// Runs `continuation` once the task completes, right away if it already has.
    fn on_complete(&self, continuation: Continuation) {
        let mut state = self.lock();
        if state.result.is_some() {
            drop(state);
            continuation();
        } else {
            state.continuations.push(continuation);
        }
    }
}

impl<T: Clone> Task<T> {
    /// Blocks until the task completes and returns its result.
    pub fn wait(&self) -> T {
        let mut state = self.lock();
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            state = self.inner.done.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Spins on `pump` until the task completes, then returns its result.
    pub fn wait_with(&self, pump: &mut dyn FnMut()) -> T {
        while !self.is_completed() {
            pump();
            std::thread::yield_now();
        }
        self.wait()
    }
}

/// A task another task can wait for, whatever its result type.
pub trait Prerequisite {
    fn when_complete(&self, continuation: Box<dyn FnOnce() + Send>);
}

impl<T> Prerequisite for Task<T> {
    fn when_complete(&self, continuation: Box<dyn FnOnce() + Send>) {
        self.on_complete(continuation);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    pool: Arc<rayon::ThreadPool>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl Scheduler {
    /// Builds a scheduler with `num_threads` workers, or rayon's default when 0.
    pub fn new(num_threads: usize) -> Result<Self, CodegenError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("kiln-codegen-{index}"))
            .build()?;
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Runs `f` on the pool once every prerequisite has completed.
    pub fn launch<T, F>(&self, name: &'static str, prerequisites: &[&dyn Prerequisite], f: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let task = Task::pending(name);
        // One extra count so the job cannot start before every edge is registered.
        let remaining = Arc::new(AtomicUsize::new(prerequisites.len() + 1));
        let job = Arc::new(Mutex::new(Some(f)));

        let start: Arc<dyn Fn() + Send + Sync> = {
            let task = task.clone();
            let pool = Arc::clone(&self.pool);
            Arc::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                let Some(f) = job.lock().unwrap_or_else(PoisonError::into_inner).take() else {
                    return;
                };
                let task = task.clone();
                pool.spawn(move || {
                    tracing::trace!(task = task.name(), "Running generation task");
                    task.complete(f());
                });
            })
        };

        for prerequisite in prerequisites {
            let start = Arc::clone(&start);
            prerequisite.when_complete(Box::new(move || start()));
        }
        start();

        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_ready_task() {
        let task = Task::ready(7);
        assert!(task.is_completed());
        assert_eq!(task.wait(), 7);
    }

    #[test]
    fn test_launch_without_prerequisites() {
        let scheduler = Scheduler::new(2).unwrap();
        let task = scheduler.launch("answer", &[], || 42);
        assert_eq!(task.wait(), 42);
    }

    #[test]
    fn test_prerequisites_complete_first() {
        let scheduler = Scheduler::new(2).unwrap();
        let first_done = Arc::new(AtomicBool::new(false));

        let first = {
            let first_done = Arc::clone(&first_done);
            scheduler.launch("first", &[], move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                first_done.store(true, Ordering::SeqCst);
                1
            })
        };
        let second = {
            let first_done = Arc::clone(&first_done);
            let first = first.clone();
            scheduler.launch("second", &[&first.clone()], move || {
                assert!(first_done.load(Ordering::SeqCst));
                first.wait() + 1
            })
        };

        assert_eq!(second.wait(), 2);
    }

    #[test]
    fn test_fan_in() {
        let scheduler = Scheduler::new(4).unwrap();
        let parts = (0..8).map(|i| scheduler.launch("part", &[], move || i)).collect::<Vec<_>>();
        let prerequisites = parts.iter().map(|part| part as &dyn Prerequisite).collect::<Vec<_>>();
        let sum = {
            let parts = parts.clone();
            scheduler.launch("sum", &prerequisites, move || parts.iter().map(Task::wait).sum::<i32>())
        };
        assert_eq!(sum.wait(), 28);
    }

    #[test]
    fn test_wait_with_pumps() {
        let scheduler = Scheduler::new(1).unwrap();
        let task = scheduler.launch("slow", &[], || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            "done"
        });
        let mut pumped = 0;
        assert_eq!(task.wait_with(&mut || pumped += 1), "done");
        assert!(task.is_completed());
    }
}
