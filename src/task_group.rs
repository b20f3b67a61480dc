use crate::{DoneGuard, Error, Result, RwLock, WaitCounter};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// A panic caught while running a task of a `TaskGroup`.
#[derive(Debug, Clone)]
pub struct TaskPanic {
    /// Name of the thread the task ran on.
    pub task: String,
    /// The panic payload, when it was a string.
    pub message: String,
    /// `file:line:column` of the `panic!`, if known.
    pub location: Option<String>,
    /// Backtrace of the panicking thread, taken at the point of the panic.
    pub backtrace: String,
}

impl std::fmt::Display for TaskPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panic in {}", self.task)?;
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        writeln!(f, ": {}", self.message)?;
        f.write_str(&self.backtrace)
    }
}

/// Where a panic happened, recorded by the panic hook before unwinding starts.
struct PanicSite {
    location: Option<String>,
    backtrace: String,
}

thread_local! {
    /// Set on threads started by a `TaskGroup`.
    static IN_TASK: Cell<bool> = const { Cell::new(false) };
    /// The last panic seen on this thread, taken by the task runner.
    static PANIC_SITE: Cell<Option<PanicSite>> = const { Cell::new(None) };
}

/// Installs, once per process, a panic hook that records the panic site on task
/// threads and then defers to the hook that was installed before it.
fn install_panic_hook() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    // `set_hook` must not be called while this thread unwinds; a later spawn retries.
    if std::thread::panicking() {
        return;
    }
    INSTALLED.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if IN_TASK.try_with(Cell::get).unwrap_or(false) {
                let site = PanicSite {
                    location: info.location().map(|l| l.to_string()),
                    backtrace: Backtrace::force_capture().to_string(),
                };
                let _ = PANIC_SITE.try_with(|slot| slot.set(Some(site)));
            }
            previous(info);
        }));
    });
}

type Handler = dyn Fn(TaskPanic) + Send + Sync;

struct Inner {
    pending: WaitCounter,
    next_id: AtomicU64,
    handler: Option<Box<Handler>>,
    /// Panics caught without a handler, drained by `join`.
    unhandled: RwLock<Vec<TaskPanic>>,
}

/// Runs closures on their own threads and waits for all of them to finish.
///
/// A task that panics never takes the process down: the panic is caught, turned into a
/// [`TaskPanic`], and either handed to the handler registered with [`TaskGroup::on_panic`]
/// or returned by [`TaskGroup::join`].
///
/// Clones share the same set of tasks.
///
/// # Examples
/// ```
/// use shardmap::{ShardedMap, TaskGroup};
/// use std::sync::Arc;
///
/// let map = Arc::new(ShardedMap::new(4));
/// let group = TaskGroup::new();
/// for i in 0..8u32 {
///     let map = map.clone();
///     group.spawn(move || {
///         map.put(&format!("key{i}"), i).unwrap();
///     })?;
/// }
/// group.join()?;
/// assert_eq!(map.len(), 8);
/// # Ok::<(), shardmap::Error>(())
/// ```
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<Inner>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    /// Creates an empty group without a panic handler.
    pub fn new() -> Self {
        Self::with_handler(None)
    }

    /// Creates an empty group that passes every caught panic to `handler`.
    ///
    /// The handler runs on the thread of the task that panicked.
    ///
    /// # Examples
    /// ```
    /// use shardmap::TaskGroup;
    /// use std::sync::{Arc, Mutex};
    ///
    /// let reports = Arc::new(Mutex::new(vec![]));
    /// let group = {
    ///     let reports = reports.clone();
    ///     TaskGroup::on_panic(move |panic| reports.lock().unwrap().push(panic.message))
    /// };
    /// group.spawn(|| panic!("task failed"))?;
    /// group.join()?;
    /// assert_eq!(*reports.lock().unwrap(), ["task failed"]);
    /// # Ok::<(), shardmap::Error>(())
    /// ```
    pub fn on_panic<F>(handler: F) -> Self
    where
        F: Fn(TaskPanic) + Send + Sync + 'static,
    {
        Self::with_handler(Some(Box::new(handler)))
    }

    fn with_handler(handler: Option<Box<Handler>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: WaitCounter::new(),
                next_id: AtomicU64::new(0),
                handler,
                unhandled: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Runs `task` on a new thread belonging to this group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the thread could not be created; the task is not run.
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("task-{id}");
        let inner = self.inner.clone();

        install_panic_hook();
        self.inner.pending.add();
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _done = DoneGuard(&inner.pending);
                IN_TASK.with(|in_task| in_task.set(true));
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    // Another hook may have replaced ours; fall back to the catch point.
                    let site = PANIC_SITE.with(Cell::take).unwrap_or_else(|| PanicSite {
                        location: None,
                        backtrace: Backtrace::force_capture().to_string(),
                    });
                    inner.report(TaskPanic {
                        task: name,
                        message: panic_message(payload.as_ref()),
                        location: site.location,
                        backtrace: site.backtrace,
                    });
                }
            });

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "failed to spawn task thread");
                self.inner.pending.done();
                Err(Error::Spawn(e))
            }
        }
    }

    /// Returns the number of tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.inner.pending.pending() as usize
    }

    /// Blocks until every spawned task has finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskPanicked`] with the panics no handler consumed since the
    /// previous `join`.
    pub fn join(&self) -> Result<()> {
        self.inner.pending.wait();
        let panics = std::mem::take(&mut *self.inner.unhandled.write());
        if panics.is_empty() {
            Ok(())
        } else {
            Err(Error::TaskPanicked(panics))
        }
    }
}

impl Inner {
    fn report(&self, panic: TaskPanic) {
        tracing::error!(
            task = %panic.task,
            location = panic.location.as_deref().unwrap_or("unknown"),
            message = %panic.message,
            "supervised task panicked"
        );
        match &self.handler {
            Some(handler) => {
                // A panicking handler must not skip the completion of the task.
                if catch_unwind(AssertUnwindSafe(|| handler(panic))).is_err() {
                    tracing::error!("panic handler panicked");
                }
            }
            None => self.unhandled.write().push(panic),
        }
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("pending", &self.pending())
            .field("has_handler", &self.inner.handler.is_some())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShardedMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_task_group_join() {
        let group = TaskGroup::new();
        let total = Arc::new(AtomicUsize::default());
        const N: usize = 32;

        for _ in 0..N {
            let total = total.clone();
            group
                .spawn(move || {
                    std::thread::yield_now();
                    total.fetch_add(1, Ordering::AcqRel);
                })
                .unwrap();
        }
        group.join().unwrap();

        assert_eq!(total.load(Ordering::Acquire), N);
        assert_eq!(group.pending(), 0);
        // Joining an idle group returns immediately.
        group.join().unwrap();
    }

    #[test]
    fn test_task_group_handler() {
        let reports = Arc::new(Mutex::new(vec![]));
        let group = {
            let reports = reports.clone();
            TaskGroup::on_panic(move |panic| reports.lock().unwrap().push(panic))
        };

        group.spawn(|| panic!("static message")).unwrap();
        group.spawn(|| panic!("formatted {}", 42)).unwrap();
        group.spawn(|| {}).unwrap();
        group.join().unwrap();

        let mut messages = reports
            .lock()
            .unwrap()
            .iter()
            .map(|p| {
                assert!(p.task.starts_with("task-"));
                assert!(p.to_string().starts_with("panic in task-"));
                p.message.clone()
            })
            .collect::<Vec<_>>();
        messages.sort();
        assert_eq!(messages, ["formatted 42", "static message"]);
    }

    #[inline(never)]
    fn fail_while_updating(map: &ShardedMap<u32>) {
        map.put("alice", 1).unwrap();
        panic!("update failed");
    }

    #[test]
    fn test_task_group_panic_site() {
        let reports = Arc::new(Mutex::new(vec![]));
        let group = {
            let reports = reports.clone();
            TaskGroup::on_panic(move |panic| reports.lock().unwrap().push(panic))
        };
        let map = Arc::new(ShardedMap::<u32>::new(4));
        {
            let map = map.clone();
            group.spawn(move || fail_while_updating(&map)).unwrap();
        }
        group.join().unwrap();

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        let panic = &reports[0];
        assert_eq!(panic.message, "update failed");
        let location = panic.location.as_deref().unwrap();
        assert!(location.contains("task_group.rs"), "{location}");
        // The trace starts inside the function that panicked, not at the catch point.
        assert!(
            panic.backtrace.contains("fail_while_updating"),
            "{}",
            panic.backtrace
        );
        assert!(panic.to_string().contains(location));
        assert_eq!(map.get("alice").unwrap(), Some(1));
    }

    #[test]
    fn test_task_group_panic_site_is_per_panic() {
        let group = TaskGroup::new();
        group
            .spawn(|| {
                // A panic caught inside the task is replaced by the one that escapes.
                let _ = catch_unwind(|| panic!("inner"));
                panic!("outer");
            })
            .unwrap();
        group.spawn(|| {}).unwrap();

        match group.join() {
            Err(Error::TaskPanicked(panics)) => {
                assert_eq!(panics.len(), 1);
                assert_eq!(panics[0].message, "outer");
                let location = panics[0].location.as_deref().unwrap();
                assert!(location.contains("task_group.rs"));
            }
            other => panic!("unexpected join result: {other:?}"),
        }
    }

    #[test]
    fn test_task_group_unhandled() {
        let group = TaskGroup::new();
        group.spawn(|| panic!("lost")).unwrap();
        group.spawn(|| {}).unwrap();

        match group.join() {
            Err(Error::TaskPanicked(panics)) => {
                assert_eq!(panics.len(), 1);
                assert_eq!(panics[0].message, "lost");
            }
            other => panic!("unexpected join result: {other:?}"),
        }
        // Reported panics are drained.
        group.join().unwrap();
    }

    #[test]
    fn test_task_group_panicking_handler() {
        let group = TaskGroup::on_panic(|_| panic!("handler failed"));
        group.spawn(|| panic!("task failed")).unwrap();
        group.join().unwrap();
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_task_group_nested_spawn() {
        let group = TaskGroup::new();
        let total = Arc::new(AtomicUsize::default());
        {
            let inner_group = group.clone();
            let total = total.clone();
            group
                .spawn(move || {
                    for _ in 0..4 {
                        let total = total.clone();
                        inner_group
                            .spawn(move || {
                                total.fetch_add(1, Ordering::AcqRel);
                            })
                            .unwrap();
                    }
                })
                .unwrap();
        }
        group.join().unwrap();
        assert_eq!(total.load(Ordering::Acquire), 4);
    }

    #[test]
    fn test_task_group_fan_out_over_shards() {
        let map = Arc::new(ShardedMap::<u32>::new(8));
        for i in 0..128 {
            map.put(&format!("key{i}"), 1).unwrap();
        }

        // One task per shard, each locking only its own shard.
        let group = TaskGroup::new();
        for shard in 0..map.shard_count() {
            let map = map.clone();
            group
                .spawn(move || {
                    map.for_each_shard_write(|index, entries| {
                        if index == shard {
                            entries.values_mut().for_each(|v| *v += 1);
                        }
                    });
                })
                .unwrap();
        }
        group.join().unwrap();

        let mut total = 0;
        map.for_each_shard_read(|_, entries| total += entries.values().sum::<u32>());
        assert_eq!(total, 256);
    }

    #[test]
    fn test_task_group_callback_panic() {
        let map = Arc::new(ShardedMap::<u32>::new(4));
        map.put("alice", 1).unwrap();

        let group = TaskGroup::new();
        {
            let map = map.clone();
            group
                .spawn(move || {
                    map.for_each_shard_write(|_, _| panic!("scan failed"));
                })
                .unwrap();
        }
        assert!(matches!(group.join(), Err(Error::TaskPanicked(_))));

        // The shard locked by the failed scan was released.
        map.put("alice", 2).unwrap();
        assert_eq!(map.get("alice").unwrap(), Some(2));
    }
}
