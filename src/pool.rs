//! Bounded pool of threads to send requests in parallel.

use std::{
    cmp::min,
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
    thread,
};

use crate::error::{Error, Result};

/// Apply `f` to every item, using up to `limit` threads.
///
/// Results are returned in the same order as `items`. If any call
/// fails, pending items are skipped, and the first error (in the order
/// of `items`) is returned.
pub(crate) fn try_map_ordered<T, R, F>(items: &[T], limit: usize, f: F) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    let is_alive = AtomicBool::new(true);

    let tasks: Vec<_> = items.iter().map(Task::new).collect();

    let pending: VecDeque<_> = tasks.iter().collect();
    let pending = Mutex::new(pending);

    thread::scope(|scope| {
        let alive_tracker = AliveTracker(&is_alive);

        for _ in 0..min(limit.max(1), tasks.len()) {
            scope.spawn(|| {
                while let Ok(Some(task)) = pending.lock().map(|mut q| q.pop_front()) {
                    if !is_alive.load(Ordering::Relaxed) {
                        task.complete(Err(Error::Cancelled));
                        continue;
                    }

                    let result = f(task.item);
                    if result.is_err() {
                        is_alive.store(false, Ordering::Relaxed);
                    }

                    task.complete(result);
                }
            });
        }

        let results = tasks.iter().map(Task::get).collect();

        drop(alive_tracker);
        results
    })
}

/// Set the `AtomicBool` instance to `false` when this instance is
/// dropped (for example, after `panic!`).
struct AliveTracker<'a>(&'a AtomicBool);

impl Drop for AliveTracker<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

struct Task<'a, T, R> {
    item: &'a T,
    result: Mutex<Option<Result<R>>>,
    notifier: Condvar,
}

impl<'a, T, R> Task<'a, T, R> {
    fn new(item: &'a T) -> Self {
        Task {
            item,
            result: Mutex::new(None),
            notifier: Condvar::new(),
        }
    }

    /// Store the result of the task, and notify any waiting thread.
    fn complete(&self, result: Result<R>) {
        let mut lock = self.result.lock().unwrap();
        *lock = Some(result);
        self.notifier.notify_one();
    }

    /// Wait until the result of the task is ready.
    fn get(&self) -> Result<R> {
        let mut lock = self.result.lock().unwrap();
        loop {
            lock = match lock.take() {
                Some(r) => return r,
                None => self.notifier.wait(lock).unwrap(),
            }
        }
    }
}

#[test]
fn keep_order() {
    use std::time::Duration;

    let items: Vec<u64> = (0..20).collect();

    let results = try_map_ordered(&items, 4, |n| {
        // Later items finish first.
        thread::sleep(Duration::from_millis(20 - n));
        Ok(n * 2)
    })
    .unwrap();

    assert_eq!(results, items.iter().map(|n| n * 2).collect::<Vec<_>>());
}

#[test]
fn stop_after_error() {
    use std::sync::atomic::AtomicUsize;

    let calls = AtomicUsize::new(0);
    let items: Vec<usize> = (0..100).collect();

    let result = try_map_ordered(&items, 2, |n| {
        calls.fetch_add(1, Ordering::SeqCst);
        if *n == 3 {
            Err(Error::NotFound(n.to_string()))
        } else {
            Ok(*n)
        }
    });

    assert!(matches!(result, Err(Error::NotFound(n)) if n == "3"));
    assert!(calls.load(Ordering::SeqCst) < items.len());
}
