//! Same `map` contract as the coordinator, run on this machine's cores.
//!
//! Useful to debug a task function before distributing it, or when the batch
//! is small enough that remote workers do not pay off.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{PoolError, TaskError};

/// Run `f` over every task on the calling thread, in input order.
pub fn map_serial<T, R, E, F>(
    f: F,
    tasks: impl IntoIterator<Item = T>,
) -> HashMap<T, Result<R, TaskError>>
where
    T: Eq + Hash,
    E: Display,
    F: Fn(&T) -> Result<R, E>,
{
    let tasks: Vec<T> = tasks.into_iter().collect();
    let total = tasks.len();
    let started = Instant::now();
    let mut results = HashMap::with_capacity(total);

    for (i, task) in tasks.into_iter().enumerate() {
        let outcome = run_one(&f, &task);
        log_completion(i + 1, total, started, &outcome);
        results.insert(task, outcome);
    }
    results
}

/// Run `f` over every task on a dedicated rayon pool.
///
/// The pool gets `min(ncpu, tasks, available cores - 1)` threads, never fewer
/// than one. Fails only when the thread pool cannot be built.
pub fn map_parallel<T, R, E, F>(
    f: F,
    tasks: impl IntoIterator<Item = T>,
    ncpu: usize,
) -> Result<HashMap<T, Result<R, TaskError>>, PoolError>
where
    T: Eq + Hash + Send,
    R: Send,
    E: Display,
    F: Fn(&T) -> Result<R, E> + Sync,
{
    let tasks: Vec<T> = tasks.into_iter().collect();
    let total = tasks.len();
    if total == 0 {
        return Ok(HashMap::new());
    }

    let threads = pool_size(ncpu, total);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("schwarm-local-{i}"))
        .build()
        .map_err(|e| PoolError::Spawn(format!("local thread pool: {e}")))?;
    info!(tasks = total, threads, "running batch on local cores");

    let started = Instant::now();
    let completed = AtomicUsize::new(0);
    let outcomes: Vec<(T, Result<R, TaskError>)> = pool.install(|| {
        tasks
            .into_par_iter()
            .map(|task| {
                let outcome = run_one(&f, &task);
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                log_completion(done, total, started, &outcome);
                (task, outcome)
            })
            .collect()
    });

    Ok(outcomes.into_iter().collect())
}

fn pool_size(ncpu: usize, tasks: usize) -> usize {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    ncpu.min(tasks).min(cores.saturating_sub(1).max(1)).max(1)
}

fn run_one<T, R, E, F>(f: &F, task: &T) -> Result<R, TaskError>
where
    E: Display,
    F: Fn(&T) -> Result<R, E>,
{
    match catch_unwind(AssertUnwindSafe(|| f(task))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::Local(e.to_string())),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(TaskError::Local(format!("panicked: {message}")))
        }
    }
}

fn log_completion<R>(done: usize, total: usize, started: Instant, outcome: &Result<R, TaskError>) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(_) => info!(completed = done, total, elapsed_ms, "task done"),
        Err(e) => warn!(completed = done, total, elapsed_ms, error = %e, "task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::fib;

    fn checked_fib(n: &u64) -> Result<u64, String> {
        fib(*n).ok_or_else(|| format!("fib({n}) overflows"))
    }

    #[test]
    fn serial_collapses_equal_tasks() {
        let results = map_serial(checked_fib, [3, 1, 4, 1, 5]);
        assert_eq!(results.len(), 4);
        assert_eq!(*results[&3].as_ref().unwrap(), 2);
        assert_eq!(*results[&1].as_ref().unwrap(), 1);
        assert_eq!(*results[&4].as_ref().unwrap(), 3);
        assert_eq!(*results[&5].as_ref().unwrap(), 5);
    }

    #[test]
    fn parallel_matches_serial() {
        let tasks: Vec<u64> = (0..40).collect();
        let serial = map_serial(checked_fib, tasks.clone());
        let parallel = map_parallel(checked_fib, tasks, 4).unwrap();
        assert_eq!(parallel.len(), serial.len());
        for (task, value) in &serial {
            assert_eq!(value.as_ref().unwrap(), parallel[task].as_ref().unwrap());
        }
    }

    #[test]
    fn errors_and_panics_are_captured() {
        let results = map_parallel(
            |n: &u64| match n {
                0 => panic!("no zeros"),
                n if *n > 93 => Err(format!("{n} too large")),
                n => Ok(*n),
            },
            [0, 7, 100],
            2,
        )
        .unwrap();

        assert_eq!(*results[&7].as_ref().unwrap(), 7);
        match &results[&100] {
            Err(TaskError::Local(msg)) => assert_eq!(msg, "100 too large"),
            other => panic!("unexpected {other:?}"),
        }
        match &results[&0] {
            Err(TaskError::Local(msg)) => assert!(msg.contains("no zeros")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_batch() {
        let results = map_parallel(checked_fib, Vec::<u64>::new(), 8).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn pool_size_is_bounded() {
        assert_eq!(pool_size(8, 1), 1);
        assert_eq!(pool_size(0, 10), 1);
        assert!(pool_size(64, 64) >= 1);
    }
}
