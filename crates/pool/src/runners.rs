//! Runners the stock worker binary can host.

use std::time::Duration;

use async_trait::async_trait;

use crate::server::Runner;

/// n-th Fibonacci number with `fib(0) = 0`, `fib(1) = fib(2) = 1`.
///
/// Returns `None` when the result does not fit in a `u64` (n > 93).
pub fn fib(n: u64) -> Option<u64> {
    if n == 0 {
        return Some(0);
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 1..n {
        let next = a.checked_add(b)?;
        a = b;
        b = next;
    }
    Some(b)
}

/// Computes [`fib`] of each task.
#[derive(Debug, Default, Clone, Copy)]
pub struct FibRunner;

#[async_trait]
impl Runner for FibRunner {
    type Task = u64;
    type Output = u64;

    fn kind(&self) -> &str {
        "fib"
    }

    async fn run(&self, n: u64) -> Result<u64, String> {
        fib(n).ok_or_else(|| format!("fib({n}) overflows u64"))
    }
}

/// Returns every task unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRunner;

#[async_trait]
impl Runner for EchoRunner {
    type Task = serde_json::Value;
    type Output = serde_json::Value;

    fn kind(&self) -> &str {
        "echo"
    }

    async fn run(&self, task: serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(task)
    }
}

/// Sleeps for the given number of milliseconds and returns it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepRunner;

#[async_trait]
impl Runner for SleepRunner {
    type Task = u64;
    type Output = u64;

    fn kind(&self) -> &str {
        "sleep"
    }

    async fn run(&self, millis: u64) -> Result<u64, String> {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fib_sequence() {
        let first: Vec<u64> = (0..10).map(|n| fib(n).unwrap()).collect();
        assert_eq!(first, vec![0, 1, 1, 2, 3, 5, 8, 13, 21, 34]);
        assert_eq!(fib(93), Some(12_200_160_415_121_876_738));
        assert_eq!(fib(94), None);
    }

    #[tokio::test]
    async fn fib_runner_reports_overflow() {
        assert_eq!(FibRunner.run(5).await, Ok(5));
        assert!(FibRunner.run(200).await.unwrap_err().contains("overflows"));
    }

    #[tokio::test]
    async fn echo_returns_input() {
        let task = serde_json::json!({"a": [1, 2, 3]});
        assert_eq!(EchoRunner.run(task.clone()).await, Ok(task));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_runner_waits() {
        let start = tokio::time::Instant::now();
        assert_eq!(SleepRunner.run(250).await, Ok(250));
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
