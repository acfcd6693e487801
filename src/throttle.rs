//! Trailing-edge coalescing throttle for async operations.
//!
//! Wraps an async function so that a burst of calls collapses into at most
//! one underlying execution per interval, always invoked with the newest
//! arguments (coalesce-to-latest, not drop). Callers whose arguments were
//! coalesced into one execution all resolve to that execution's result.
//!
//! A single worker task owns the wrapped function, so it never runs
//! concurrently with itself. Submissions are sequence-numbered and each
//! completed execution publishes the highest sequence it consumed together
//! with its result; a caller waits for an execution that saw its
//! submission, never an earlier one. Results travel through a `watch`
//! channel, so a caller that wakes late still observes the latest firing
//! instead of missing it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};

pub struct Throttle<T, R> {
    tx: mpsc::UnboundedSender<(u64, T)>,
    done: watch::Sender<(u64, Option<R>)>,
    seq: Arc<AtomicU64>,
}

impl<T, R> Throttle<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Wrap `f` with a minimum interval between execution starts.
    pub fn new<F, Fut>(interval: Duration, mut f: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, T)>();
        let (done, _) = watch::channel((0u64, None::<R>));
        let done_tx = done.clone();

        tokio::spawn(async move {
            let mut last_start: Option<Instant> = None;
            while let Some((mut seq, mut args)) = rx.recv().await {
                // Coalesce anything already queued; latest arguments win.
                while let Ok((s, a)) = rx.try_recv() {
                    seq = s;
                    args = a;
                }
                if let Some(t0) = last_start {
                    let due = t0 + interval;
                    if Instant::now() < due {
                        sleep_until(due).await;
                        // Late arrivals during the wait still make this firing.
                        while let Ok((s, a)) = rx.try_recv() {
                            seq = s;
                            args = a;
                        }
                    }
                }
                last_start = Some(Instant::now());
                let result = f(args).await;
                done_tx.send_replace((seq, Some(result)));
            }
        });

        Self { tx, done, seq: Arc::new(AtomicU64::new(0)) }
    }

    /// Submit arguments and wait for the execution that applies them (or
    /// newer arguments that superseded them).
    pub async fn call(&self, args: T) -> R {
        let mut done = self.done.subscribe();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.tx.send((seq, args)).expect("throttle worker gone");
        loop {
            {
                let latest = done.borrow_and_update();
                if latest.0 >= seq {
                    if let Some(result) = latest.1.clone() {
                        return result;
                    }
                }
            }
            if done.changed().await.is_err() {
                unreachable!("throttle worker dropped while call in flight")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::advance;

    fn counting_throttle(
        interval: Duration,
    ) -> (Throttle<u32, u32>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let throttle = Throttle::new(interval, move |v: u32| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(v);
                v
            }
        });
        (throttle, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_fires_immediately() {
        let (throttle, seen) = counting_throttle(Duration::from_millis(200));
        assert_eq!(throttle.call(7).await, 7);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_to_latest() {
        let (throttle, seen) = counting_throttle(Duration::from_millis(200));
        throttle.call(1).await;

        // Three rapid calls inside the interval: only the last applies.
        let t = throttle;
        let (a, b, c) = tokio::join!(t.call(2), t.call(3), t.call(4));
        assert_eq!((a, b, c), (4, 4, 4));
        assert_eq!(*seen.lock().unwrap(), vec![1, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_calls_each_fire() {
        let (throttle, seen) = counting_throttle(Duration::from_millis(200));
        throttle.call(1).await;
        advance(Duration::from_millis(250)).await;
        throttle.call(2).await;
        advance(Duration::from_millis(250)).await;
        throttle.call(3).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_execution_per_interval() {
        let (throttle, seen) = counting_throttle(Duration::from_millis(200));
        throttle.call(0).await;
        let t = Arc::new(throttle);
        let mut handles = Vec::new();
        for i in 1..=10u32 {
            let t = t.clone();
            handles.push(tokio::spawn(async move { t.call(i).await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // Far fewer executions than calls, and the trailing one carries the
        // newest arguments.
        let seen = seen.lock().unwrap();
        assert!(seen.len() <= 3, "expected coalescing, saw {seen:?}");
        assert_eq!(seen[0], 0);
        assert_eq!(*seen.last().unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn every_caller_resolves_under_sustained_churn() {
        // Far more executions than any fixed result-buffer would hold; a
        // caller that wakes late must still observe the firing that
        // consumed its submission.
        let (throttle, seen) = counting_throttle(Duration::from_millis(200));
        let throttle = Arc::new(throttle);
        let mut handles = Vec::new();
        for wave in 0..25u32 {
            for i in 0..3 {
                let t = throttle.clone();
                handles.push(tokio::spawn(async move { t.call(wave * 3 + i).await }));
            }
            advance(Duration::from_millis(250)).await;
        }
        for h in handles {
            let result = h.await.unwrap();
            assert!(*seen.lock().unwrap().last().unwrap() >= result);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn caller_never_gets_a_stale_result() {
        let (throttle, _) = counting_throttle(Duration::from_millis(200));
        throttle.call(1).await;
        // Submitted inside the interval: must resolve to an execution that
        // consumed it, not to the one that already fired.
        assert_eq!(throttle.call(2).await, 2);
    }
}
