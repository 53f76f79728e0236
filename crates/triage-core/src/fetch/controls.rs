//! Call controls: per-call timeout, retry with capped exponential backoff,
//! bounded pagination and the session-scoped rate limiter.

use std::future::Future;
use std::sync::Arc;

use cluster_probe::{Page, PageToken, ProbeResult};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

use crate::config::FetchPolicy;
use crate::domain::FetchError;
use crate::metrics::METRICS;

/// Controls shared by every call one fetcher makes.
///
/// The limiter is shared across the whole session; the deadline is this
/// fetcher's own budget.
#[derive(Debug, Clone)]
pub struct CallControls {
    policy: FetchPolicy,
    limiter: Arc<Semaphore>,
    deadline: Instant,
}

/// Items gathered from a paginated listing, possibly incomplete.
#[derive(Debug)]
pub struct Collected<T> {
    pub items: Vec<T>,
    /// Failure that stopped pagination early.
    pub error: Option<FetchError>,
    /// The page cap was hit with more pages remaining.
    pub truncated: bool,
}

impl<T> Collected<T> {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && !self.truncated
    }
}

impl CallControls {
    pub fn new(policy: FetchPolicy, limiter: Arc<Semaphore>, deadline: Instant) -> Self {
        Self {
            policy,
            limiter,
            deadline,
        }
    }

    /// Controls whose deadline is the policy's fetcher budget from now.
    pub fn for_fetcher(policy: &FetchPolicy, limiter: Arc<Semaphore>) -> Self {
        let deadline = Instant::now() + policy.fetcher_budget();
        Self::new(policy.clone(), limiter, deadline)
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Run one collaborator call under timeout and retry policy.
    ///
    /// Throttling and unavailability are retried up to `max_attempts` with
    /// backoff `min(base * 2^(n-1), max)`. Not-found and access-denied are
    /// returned at once. A timed-out attempt is not retried. Each attempt
    /// holds a limiter permit for its duration and queues for one first.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProbeResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let budget_exhausted = || FetchError::Timeout {
                operation: operation.to_string(),
                after_ms: self.policy.fetcher_budget_ms,
            };

            let permit = match tokio::time::timeout_at(self.deadline, self.limiter.acquire()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_closed)) => {
                    return Err(FetchError::Unexpected("rate limiter closed".to_string()))
                }
                Err(_elapsed) => return Err(budget_exhausted()),
            };

            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(budget_exhausted());
            }
            let per_call = self.policy.call_timeout().min(remaining);

            METRICS.inc_external_calls();
            let result = tokio::time::timeout(per_call, f()).await;
            drop(permit);

            match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    if Instant::now() + delay >= self.deadline {
                        return Err(FetchError::from_collaborator(err, attempt));
                    }
                    debug!(
                        operation = %operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying transient failure"
                    );
                    METRICS.inc_retries();
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(err)) => return Err(FetchError::from_collaborator(err, attempt)),
                Err(_elapsed) => {
                    METRICS.inc_call_timeouts();
                    return Err(FetchError::Timeout {
                        operation: operation.to_string(),
                        after_ms: per_call.as_millis() as u64,
                    });
                }
            }
        }
    }

    /// Follow continuation tokens until the last page or the page cap.
    ///
    /// A failure on any page stops pagination; items from earlier pages are
    /// kept.
    pub async fn collect_pages<T, F, Fut>(&self, operation: &str, mut f: F) -> Collected<T>
    where
        F: FnMut(PageToken) -> Fut,
        Fut: Future<Output = ProbeResult<Page<T>>>,
    {
        let mut items = Vec::new();
        let mut token: PageToken = None;

        for _ in 0..self.policy.max_pages {
            let page = match self.call(operation, || f(token.clone())).await {
                Ok(page) => page,
                Err(error) => {
                    return Collected {
                        items,
                        error: Some(error),
                        truncated: false,
                    }
                }
            };
            items.extend(page.items);
            match page.next_token {
                Some(next) => token = Some(next),
                None => {
                    return Collected {
                        items,
                        error: None,
                        truncated: false,
                    }
                }
            }
        }

        debug!(operation = %operation, max_pages = self.policy.max_pages, "page cap reached");
        Collected {
            items,
            error: None,
            truncated: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_probe::ProbeError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn controls(policy: FetchPolicy) -> CallControls {
        CallControls::for_fetcher(&policy, Arc::new(Semaphore::new(4)))
    }

    fn fast_policy() -> FetchPolicy {
        FetchPolicy {
            call_timeout_ms: 50,
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            max_pages: 3,
            fetcher_budget_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let attempts = AtomicU32::new(0);
        let result = controls(fast_policy())
            .call("ecs:ListTasks", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProbeError::throttled("ecs:ListTasks"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = controls(fast_policy())
            .call("ecs:ListTasks", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ProbeError::unavailable("ecs:ListTasks", "503"))
            })
            .await;
        assert!(matches!(result, Err(FetchError::Transient { attempts: 3, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = controls(fast_policy())
            .call("ecs:DescribeServices", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ProbeError::not_found("ecs:DescribeServices", "web"))
            })
            .await;
        assert!(matches!(result, Err(FetchError::NotFound { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let result: Result<(), _> = controls(fast_policy())
            .call("logs:FilterLogEvents", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(FetchError::Timeout { after_ms: 50, .. })));
    }

    #[tokio::test]
    async fn test_pagination_follows_tokens() {
        let pages = |token: PageToken| async move {
            match token.as_deref() {
                None => Ok(Page::with_next(vec![1, 2], "2")),
                Some("2") => Ok(Page::last(vec![3])),
                Some(other) => Err(ProbeError::unavailable("x", other)),
            }
        };
        let collected = controls(fast_policy()).collect_pages("x", pages).await;
        assert_eq!(collected.items, vec![1, 2, 3]);
        assert!(collected.is_complete());
    }

    #[tokio::test]
    async fn test_pagination_stops_at_page_cap() {
        let endless = |token: PageToken| async move {
            let n: u32 = token.as_deref().unwrap_or("0").parse().unwrap_or(0);
            Ok(Page::with_next(vec![n], (n + 1).to_string()))
        };
        let collected = controls(fast_policy()).collect_pages("x", endless).await;
        assert_eq!(collected.items, vec![0, 1, 2]);
        assert!(collected.truncated);
        assert!(!collected.is_complete());
    }

    #[tokio::test]
    async fn test_pagination_keeps_items_before_failure() {
        let flaky = |token: PageToken| async move {
            match token {
                None => Ok(Page::with_next(vec!["a"], "1")),
                Some(_) => Err(ProbeError::access_denied("x", "no")),
            }
        };
        let collected = controls(fast_policy()).collect_pages("x", flaky).await;
        assert_eq!(collected.items, vec!["a"]);
        assert!(matches!(collected.error, Some(FetchError::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn test_limiter_bounds_concurrency() {
        let limiter = Arc::new(Semaphore::new(1));
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let ctl = CallControls::for_fetcher(&fast_policy(), limiter.clone());
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                ctl.call("x", || {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ProbeError>(())
                    }
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
