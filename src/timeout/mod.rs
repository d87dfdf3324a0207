//! Per-request deadlines with soft cancellation.
//!
//! [`run_bounded`] races a unit of work against a wall-clock deadline. The
//! work is spawned as its own task, so when the deadline wins the caller gets
//! control back immediately while the work keeps running. Nothing is killed:
//! the work is only *told* to stop through its [`DeadlineContext`].
//!
//! A [`ResponseGuard`] decides which side produces the visible result. Both
//! the timer path and the work path must claim it, and only one claim can
//! succeed, so a straggler that finishes after the timeout is discarded
//! instead of racing the fallback. The straggler's work is wasted, not
//! harmful.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{task::JoinError, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod middleware;

pub use middleware::TimeoutMiddleware;

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// How a bounded run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The work finished within its deadline.
    Completed(T),
    /// The deadline passed first; the work may still be running.
    TimedOut,
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::TimedOut => None,
        }
    }
}

/// The work itself failed before producing anything.
///
/// A timeout is not an error; see [`Outcome::TimedOut`].
#[derive(Debug, Error)]
pub enum DeadlineError {
    #[error("bounded work panicked")]
    Panicked,

    #[error("bounded work was cancelled by the runtime")]
    Aborted,
}

impl From<JoinError> for DeadlineError {
    fn from(err: JoinError) -> Self {
        if err.is_panic() {
            Self::Panicked
        } else {
            Self::Aborted
        }
    }
}

/// Exclusive "has already responded" flag shared by the work and the timer.
#[derive(Debug, Clone, Default)]
pub struct ResponseGuard(Arc<AtomicBool>);

impl ResponseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the right to respond. Exactly one caller ever gets `true`.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Deadline, cancellation signal and response guard of one governed request.
///
/// Handed to the work by [`run_bounded_with`] and, through
/// [`TimeoutMiddleware`], stored in the request extensions.
#[derive(Debug, Clone)]
pub struct DeadlineContext {
    expires_at: Instant,
    budget: Duration,
    cancel: CancellationToken,
    guard: ResponseGuard,
}

impl DeadlineContext {
    /// Starts a deadline `budget` from now.
    ///
    /// A budget too large for an [`Instant`] is capped at roughly 30 years.
    pub fn new(budget: Duration) -> Self {
        let now = Instant::now();
        Self {
            expires_at: now
                .checked_add(budget)
                .unwrap_or_else(|| now + FAR_FUTURE),
            budget,
            cancel: CancellationToken::new(),
            guard: ResponseGuard::new(),
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// `true` once the governor has given up on this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the governor has given up on this request.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn guard(&self) -> &ResponseGuard {
        &self.guard
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Runs `work` with a deadline of `deadline` from now.
///
/// # Errors
///
/// [`DeadlineError`] if the work panicked or was aborted before the deadline.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rampart::timeout::{Outcome, run_bounded};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let outcome = run_bounded(Duration::from_secs(1), async { 7 }).await.unwrap();
/// assert_eq!(outcome, Outcome::Completed(7));
/// # }
/// ```
pub async fn run_bounded<T, F>(deadline: Duration, work: F) -> Result<Outcome<T>, DeadlineError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    run_bounded_with(deadline, move |_| work).await
}

/// Like [`run_bounded`], but `work` is built from the request's
/// [`DeadlineContext`] so it can notice cancellation and stop early.
///
/// # Errors
///
/// [`DeadlineError`] if the work panicked or was aborted before the deadline.
pub async fn run_bounded_with<T, W, F>(
    deadline: Duration,
    work: W,
) -> Result<Outcome<T>, DeadlineError>
where
    W: FnOnce(DeadlineContext) -> F,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let ctx = DeadlineContext::new(deadline);
    let guard = ctx.guard().clone();
    let future = work(ctx.clone());

    let mut task = tokio::spawn(async move {
        let value = future.await;
        if guard.try_claim() {
            Some(value)
        } else {
            debug!("discarding result that completed after its deadline");
            None
        }
    });

    tokio::select! {
        biased;

        joined = &mut task => settle(joined),
        () = tokio::time::sleep_until(ctx.expires_at()) => {
            // Work that became ready on the same tick gets one turn to finish
            // and claim the guard first.
            tokio::task::yield_now().await;
            if ctx.guard().try_claim() {
                ctx.cancel();
                debug!(timeout_ms = deadline.as_millis() as u64, "deadline exceeded");
                Ok(Outcome::TimedOut)
            } else {
                // The work claimed the guard in the same instant; its value is
                // already on the way out of the task.
                settle(task.await)
            }
        }
    }
}

fn settle<T>(joined: Result<Option<T>, JoinError>) -> Result<Outcome<T>, DeadlineError> {
    match joined? {
        Some(value) => Ok(Outcome::Completed(value)),
        // Only reachable if the timer claimed first, which returns before
        // awaiting the task.
        None => Ok(Outcome::TimedOut),
    }
}

/// A fixed per-request timeout, applied with [`run_bounded`].
#[derive(Debug, Clone, Copy)]
pub struct DeadlineGovernor {
    timeout: Duration,
}

impl DeadlineGovernor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// # Errors
    ///
    /// See [`run_bounded`].
    pub async fn run<T, F>(&self, work: F) -> Result<Outcome<T>, DeadlineError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        run_bounded(self.timeout, work).await
    }

    /// # Errors
    ///
    /// See [`run_bounded_with`].
    pub async fn run_with<T, W, F>(&self, work: W) -> Result<Outcome<T>, DeadlineError>
    where
        W: FnOnce(DeadlineContext) -> F,
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        run_bounded_with(self.timeout, work).await
    }
}
