//! Batched evaluation with ordered folding.
//!
//! Work items are split into fixed-size batches. Items inside a batch may be
//! dispatched concurrently, but batches are evaluated and folded strictly in
//! cursor order so the aggregate is deterministic.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sjtagent_core::config::{BatchErrorPolicy, RunConfig};

use crate::error::{BatchFailure, EvalError};

/// Half-open `[start, end)` range into the work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Cursor {
    pub start: usize,
    pub end: usize,
}

impl Cursor {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A slice of the work handed to an evaluator.
#[derive(Debug)]
pub struct Batch<'a, T> {
    /// Zero-based position in the plan.
    pub index: usize,
    pub cursor: Cursor,
    pub items: &'a [T],
}

/// Evaluates a whole batch at once.
pub trait BatchEvaluator<T: Sync>: Send + Sync {
    type Output: Send;

    fn evaluate<'a>(&'a self, batch: Batch<'a, T>) -> BoxFuture<'a, Result<Self::Output, EvalError>>;
}

/// Evaluates one work item. Wrap in [`Concurrent`] to use as a batch evaluator.
pub trait ItemEvaluator<T>: Send + Sync {
    type Output: Send;

    /// `index` is the item's absolute position in the work list.
    fn evaluate_item<'a>(
        &'a self,
        index: usize,
        item: &'a T,
    ) -> BoxFuture<'a, Result<Self::Output, EvalError>>;
}

/// Dispatches the items of a batch concurrently, at most `max_concurrent`
/// in flight, and returns their results in item order. Any item failure
/// fails the batch.
pub struct Concurrent<E> {
    inner: E,
    max_concurrent: usize,
}

impl<E> Concurrent<E> {
    pub fn new(inner: E, max_concurrent: usize) -> Self {
        Self {
            inner,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<T, E> BatchEvaluator<T> for Concurrent<E>
where
    T: Sync,
    E: ItemEvaluator<T>,
{
    type Output = Vec<E::Output>;

    fn evaluate<'a>(&'a self, batch: Batch<'a, T>) -> BoxFuture<'a, Result<Self::Output, EvalError>> {
        Box::pin(async move {
            let start = batch.cursor.start;
            let results: Vec<Result<E::Output, EvalError>> =
                stream::iter(batch.items.iter().enumerate())
                    .map(|(offset, item)| self.inner.evaluate_item(start + offset, item))
                    .boxed()
                    .buffered(self.max_concurrent)
                    .collect()
                    .await;
            results.into_iter().collect()
        })
    }
}

/// Folds one batch result into the running aggregate value.
pub trait Aggregator<R, A> {
    fn fold(&self, aggregate: &mut A, result: R);
}

impl<R, A, F> Aggregator<R, A> for F
where
    F: Fn(&mut A, R),
{
    fn fold(&self, aggregate: &mut A, result: R) {
        self(aggregate, result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every planned batch was folded or skipped.
    Complete,
    /// Stopped early on request; later batches were never started.
    Cancelled,
    /// Aborted on a batch failure under fail-fast.
    Failed,
}

/// A batch recorded as skipped under skip-and-continue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedBatch {
    pub batch: usize,
    pub cursor: Cursor,
    pub error: EvalError,
}

/// Running result of a batch run.
#[derive(Debug, Clone, Serialize)]
pub struct Aggregate<A> {
    pub value: A,
    /// Batch size the cursors were planned with. Fixed by the first run so a
    /// resume always replans the same cursors.
    pub batch_size: Option<usize>,
    /// Cursors folded into `value`, in fold order.
    pub folded: Vec<Cursor>,
    pub skipped: Vec<SkippedBatch>,
    pub status: BatchStatus,
}

impl<A> Aggregate<A> {
    pub fn new(value: A) -> Self {
        Self {
            value,
            batch_size: None,
            folded: Vec::new(),
            skipped: Vec::new(),
            status: BatchStatus::Complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Complete
    }

    pub fn contains(&self, cursor: Cursor) -> bool {
        self.folded.contains(&cursor)
    }

    /// Fold `result` for `cursor`. Returns `false` and leaves the aggregate
    /// untouched when that cursor, or any item in it, was already folded.
    pub fn fold_batch<R, G>(&mut self, cursor: Cursor, result: R, aggregator: &G) -> bool
    where
        G: Aggregator<R, A> + ?Sized,
    {
        if self.overlaps(cursor) {
            debug!(
                cursor_start = cursor.start,
                cursor_end = cursor.end,
                "Cursor already folded, ignoring"
            );
            return false;
        }
        aggregator.fold(&mut self.value, result);
        self.folded.push(cursor);
        self.skipped.retain(|s| s.cursor != cursor);
        true
    }

    fn overlaps(&self, cursor: Cursor) -> bool {
        self.folded
            .iter()
            .any(|f| f.start < cursor.end && cursor.start < f.end)
    }
}

/// Where the batch loop goes after a batch has been folded or skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Dispatch the batch at this plan index.
    Continue(usize),
    Cancelled,
    End,
}

impl Route {
    fn label(self) -> &'static str {
        match self {
            Route::Continue(_) => "continue",
            Route::Cancelled => "cancelled",
            Route::End => "end",
        }
    }
}

/// Drives the `continue`/`end` loop over batches.
#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    batch_size: usize,
    policy: BatchErrorPolicy,
}

impl BatchCoordinator {
    pub fn new(batch_size: usize, policy: BatchErrorPolicy) -> Self {
        Self {
            batch_size: batch_size.max(1),
            policy,
        }
    }

    /// Coordinator for the `[engine]` and `[evaluation]` settings of a run.
    pub fn from_config(run: &RunConfig, batch_size: usize) -> Self {
        Self::new(batch_size, run.on_batch_error)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn policy(&self) -> BatchErrorPolicy {
        self.policy
    }

    /// Cursors for `len` items; the last batch may be smaller.
    pub fn plan(&self, len: usize) -> Vec<Cursor> {
        plan_cursors(len, self.batch_size)
    }

    pub async fn run_batches<T, E, G, A>(
        &self,
        items: &[T],
        evaluator: &E,
        aggregator: &G,
        init: A,
        cancel: &CancellationToken,
    ) -> Result<Aggregate<A>, BatchFailure<A>>
    where
        T: Sync,
        E: BatchEvaluator<T>,
        G: Aggregator<E::Output, A>,
    {
        self.resume(items, evaluator, aggregator, Aggregate::new(init), cancel)
            .await
    }

    /// Continue a previous run. Batches whose cursor is already folded are
    /// not evaluated again; previously skipped ones are retried.
    ///
    /// Cursors are replanned with the batch size the aggregate was started
    /// with, whatever this coordinator's own size is.
    pub async fn resume<T, E, G, A>(
        &self,
        items: &[T],
        evaluator: &E,
        aggregator: &G,
        mut aggregate: Aggregate<A>,
        cancel: &CancellationToken,
    ) -> Result<Aggregate<A>, BatchFailure<A>>
    where
        T: Sync,
        E: BatchEvaluator<T>,
        G: Aggregator<E::Output, A>,
    {
        let batch_size = match aggregate.batch_size {
            Some(size) if size != self.batch_size => {
                warn!(
                    planned = size,
                    requested = self.batch_size,
                    "Resuming with the aggregate's batch size"
                );
                size
            }
            Some(size) => size,
            None => self.batch_size,
        };
        aggregate.batch_size = Some(batch_size);
        aggregate.status = BatchStatus::Complete;

        let plan = plan_cursors(items.len(), batch_size);
        let total = plan.len();

        let mut route = next_route(&plan, &aggregate, 0, cancel);
        while let Route::Continue(index) = route {
            let cursor = plan[index];
            debug!(
                batch = index,
                cursor_start = cursor.start,
                cursor_end = cursor.end,
                "Dispatching batch"
            );
            let batch = Batch {
                index,
                cursor,
                items: &items[cursor.start..cursor.end],
            };

            let result = evaluator.evaluate(batch).await;
            if cancel.is_cancelled() {
                debug!(batch = index, "Cancellation requested while batch was in flight");
            }

            match result {
                Ok(result) => {
                    aggregate.fold_batch(cursor, result, aggregator);
                    debug!(batch = index, "Batch folded");
                }
                Err(error) => match self.policy {
                    BatchErrorPolicy::FailFast => {
                        warn!(batch = index, error = %error, "Batch failed, aborting run");
                        aggregate.status = BatchStatus::Failed;
                        return Err(BatchFailure {
                            error,
                            batch: index,
                            cursor,
                            aggregate,
                        });
                    }
                    BatchErrorPolicy::SkipAndContinue => {
                        warn!(batch = index, error = %error, "Batch failed, skipping");
                        aggregate.skipped.retain(|s| s.cursor != cursor);
                        aggregate.skipped.push(SkippedBatch {
                            batch: index,
                            cursor,
                            error,
                        });
                    }
                },
            }

            route = next_route(&plan, &aggregate, index + 1, cancel);
            debug!(batch = index, label = route.label(), "Batch routed");
        }

        if route == Route::Cancelled {
            info!(
                total,
                folded = aggregate.folded.len(),
                "Batch run cancelled"
            );
            aggregate.status = BatchStatus::Cancelled;
            return Ok(aggregate);
        }

        info!(
            batches = total,
            folded = aggregate.folded.len(),
            skipped = aggregate.skipped.len(),
            "Batch run complete"
        );
        Ok(aggregate)
    }
}

fn plan_cursors(len: usize, batch_size: usize) -> Vec<Cursor> {
    (0..len)
        .step_by(batch_size)
        .map(|start| Cursor {
            start,
            end: (start + batch_size).min(len),
        })
        .collect()
}

/// The first batch at or after `from` not yet folded, unless the run was
/// cancelled first.
fn next_route<A>(
    plan: &[Cursor],
    aggregate: &Aggregate<A>,
    from: usize,
    cancel: &CancellationToken,
) -> Route {
    let pending = (from..plan.len()).find(|&i| !aggregate.contains(plan[i]));
    match pending {
        None => Route::End,
        Some(_) if cancel.is_cancelled() => Route::Cancelled,
        Some(index) => Route::Continue(index),
    }
}
