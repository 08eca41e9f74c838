//! Chunked, concurrency-limited execution of many independent async operations.
//!
//! Items are split into chunks of `batch_size`, processed strictly one after
//! another. Inside a chunk, items run in windows of `concurrency`; windows are
//! sequential, items inside a window run together. Without either limit every
//! item runs at once.
//!
//! Every item runs to completion regardless of sibling failures. Results are
//! returned in input order; [`BatchOutcome::into_result`] opts into treating
//! any failure as a failure of the whole batch.
//!
//! All in-flight operations are polled from the calling task; nothing is
//! spawned.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;

/// Receives a snapshot every time the batch state changes.
pub type ProgressCallback<R, E> = Arc<dyn Fn(&BatchProgress<R, E>) + Send + Sync>;

/// Execution limits and telemetry hook.
pub struct BatchOptions<R, E> {
    /// Items per sequential chunk. `None` or `0`: one chunk.
    pub batch_size: Option<usize>,
    /// Items in flight at once inside a chunk. `None` or `0`: the whole chunk.
    pub concurrency: Option<usize>,
    pub on_progress: Option<ProgressCallback<R, E>>,
}

// Manual impls: avoid derive adding `R: Default/Clone, E: Default/Clone` bounds.
impl<R, E> Default for BatchOptions<R, E> {
    fn default() -> Self {
        Self {
            batch_size: None,
            concurrency: None,
            on_progress: None,
        }
    }
}

impl<R, E> Clone for BatchOptions<R, E> {
    fn clone(&self) -> Self {
        Self {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            on_progress: self.on_progress.clone(),
        }
    }
}

impl<R, E> std::fmt::Debug for BatchOptions<R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl<R, E> BatchOptions<R, E> {
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, callback: impl Fn(&BatchProgress<R, E>) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Completed,
    Failed,
}

/// Telemetry record for one settled item.
#[derive(Debug, Clone)]
pub struct BatchItemResult<R, E> {
    /// Position in the original input.
    pub index: usize,
    pub status: ItemStatus,
    pub result: Option<R>,
    pub error: Option<E>,
    pub duration: Duration,
}

/// Progress snapshot handed to [`ProgressCallback`].
#[derive(Debug, Clone)]
pub struct BatchProgress<R, E> {
    /// Rounded completion percentage, 0 to 100.
    pub progress: u8,
    /// Settled items, failures included.
    pub completed: usize,
    pub total: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub estimated_time_remaining: Option<Duration>,
    pub average_time: Option<Duration>,
    /// 1-based index of the chunk being processed.
    pub current_batch: usize,
    pub total_batches: usize,
    pub operations_per_second: Option<f64>,
    /// Settled items in arrival order.
    pub results: Vec<BatchItemResult<R, E>>,
}

impl<R, E> BatchProgress<R, E> {
    fn new(total: usize, total_batches: usize) -> Self {
        Self {
            progress: percent(0, total),
            completed: 0,
            total,
            failed: 0,
            in_progress: 0,
            estimated_time_remaining: None,
            average_time: None,
            current_batch: 1,
            total_batches,
            operations_per_second: None,
            results: Vec::new(),
        }
    }

    fn recompute(&mut self, elapsed: Duration) {
        self.progress = percent(self.completed, self.total);
        if self.completed == 0 {
            return;
        }
        let average = elapsed.div_f64(self.completed as f64);
        self.average_time = Some(average);
        let seconds = elapsed.as_secs_f64();
        self.operations_per_second = (seconds > 0.0).then(|| self.completed as f64 / seconds);
        self.estimated_time_remaining = Some(average.mul_f64((self.total - self.completed) as f64));
    }
}

fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    // completed <= total, so the result fits.
    ((completed as f64 / total as f64) * 100.0).round() as u8
}

/// Final state of a batch run.
#[derive(Debug, Clone)]
pub struct BatchOutcome<R, E> {
    /// One entry per input item, in input order.
    pub results: Vec<Result<R, E>>,
    /// Last progress snapshot.
    pub progress: BatchProgress<R, E>,
}

/// First failure of a batch that was required to fully succeed.
#[derive(Debug, Clone)]
pub struct BatchFailure<E> {
    /// Input index of the first failed item.
    pub index: usize,
    pub error: E,
    /// Total number of failed items.
    pub failed: usize,
}

impl<R, E> BatchOutcome<R, E> {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.progress.failed
    }

    /// All values in input order, or the first failure by index.
    ///
    /// # Errors
    ///
    /// Returns [`BatchFailure`] if any item failed.
    pub fn into_result(self) -> Result<Vec<R>, BatchFailure<E>> {
        let failed = self.progress.failed;
        let mut values = Vec::with_capacity(self.results.len());
        for (index, result) in self.results.into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(error) => return Err(BatchFailure { index, error, failed }),
            }
        }
        Ok(values)
    }
}

struct TrackerState<R, E> {
    progress: BatchProgress<R, E>,
    outcomes: Vec<Option<Result<R, E>>>,
}

struct ProgressTracker<R, E> {
    state: Mutex<TrackerState<R, E>>,
    on_progress: Option<ProgressCallback<R, E>>,
    started: Instant,
}

impl<R: Clone, E: Clone> ProgressTracker<R, E> {
    fn new(total: usize, total_batches: usize, on_progress: Option<ProgressCallback<R, E>>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                progress: BatchProgress::new(total, total_batches),
                outcomes: (0..total).map(|_| None).collect(),
            }),
            on_progress,
            started: Instant::now(),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut TrackerState<R, E>)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut state);
        if let Some(callback) = &self.on_progress {
            callback(&state.progress);
        }
    }

    fn emit(&self) {
        self.update(|_| {});
    }

    fn start_window(&self, chunk: usize, size: usize) {
        self.update(|state| {
            state.progress.current_batch = chunk + 1;
            state.progress.in_progress += size;
        });
    }

    fn settle(&self, index: usize, outcome: Result<R, E>, duration: Duration) {
        let elapsed = self.started.elapsed();
        self.update(|state| {
            let progress = &mut state.progress;
            progress.completed += 1;
            progress.in_progress = progress.in_progress.saturating_sub(1);

            let entry = match &outcome {
                Ok(value) => BatchItemResult {
                    index,
                    status: ItemStatus::Completed,
                    result: Some(value.clone()),
                    error: None,
                    duration,
                },
                Err(error) => {
                    progress.failed += 1;
                    BatchItemResult {
                        index,
                        status: ItemStatus::Failed,
                        result: None,
                        error: Some(error.clone()),
                        duration,
                    }
                }
            };
            progress.results.push(entry);
            progress.recompute(elapsed);
            state.outcomes[index] = Some(outcome);
        });
    }

    fn finish(self) -> BatchOutcome<R, E> {
        self.update(|state| state.progress.in_progress = 0);
        let state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        BatchOutcome {
            // Every window is awaited to completion, so every slot is filled.
            results: state.outcomes.into_iter().flatten().collect(),
            progress: state.progress,
        }
    }
}

/// Split `items` into consecutive chunks, pairing each item with its input index.
fn chunked<T>(items: Vec<T>, size: Option<usize>) -> Vec<Vec<(usize, T)>> {
    let total = items.len();
    let size = size.filter(|&s| s > 0).unwrap_or(total.max(1));
    let mut chunks: Vec<Vec<(usize, T)>> = Vec::with_capacity(total.div_ceil(size).max(1));
    for (index, item) in items.into_iter().enumerate() {
        if chunks.last().is_none_or(|chunk| chunk.len() == size) {
            chunks.push(Vec::with_capacity(size.min(total - index)));
        }
        if let Some(chunk) = chunks.last_mut() {
            chunk.push((index, item));
        }
    }
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }
    chunks
}

/// Run `op` for every item under the limits in `options`.
///
/// `op` receives each item with its index in `items`. A failing item is
/// recorded and never stops its siblings or later chunks.
pub async fn run_batch<T, R, E, F, Fut>(items: Vec<T>, op: F, options: BatchOptions<R, E>) -> BatchOutcome<R, E>
where
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: Clone,
    E: Clone,
{
    let total = items.len();
    let chunks = chunked(items, options.batch_size);
    let concurrency = options.concurrency.filter(|&c| c > 0);
    let tracker = ProgressTracker::new(total, chunks.len(), options.on_progress);

    tracker.emit();

    for (chunk_index, chunk) in chunks.into_iter().enumerate() {
        let windows = match concurrency {
            Some(limit) if chunk.len() > limit => chunked_windows(chunk, limit),
            _ => vec![chunk],
        };

        for window in windows {
            if window.is_empty() {
                continue;
            }
            tracker.start_window(chunk_index, window.len());

            let tracker = &tracker;
            let in_flight = window.into_iter().map(|(index, item)| {
                let operation = op(item, index);
                async move {
                    let started = Instant::now();
                    let outcome = operation.await;
                    tracker.settle(index, outcome, started.elapsed());
                }
            });
            join_all(in_flight).await;
        }
    }

    tracker.finish()
}

fn chunked_windows<T>(chunk: Vec<(usize, T)>, limit: usize) -> Vec<Vec<(usize, T)>> {
    let mut windows = Vec::with_capacity(chunk.len().div_ceil(limit));
    let mut current = Vec::with_capacity(limit);
    for entry in chunk {
        current.push(entry);
        if current.len() == limit {
            windows.push(std::mem::replace(&mut current, Vec::with_capacity(limit)));
        }
    }
    if !current.is_empty() {
        windows.push(current);
    }
    windows
}
