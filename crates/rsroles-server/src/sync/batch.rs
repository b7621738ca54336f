//! Concurrent batch executor with failure aggregation.
//!
//! Unlike `try_join_all`, nothing short-circuits: every task runs to
//! completion before results are inspected, so each failure is observed.
//!
//! # Aggregation
//!
//! - No failures: the values, in input order
//! - One or more failures: the first failure in input order is the primary
//!   error and every other failure is attached to it as suppressed

use std::future::Future;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::config::BatchSettings;
use crate::error::{ServiceError, ServiceResult};

/// Bounded fan-out over remote calls.
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor {
    max_concurrency: usize,
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::from(&BatchSettings::default())
    }
}

impl From<&BatchSettings> for BatchExecutor {
    fn from(settings: &BatchSettings) -> Self {
        Self::new(settings.max_concurrency)
    }
}

impl BatchExecutor {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Runs `task` for every item, at most `max_concurrency` at a time.
    pub async fn run<I, T, F, Fut>(&self, items: I, task: F) -> ServiceResult<Vec<T>>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let results: Vec<ServiceResult<T>> = stream::iter(items)
            .map(task)
            .buffered(self.max_concurrency)
            .collect()
            .await;

        debug!(tasks = results.len(), "Batch completed");
        aggregate(results)
    }
}

/// Folds task results into one result; see the module docs.
pub fn aggregate<T, I>(results: I) -> ServiceResult<Vec<T>>
where
    I: IntoIterator<Item = ServiceResult<T>>,
{
    let mut values = Vec::new();
    let mut failures: Vec<ServiceError> = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) => failures.push(err),
        }
    }

    if failures.is_empty() {
        return Ok(values);
    }
    let primary = failures.remove(0);
    Err(primary.with_suppressed(failures))
}
