use std::future::Future;
use std::pin::Pin;

use futures::stream::{self, StreamExt};

use crate::error::DriverError;

/// Default fan-out width for apply/clean batches. These are really, really
/// lightweight tasks that spend their life waiting on provider I/O.
pub const DEFAULT_WORKERS: usize = 10;

/// Bounded fan-out for per-resource-type batches.
///
/// Within a batch completion order is unspecified. The whole batch always
/// runs to completion; the first error, if any, surfaces afterwards.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1) }
    }

    pub async fn map<O>(
        &self,
        futures: Vec<Pin<Box<dyn Future<Output = Result<O, DriverError>> + Send + '_>>>,
    ) -> Result<Vec<O>, DriverError> {
        let results: Vec<Result<O, DriverError>> = stream::iter(futures)
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut out = Vec::with_capacity(results.len());
        for result in results {
            out.push(result?);
        }
        Ok(out)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}
