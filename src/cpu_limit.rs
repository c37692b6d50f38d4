//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::LazyLock;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent OCR processes.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Wait for a CPU permit. Hold it while running an external process that
/// wants a whole core to itself.
///
/// In-process CPU work doesn't need this, as long as it runs under
/// [`crate::async_utils::spawn_blocking_propagating_panics`].
#[instrument(level = "trace", skip_all)]
pub async fn acquire_cpu_permit() -> Result<SemaphorePermit<'static>> {
    CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")
}

