//! Background polling scheduler.
//!
//! Timer-based loop:
//! 1. Each tick, ask the store for the configured mailboxes
//! 2. Run a poll for every enabled mailbox whose interval has elapsed
//! 3. Sleep until the next tick
//!
//! Per-mailbox pacing lives in [`crate::config::MailSettings::is_due`], so
//! the tick can be much shorter than any mailbox's polling interval without
//! over-polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pipeline::orchestrator::PollingPipeline;

/// Default scheduler tick: one minute.
const DEFAULT_TICK_SECS: u64 = 60;

/// Spawn the background task that polls due mailboxes.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_polling_scheduler(
    pipeline: Arc<PollingPipeline>,
    tick_secs: Option<u64>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let interval = tick_secs.unwrap_or_else(|| {
        std::env::var("PARSEIT_TICK_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TICK_SECS)
    });

    let handle = tokio::spawn(async move {
        info!("Polling scheduler started — checking mailboxes every {interval}s");

        let mut tick = tokio::time::interval(Duration::from_secs(interval));

        // Run immediately on first tick
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Polling scheduler shutting down");
                return;
            }

            let summaries = pipeline.run_due().await;
            if !summaries.is_empty() {
                debug!(runs = summaries.len(), "Scheduler tick finished");
            }
        }
    });

    (handle, shutdown_flag)
}
