//! Broker consumers: a fixed pool of loops that reserve tasks, run the
//! executor, and acknowledge completion.
//!
//! A task is acknowledged after the executor returns, whatever the
//! application outcome; executor-level failures are recorded on the
//! application row, not redelivered. Tasks lost to a crashed process stay
//! on the processing list and are requeued at the next startup.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dispatch::broker::Broker;
use crate::engine;
use crate::state::AppState;

const IDLE_POLL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Spawns the consumer pool. No-op in direct mode.
pub fn spawn_consumers(state: &AppState) {
    let Some(broker) = state.broker.clone() else {
        info!("No broker configured; dispatcher runs in direct mode");
        return;
    };

    let count = state.config.queue_concurrency.max(1);
    info!("Starting {count} queue consumer(s)");
    for consumer in 0..count {
        let state = state.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            consume_loop(state, broker, consumer).await;
        });
    }
}

async fn consume_loop(state: AppState, broker: Broker, consumer: usize) {
    loop {
        match broker.reserve().await {
            Ok(Some(task)) => {
                debug!(
                    "Consumer {consumer} reserved application {} (attempt {})",
                    task.application_id, task.attempt
                );
                engine::execute_application(&state, task.application_id).await;
                if let Err(e) = broker.complete(&task).await {
                    warn!("Consumer {consumer} failed to acknowledge task: {e}");
                }
            }
            Ok(None) => tokio::time::sleep(IDLE_POLL).await,
            Err(e) => {
                warn!("Consumer {consumer} reserve failed: {e}; backing off");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}
