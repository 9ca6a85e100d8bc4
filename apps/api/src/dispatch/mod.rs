//! Dispatcher: hands a queued application to the broker, or runs it
//! in-process when no broker is available.
//!
//! Both paths converge on `engine::execute_application`; the mode only
//! changes where the work runs. Direct mode exists so a Redis outage
//! degrades the service to synchronous background execution instead of
//! refusing submissions.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine;
use crate::events::ProgressStage;
use crate::state::AppState;

pub mod broker;
pub mod runner;

use broker::TaskEnvelope;

/// Where a dispatched application will execute. Reported back to the
/// submitter so clients know whether to expect queue latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Queued,
    Direct,
}

/// Dispatches a freshly created application. Enqueue failure against a
/// configured broker falls back to direct execution rather than erroring
/// the request.
pub async fn dispatch_application(state: &AppState, application_id: Uuid) -> DispatchMode {
    state.hub.progress(
        application_id,
        ProgressStage::Dispatched,
        "application accepted for execution",
    );

    if let Some(broker) = &state.broker {
        let task = TaskEnvelope {
            application_id,
            attempt: 0,
        };
        match broker.enqueue(&task).await {
            Ok(()) => {
                info!("Application {application_id} enqueued for worker-pool execution");
                return DispatchMode::Queued;
            }
            Err(e) => {
                warn!("Broker enqueue failed for {application_id}, running directly: {e}");
            }
        }
    }

    spawn_direct(state.clone(), application_id);
    DispatchMode::Direct
}

/// Re-dispatches an application in RETRYING. Same fallback rules as the
/// initial dispatch.
pub async fn redispatch(state: &AppState, application_id: Uuid, attempt: u32) {
    if let Some(broker) = &state.broker {
        let task = TaskEnvelope {
            application_id,
            attempt,
        };
        match broker.enqueue(&task).await {
            Ok(()) => return,
            Err(e) => {
                warn!("Broker re-enqueue failed for {application_id}, running directly: {e}");
            }
        }
    }
    spawn_direct(state.clone(), application_id);
}

fn spawn_direct(state: AppState, application_id: Uuid) {
    tokio::spawn(execute_boxed(state, application_id));
}

/// Boxed so the retry path (executor → redispatch → executor) does not
/// build an infinitely recursive future type.
fn execute_boxed(
    state: AppState,
    application_id: Uuid,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        engine::execute_application(&state, application_id).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_wire_format() {
        assert_eq!(serde_json::to_string(&DispatchMode::Queued).unwrap(), "\"queued\"");
        assert_eq!(serde_json::to_string(&DispatchMode::Direct).unwrap(), "\"direct\"");
    }
}
