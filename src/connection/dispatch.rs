use super::{QueuedEvent, Shared};
use crate::protocol::Request;
use crate::state_map::StateMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const SEND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Shutdown interrupted the current step.
struct Interrupted;

pub(super) async fn wait_for_state_map(shared: &Shared) -> Option<Arc<StateMap>> {
    let mut maps = shared.state_map.subscribe();
    loop {
        let current = maps.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        tokio::select! {
            changed = maps.changed() => changed.ok()?,
            _ = shared.shutdown_requested() => return None,
        }
    }
}

/// Drains the queue strictly in order. The loop does not take the next
/// event until the current one has finished its whole send/wait/send cycle.
pub(super) async fn run(shared: Arc<Shared>, mut queue: mpsc::UnboundedReceiver<QueuedEvent>) {
    loop {
        if shared.state_map.current().is_none() {
            tracing::info!("waiting for the state list before dispatching events");
            if wait_for_state_map(&shared).await.is_none() {
                return;
            }
        }

        let queued = tokio::select! {
            queued = queue.recv() => queued,
            _ = shared.shutdown_requested() => None,
        };
        let Some(queued) = queued else {
            return;
        };

        let map = shared.state_map.current().unwrap_or_default();
        if dispatch(&shared, &map, queued).await.is_err() {
            return;
        }
    }
}

async fn dispatch(shared: &Shared, map: &StateMap, queued: QueuedEvent) -> Result<(), Interrupted> {
    let QueuedEvent { job, event } = queued;
    let Some(state_id) = map.resolve(&event.state).map(str::to_string) else {
        tracing::warn!(
            job = %job,
            state = %event.state,
            known_states = map.len(),
            "unresolved state, dropping event"
        );
        return Ok(());
    };
    let duration = event.effective_duration(shared.settings.default_duration);
    tracing::info!(
        job = %job,
        state = %event.state,
        state_id = %state_id,
        ?duration,
        revert = event.revert,
        "handling event from queue"
    );

    if event.revert {
        send_until_delivered(shared, job, Request::Push(state_id.clone())).await?;
        if !shared.sleep_unless_shutdown(duration).await {
            tracing::warn!(
                job = %job,
                state_id = %state_id,
                "shutdown during revert, avatar left in pushed state"
            );
            return Err(Interrupted);
        }
        send_until_delivered(shared, job, Request::Pop(state_id)).await
    } else {
        send_until_delivered(shared, job, Request::Set(state_id)).await?;
        if shared.sleep_unless_shutdown(duration).await {
            Ok(())
        } else {
            Err(Interrupted)
        }
    }
}

/// Retries one step of the current event until the socket takes it.
/// Recovering the socket is the read loop's job.
async fn send_until_delivered(shared: &Shared, job: Uuid, request: Request) -> Result<(), Interrupted> {
    let mut failures = 0u32;
    loop {
        if shared.is_shutting_down() {
            return Err(Interrupted);
        }
        match shared.send(&request).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                failures += 1;
                tracing::warn!(
                    job = %job,
                    op = request.op(),
                    state_id = ?request.state_id(),
                    failures,
                    error = %err,
                    "failed to write to veadotube websocket, retrying"
                );
                if !shared.sleep_unless_shutdown(SEND_RETRY_INTERVAL).await {
                    return Err(Interrupted);
                }
            }
        }
    }
}
