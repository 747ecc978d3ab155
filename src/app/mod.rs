use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use veadotube_bridge::bindings::{self, EventBinding};
use veadotube_bridge::config::Config;
use veadotube_bridge::connection::{ConnectionError, VeadotubeConnection};
use veadotube_bridge::model::TriggerEvent;

const STATE_LIST_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let command = std::env::args().nth(1);
    if command.as_deref() == Some("config-init") {
        return handle_config_init();
    }

    let config = Config::load()?;
    if command.as_deref() == Some("states") {
        return handle_states(&config).await;
    }
    if let Some(other) = command {
        return Err(format!("unknown command: {other}").into());
    }

    let connection = VeadotubeConnection::new(config.veadotube.connection_settings()?);
    tracing::info!(
        uri = %connection.settings().uri,
        bindings = config.bindings.len(),
        "starting veadotube bridge"
    );

    let result = tokio::select! {
        res = serve(&connection, &config.bindings) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            Ok(())
        }
    };
    connection.close().await;
    result
}

async fn serve(
    connection: &VeadotubeConnection,
    bindings: &[EventBinding],
) -> Result<(), Box<dyn std::error::Error>> {
    connection.open().await?;
    tokio::select! {
        res = relay_triggers(connection, bindings) => res,
        err = connection.terminated() => Err(err.into()),
    }
}

/// Reads one JSON trigger per stdin line. After EOF the queue keeps
/// draining until shutdown.
async fn relay_triggers(
    connection: &VeadotubeConnection,
    bindings: &[EventBinding],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<TriggerEvent>(line) {
            Ok(trigger) => {
                route_trigger(connection, bindings, &trigger)?;
            }
            Err(err) => {
                tracing::warn!(error = %err, line, "ignoring malformed trigger");
            }
        }
    }
    tracing::info!("trigger input closed, still serving queued events");
    std::future::pending::<()>().await;
    Ok(())
}

fn route_trigger(
    connection: &VeadotubeConnection,
    bindings: &[EventBinding],
    trigger: &TriggerEvent,
) -> Result<usize, ConnectionError> {
    let mut queued = 0;
    for state in bindings::resolve(bindings, trigger) {
        connection.enqueue(state.clone())?;
        tracing::info!(
            trigger = %trigger.event,
            source = ?trigger.source,
            state = %state.state,
            "queued state change for trigger"
        );
        queued += 1;
    }
    if queued == 0 {
        tracing::debug!(trigger = %trigger.event, "no binding for trigger");
    }
    Ok(queued)
}

async fn handle_states(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let connection = VeadotubeConnection::new(config.veadotube.connection_settings()?);
    connection.open().await?;
    let map = tokio::time::timeout(STATE_LIST_TIMEOUT, connection.state_map_ready()).await;
    connection.close().await;

    let map = match map {
        Ok(Some(map)) => map,
        Ok(None) => return Err("connection closed before the state list arrived".into()),
        Err(_) => return Err("timed out waiting for the state list".into()),
    };
    for (name, id) in map.entries() {
        println!("{name}\t{id}");
    }
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use veadotube_bridge::connection::ConnectionSettings;

    fn trigger(event: &str, name: Option<&str>) -> TriggerEvent {
        TriggerEvent {
            event: event.to_string(),
            source: Some("viewer".to_string()),
            name: name.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn routes_triggers_to_matching_bindings() {
        let config = Config::example();
        let connection =
            VeadotubeConnection::new(ConnectionSettings::new("ws://127.0.0.1:1?n=test"));

        assert_eq!(
            route_trigger(&connection, &config.bindings, &trigger("follow", None)).unwrap(),
            1
        );
        assert_eq!(
            route_trigger(
                &connection,
                &config.bindings,
                &trigger("channel_point_redeem", Some("Be shy"))
            )
            .unwrap(),
            1
        );
        assert_eq!(
            route_trigger(
                &connection,
                &config.bindings,
                &trigger("channel_point_redeem", Some("Other"))
            )
            .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn routing_after_close_reports_closed_queue() {
        let config = Config::example();
        let connection =
            VeadotubeConnection::new(ConnectionSettings::new("ws://127.0.0.1:1?n=test"));
        connection.close().await;

        assert_eq!(
            route_trigger(&connection, &config.bindings, &trigger("sub", None)),
            Err(ConnectionError::QueueClosed)
        );
    }
}
