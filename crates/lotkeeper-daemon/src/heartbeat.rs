//! Heartbeat task probing connected gateways.
//!
//! Dead connections are not hunted proactively: a failed probe drops the
//! registration, and the facility's next verification attempt simply
//! finds no connection and takes the fallback path.

use tracing::{info, warn};

use lotkeeper_proto::Heartbeat;

use crate::registry::ConnectionRegistry;

/// Spawn the heartbeat loop. Sends a no-op probe to every connected
/// gateway on a fixed interval; a failed write deregisters the
/// connection.
pub fn spawn_heartbeat_task(
    registry: ConnectionRegistry,
    interval: std::time::Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    for facility_id in registry.connected_facilities().await {
                        let Some(conn) = registry.get(facility_id).await else {
                            continue;
                        };
                        if let Err(e) = conn.send(&Heartbeat::new()).await {
                            warn!(facility_id, error = %e, "Heartbeat write failed; dropping connection");
                            registry.unregister(&conn).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Heartbeat task shutting down");
                    return;
                }
            }
        }
    })
}
