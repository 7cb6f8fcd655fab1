//! TCP listeners: the gateway protocol and the full-scan channel.
//!
//! Gateway connections are long-lived: one authentication handshake,
//! then an inbound dispatch loop processed strictly in arrival order.
//! Scan submissions use a separate short-lived connection carrying one
//! request/response exchange.

use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use lotkeeper_proto::codec::{read_frame, write_message};
use lotkeeper_proto::{
    AuthAck, AuthRequest, ClientMessage, ScanReport, AUTH_ACCEPTED, AUTH_UNKNOWN_DEVICE,
};

use crate::reconcile::Reconciler;
use crate::registry::{ConnectionRegistry, FacilityConnection};
use crate::storage::Database;
use crate::verify::Coordinator;

/// Accept loop for the gateway protocol port.
pub async fn run_gateway_listener(
    listener: TcpListener,
    db: Database,
    registry: ConnectionRegistry,
    coordinator: Coordinator,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Gateway connection accepted");
                let db = db.clone();
                let registry = registry.clone();
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    handle_gateway(stream, db, registry, coordinator).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
            }
        }
    }
}

/// Drive one gateway connection: authenticate, then dispatch until the
/// transport dies.
async fn handle_gateway(
    stream: TcpStream,
    db: Database,
    registry: ConnectionRegistry,
    coordinator: Coordinator,
) {
    let (mut reader, writer) = stream.into_split();

    let Some(conn) = authenticate(&mut reader, writer, &db).await else {
        return;
    };
    registry.register(Arc::clone(&conn)).await;

    loop {
        let payload = match read_frame(&mut reader).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(facility_id = conn.facility_id, error = %e, "Gateway connection closed");
                break;
            }
        };
        match ClientMessage::decode(&payload) {
            Ok(ClientMessage::Entry(report)) => {
                coordinator.handle_entry_report(&conn, report).await;
            }
            Ok(ClientMessage::Exit(report)) => {
                coordinator.handle_exit_report(&conn, report).await;
            }
            Ok(ClientMessage::Auth(auth)) => {
                // Gateways occasionally re-handshake on a live connection.
                if auth.park_id == conn.device_id {
                    refresh_auth(&conn, &db, &auth).await;
                } else {
                    warn!(
                        facility_id = conn.facility_id,
                        park_id = auth.park_id,
                        "Re-authentication with a different device id; closing"
                    );
                    break;
                }
            }
            Err(e) => {
                // Malformed payload inside a valid frame: log and move on.
                warn!(facility_id = conn.facility_id, error = %e, "Undecodable gateway message skipped");
            }
        }
    }

    // Only evicts if this connection is still the current one. Pending
    // timers keep running so their requests still fall back.
    registry.unregister(&conn).await;
}

/// Read frames until a valid authentication arrives, then answer it.
/// Returns `None` when the device is unknown or the transport fails.
async fn authenticate(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    mut writer: OwnedWriteHalf,
    db: &Database,
) -> Option<Arc<FacilityConnection>> {
    loop {
        let payload = match read_frame(reader).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "Connection closed before authentication");
                return None;
            }
        };
        let auth = match ClientMessage::decode(&payload) {
            Ok(ClientMessage::Auth(auth)) => auth,
            Ok(other) => {
                warn!(?other, "Message before authentication ignored");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Undecodable pre-auth message skipped");
                continue;
            }
        };

        let facility_id = match db.facility_for_device(auth.park_id).await {
            Ok(Some(facility_id)) => facility_id,
            Ok(None) => {
                info!(park_id = auth.park_id, "Unknown device; rejecting");
                let ack = AuthAck::new(auth.request_seq, auth.park_id, AUTH_UNKNOWN_DEVICE);
                let _ = write_message(&mut writer, &ack).await;
                return None;
            }
            Err(e) => {
                warn!(park_id = auth.park_id, error = %e, "Device lookup failed");
                return None;
            }
        };

        let conn = Arc::new(FacilityConnection::new(facility_id, auth.park_id, Box::new(writer)));
        let ack = AuthAck::new(auth.request_seq, auth.park_id, AUTH_ACCEPTED);
        if let Err(e) = conn.send(&ack).await {
            warn!(facility_id, error = %e, "Auth ack write failed");
            return None;
        }
        if let Err(e) = db.replace_cameras(auth.park_id, &auth.camera_list).await {
            warn!(facility_id, error = %e, "Camera inventory update failed");
        }
        info!(facility_id, park_id = auth.park_id, cameras = auth.camera_list.len(), "Gateway authenticated");
        return Some(conn);
    }
}

/// Re-acknowledge an in-place handshake and refresh the camera list.
async fn refresh_auth(conn: &Arc<FacilityConnection>, db: &Database, auth: &AuthRequest) {
    let ack = AuthAck::new(auth.request_seq, auth.park_id, AUTH_ACCEPTED);
    if let Err(e) = conn.send(&ack).await {
        warn!(facility_id = conn.facility_id, error = %e, "Auth re-ack write failed");
        return;
    }
    if let Err(e) = db.replace_cameras(auth.park_id, &auth.camera_list).await {
        warn!(facility_id = conn.facility_id, error = %e, "Camera inventory update failed");
    }
}

/// Accept loop for the scan port: one framed request, one framed
/// summary, then the connection closes.
pub async fn run_scan_listener(listener: TcpListener, reconciler: Reconciler) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Scan connection accepted");
                let reconciler = reconciler.clone();
                tokio::spawn(async move {
                    handle_scan(stream, reconciler).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
            }
        }
    }
}

async fn handle_scan(mut stream: TcpStream, reconciler: Reconciler) {
    let payload = match read_frame(&mut stream).await {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "Scan connection closed before a report arrived");
            return;
        }
    };
    let report: ScanReport = match serde_json::from_slice(&payload) {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Malformed scan report dropped");
            return;
        }
    };
    match reconciler.reconcile(&report).await {
        Ok(summary) => {
            if let Err(e) = write_message(&mut stream, &summary).await {
                debug!(error = %e, "Scan summary write failed");
            }
        }
        Err(e) => {
            warn!(park_id = report.park_id, error = %e, "Reconciliation failed");
        }
    }
}
