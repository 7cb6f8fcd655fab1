//! Verification request coordination.
//!
//! One [`Coordinator`] drives every park/leave attempt: it creates the
//! persisted verification request, decides between the camera path and
//! the fallback path, correlates gateway replies with outstanding checks,
//! and applies the resulting occupancy mutation.
//!
//! A request resolves exactly once. The pending-map entry on the gateway
//! connection is the token of ownership: the reply handler and the
//! timeout task both try to claim it with [`FacilityConnection::take_pending`],
//! and only the winner acts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use lotkeeper_core::config::VerificationConfig;
use lotkeeper_core::db::unix_timestamp;
use lotkeeper_core::plate;
use lotkeeper_proto::{EntryAck, EntryCheck, EntryReport, ExitCheck, ExitReport};

use crate::notify::{Notification, Notifier};
use crate::registry::{ConnectionRegistry, FacilityConnection, InFlight};
use crate::storage::{
    Database, DatabaseError, NewOccupancy, NewVerificationRequest, OccupancyRow, RequestKind,
    RequestMethod, RequestStatus, VehicleClass, VerificationRequest,
};
use crate::storage::models::NotifyPolicy;

/// A park attempt as submitted by the caller.
#[derive(Debug, Clone)]
pub struct EntryAttempt {
    pub facility_id: i64,
    pub vehicle_id: Option<i64>,
    pub plate: String,
    /// Spot the caller asked for, if any. Manual attempts must name one.
    pub requested_spot: Option<i64>,
    pub method: RequestMethod,
    pub requested_by: i64,
    pub depart_start_at: Option<i64>,
    pub depart_end_at: Option<i64>,
}

/// A leave attempt as submitted by the caller.
#[derive(Debug, Clone)]
pub struct ExitAttempt {
    pub facility_id: i64,
    pub spot_id: i64,
    pub method: RequestMethod,
    pub requested_by: i64,
}

/// Drives verification requests end to end.
#[derive(Clone)]
pub struct Coordinator {
    db: Database,
    registry: ConnectionRegistry,
    notifier: Arc<dyn Notifier>,
    config: VerificationConfig,
}

impl Coordinator {
    pub fn new(
        db: Database,
        registry: ConnectionRegistry,
        notifier: Arc<dyn Notifier>,
        config: VerificationConfig,
    ) -> Self {
        Self { db, registry, notifier, config }
    }

    // =========================================================================
    // Attempt creation
    // =========================================================================

    /// Begin a park attempt. Returns the created verification request; its
    /// terminal status arrives asynchronously.
    pub async fn begin_entry(
        &self,
        attempt: EntryAttempt,
    ) -> Result<VerificationRequest, DatabaseError> {
        let mut occupancy_id = None;
        if attempt.method == RequestMethod::Manual {
            // Manual attempts mutate occupancy synchronously; the camera
            // check afterwards only corrects the spot.
            let spot_id = attempt.requested_spot.ok_or_else(|| {
                DatabaseError::Query("manual entry requires a spot".to_string())
            })?;
            let id = self
                .db
                .insert_occupancy(&NewOccupancy {
                    spot_id,
                    facility_id: attempt.facility_id,
                    vehicle_id: attempt.vehicle_id,
                    plate: attempt.plate.clone(),
                    vehicle_class: class_for(attempt.vehicle_id).as_str(),
                    entered_at: unix_timestamp(),
                    depart_start_at: attempt.depart_start_at,
                    depart_end_at: attempt.depart_end_at,
                    auto_entry: false,
                    owner_id: attempt.requested_by,
                })
                .await?;
            occupancy_id = Some(id);
            self.notifier.notify(Notification {
                user_id: attempt.requested_by,
                facility_id: attempt.facility_id,
                title: "Parking recorded".to_string(),
                body: format!("Vehicle {} parked at spot {spot_id}", attempt.plate),
            });
        }

        let request = self
            .db
            .create_verification_request(&NewVerificationRequest {
                facility_id: attempt.facility_id,
                vehicle_id: attempt.vehicle_id,
                plate: attempt.plate.clone(),
                spot_id: attempt.requested_spot,
                kind: RequestKind::Entry.as_str(),
                method: attempt.method.as_str(),
                occupancy_id,
                requested_by: attempt.requested_by,
            })
            .await?;

        match self.camera_path(attempt.facility_id).await {
            Some(conn) => self.send_entry_check(&conn, &request).await,
            None => self.entry_fallback(request.id).await,
        }
        Ok(request)
    }

    /// Begin a leave attempt for whatever is parked at the given spot.
    pub async fn begin_exit(
        &self,
        attempt: ExitAttempt,
    ) -> Result<VerificationRequest, DatabaseError> {
        let occupancy = self
            .db
            .live_occupancy_at_spot(attempt.spot_id)
            .await?
            .ok_or_else(|| {
                DatabaseError::NotFound(format!("no vehicle at spot {}", attempt.spot_id))
            })?;

        let request = self
            .db
            .create_verification_request(&NewVerificationRequest {
                facility_id: attempt.facility_id,
                vehicle_id: occupancy.vehicle_id,
                plate: occupancy.plate.clone(),
                spot_id: Some(attempt.spot_id),
                kind: RequestKind::Exit.as_str(),
                method: attempt.method.as_str(),
                occupancy_id: Some(occupancy.id),
                requested_by: attempt.requested_by,
            })
            .await?;

        if attempt.method == RequestMethod::Manual {
            if let Err(e) = self.db.close_occupancy(occupancy.id, false).await {
                self.finish(&request, RequestStatus::Fail).await;
                return Err(e);
            }
            self.notifier.notify(Notification {
                user_id: attempt.requested_by,
                facility_id: attempt.facility_id,
                title: "Exit recorded".to_string(),
                body: format!("Vehicle {} left spot {}", occupancy.plate, attempt.spot_id),
            });
        }

        match self.camera_path(attempt.facility_id).await {
            Some(conn) => self.send_exit_check(&conn, &request).await,
            None => self.exit_fallback(request.id).await,
        }
        Ok(request)
    }

    /// Camera verification path for a facility, when the master switch is
    /// on, the facility has coverage, and a gateway is connected.
    async fn camera_path(&self, facility_id: i64) -> Option<Arc<FacilityConnection>> {
        if !self.config.camera_verification_enabled {
            return None;
        }
        match self.db.has_camera_coverage(facility_id).await {
            Ok(true) => self.registry.get(facility_id).await,
            Ok(false) => None,
            Err(e) => {
                warn!(facility_id, error = %e, "Coverage lookup failed; using fallback");
                None
            }
        }
    }

    // =========================================================================
    // Outbound checks
    // =========================================================================

    async fn send_entry_check(&self, conn: &Arc<FacilityConnection>, request: &VerificationRequest) {
        let seq = conn.next_seq();
        self.arm_timeout(conn, seq, request.id, RequestKind::Entry).await;

        let check = EntryCheck::new(conn.device_id, seq);
        if let Err(e) = conn.send(&check).await {
            warn!(facility_id = conn.facility_id, seq, error = %e, "Entry-check send failed");
            self.abandon_and_fall_back(conn, seq).await;
        } else {
            debug!(facility_id = conn.facility_id, seq, request_id = request.id, "Entry-check sent");
        }
    }

    async fn send_exit_check(&self, conn: &Arc<FacilityConnection>, request: &VerificationRequest) {
        let seq = conn.next_seq();
        self.arm_timeout(conn, seq, request.id, RequestKind::Exit).await;

        let surface_id = request.spot_id.unwrap_or_default();
        let check = ExitCheck::new(conn.device_id, seq, surface_id);
        if let Err(e) = conn.send(&check).await {
            warn!(facility_id = conn.facility_id, seq, error = %e, "Exit-check send failed");
            self.abandon_and_fall_back(conn, seq).await;
        } else {
            debug!(facility_id = conn.facility_id, seq, request_id = request.id, "Exit-check sent");
        }
    }

    /// Insert the pending entry and start its timeout task.
    ///
    /// Armed before the check is written so a fast reply always finds the
    /// entry in the map.
    async fn arm_timeout(
        &self,
        conn: &Arc<FacilityConnection>,
        seq: u64,
        request_id: i64,
        kind: RequestKind,
    ) {
        let coordinator = self.clone();
        let timer_conn = Arc::clone(conn);
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let timer = tokio::spawn(async move {
            // The clock starts only once the pending entry is in the map;
            // a zero timeout firing earlier would find nothing to claim and
            // leave the entry unresolvable.
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(timeout).await;
            // Claiming the entry decides the reply-vs-timeout race.
            if let Some(entry) = timer_conn.take_pending(seq).await {
                info!(
                    facility_id = timer_conn.facility_id,
                    seq,
                    request_id = entry.request_id,
                    "Verification check timed out; falling back"
                );
                match entry.kind {
                    RequestKind::Entry => coordinator.entry_fallback(entry.request_id).await,
                    RequestKind::Exit => coordinator.exit_fallback(entry.request_id).await,
                }
            }
        });
        conn.insert_pending(seq, InFlight { request_id, kind, timer }).await;
        let _ = armed_tx.send(());
    }

    /// Send failed: reclaim the pending entry, drop the dead connection,
    /// and resolve the request through its fallback.
    async fn abandon_and_fall_back(&self, conn: &Arc<FacilityConnection>, seq: u64) {
        self.registry.unregister(conn).await;
        if let Some(entry) = conn.take_pending(seq).await {
            entry.timer.abort();
            match entry.kind {
                RequestKind::Entry => self.entry_fallback(entry.request_id).await,
                RequestKind::Exit => self.exit_fallback(entry.request_id).await,
            }
        }
    }

    // =========================================================================
    // Inbound replies
    // =========================================================================

    /// Handle a `cmd:3` entry-check result from the gateway.
    pub async fn handle_entry_report(&self, conn: &Arc<FacilityConnection>, report: EntryReport) {
        // Ack regardless of whether the reply is still wanted.
        let ack = EntryAck::new(report.event_seq, report.request_seq, conn.device_id);
        if let Err(e) = conn.send(&ack).await {
            warn!(facility_id = conn.facility_id, error = %e, "Entry ack send failed");
        }

        let Some(entry) = conn.take_pending(report.event_seq).await else {
            debug!(
                facility_id = conn.facility_id,
                seq = report.event_seq,
                "Stale or duplicate entry report dropped"
            );
            return;
        };
        entry.timer.abort();
        if entry.kind != RequestKind::Entry {
            warn!(
                facility_id = conn.facility_id,
                seq = report.event_seq,
                "Entry report answered a non-entry check; using fallback"
            );
            self.exit_fallback(entry.request_id).await;
            return;
        }

        let request = match self.db.get_verification_request(entry.request_id).await {
            Ok(request) if request.is_pending() => request,
            Ok(_) => return,
            Err(e) => {
                warn!(request_id = entry.request_id, error = %e, "Request load failed");
                return;
            }
        };

        let matched = report
            .car_list
            .iter()
            .find(|car| plate::report_matches_request(&request.plate, &car.car_no));
        match matched {
            Some(car) => self.apply_entry_match(&request, car.surface_id).await,
            None => {
                debug!(request_id = request.id, "Gateway reported no plate match; falling back");
                self.entry_fallback(request.id).await;
            }
        }
    }

    /// Handle a `cmd:6` exit-check result from the gateway.
    pub async fn handle_exit_report(&self, conn: &Arc<FacilityConnection>, report: ExitReport) {
        let Some(entry) = conn.take_pending(report.event_seq).await else {
            debug!(
                facility_id = conn.facility_id,
                seq = report.event_seq,
                "Stale or duplicate exit report dropped"
            );
            return;
        };
        entry.timer.abort();
        if entry.kind != RequestKind::Exit {
            warn!(
                facility_id = conn.facility_id,
                seq = report.event_seq,
                "Exit report answered a non-exit check; using fallback"
            );
            self.entry_fallback(entry.request_id).await;
            return;
        }

        let request = match self.db.get_verification_request(entry.request_id).await {
            Ok(request) if request.is_pending() => request,
            Ok(_) => return,
            Err(e) => {
                warn!(request_id = entry.request_id, error = %e, "Request load failed");
                return;
            }
        };

        match report.is_present {
            Some(false) => match request.method() {
                RequestMethod::Auto => self.close_and_complete(&request).await,
                // Manual exits already closed the record at request time.
                RequestMethod::Manual => self.finish(&request, RequestStatus::Complete).await,
            },
            Some(true) => {
                info!(request_id = request.id, "Gateway reports vehicle still present; exit rejected");
                self.finish(&request, RequestStatus::Fail).await;
            }
            None => {
                warn!(request_id = request.id, "Malformed exit report");
                self.finish(&request, RequestStatus::Fail).await;
            }
        }
    }

    /// Gateway confirmed the vehicle at `spot_id`; apply the entry outcome.
    async fn apply_entry_match(&self, request: &VerificationRequest, spot_id: i64) {
        let live = match self.db.live_occupancy_at_spot(spot_id).await {
            Ok(live) => live,
            Err(e) => {
                warn!(request_id = request.id, error = %e, "Occupancy lookup failed");
                self.finish(request, RequestStatus::Fail).await;
                return;
            }
        };

        if request.method() == RequestMethod::Manual {
            self.correct_manual_spot(request, spot_id, live.as_ref()).await;
            return;
        }

        match live {
            None => self.park_at(request, spot_id).await,
            Some(occupancy)
                if request.vehicle_id.is_some() && occupancy.vehicle_id == request.vehicle_id =>
            {
                // Already satisfied; complete silently.
                debug!(request_id = request.id, spot_id, "Vehicle already parked at reported spot");
                self.finish(request, RequestStatus::Complete).await;
            }
            Some(occupancy) => {
                info!(
                    request_id = request.id,
                    spot_id,
                    occupant = occupancy.id,
                    "Reported spot holds another vehicle"
                );
                self.finish(request, RequestStatus::Full).await;
            }
        }
    }

    /// Manual entry: the record already exists; the camera's reply only
    /// corrects the recorded spot. Never notifies.
    async fn correct_manual_spot(
        &self,
        request: &VerificationRequest,
        seen_spot: i64,
        live_at_seen: Option<&OccupancyRow>,
    ) {
        let Some(occupancy_id) = request.occupancy_id else {
            warn!(request_id = request.id, "Manual request lost its occupancy link");
            self.finish(request, RequestStatus::Fail).await;
            return;
        };

        match live_at_seen {
            Some(occupancy) if occupancy.id == occupancy_id => {
                self.finish(request, RequestStatus::Complete).await;
            }
            Some(_) => {
                info!(
                    request_id = request.id,
                    seen_spot, "Camera disagrees but the seen spot is occupied; leaving as recorded"
                );
                self.finish(request, RequestStatus::Fail).await;
            }
            None => match self.db.relocate_occupancy(occupancy_id, seen_spot).await {
                Ok(()) => {
                    info!(request_id = request.id, seen_spot, "Recorded spot corrected from camera");
                    self.finish(request, RequestStatus::Complete).await;
                }
                Err(e) => {
                    warn!(request_id = request.id, error = %e, "Spot correction failed");
                    self.finish(request, RequestStatus::Fail).await;
                }
            },
        }
    }

    // =========================================================================
    // Fallback paths
    // =========================================================================

    /// Resolve an entry request without camera confirmation.
    pub async fn entry_fallback(&self, request_id: i64) {
        let request = match self.db.get_verification_request(request_id).await {
            Ok(request) if request.is_pending() => request,
            Ok(_) => return,
            Err(e) => {
                warn!(request_id, error = %e, "Request load failed in fallback");
                return;
            }
        };

        match request.method() {
            // The manual record exists; verification simply ends.
            RequestMethod::Manual => self.finish(&request, RequestStatus::Complete).await,
            RequestMethod::Auto => self.assign_fallback_spot(&request).await,
        }
    }

    /// Resolve an exit request without camera confirmation: optimistic
    /// close for automatic exits.
    pub async fn exit_fallback(&self, request_id: i64) {
        let request = match self.db.get_verification_request(request_id).await {
            Ok(request) if request.is_pending() => request,
            Ok(_) => return,
            Err(e) => {
                warn!(request_id, error = %e, "Request load failed in fallback");
                return;
            }
        };

        match request.method() {
            RequestMethod::Manual => self.finish(&request, RequestStatus::Complete).await,
            RequestMethod::Auto => self.close_and_complete(&request).await,
        }
    }

    /// Pick a spot for an unconfirmed automatic entry: the requested spot
    /// if it is parkable and free, else the first free spot, else FULL.
    async fn assign_fallback_spot(&self, request: &VerificationRequest) {
        let spot = match self.pick_spot(request).await {
            Ok(spot) => spot,
            Err(e) => {
                warn!(request_id = request.id, error = %e, "Spot lookup failed");
                self.finish(request, RequestStatus::Fail).await;
                return;
            }
        };
        let Some(spot_id) = spot else {
            info!(request_id = request.id, "No free spot available");
            self.finish(request, RequestStatus::Full).await;
            return;
        };
        self.park_at(request, spot_id).await;
    }

    async fn pick_spot(&self, request: &VerificationRequest) -> Result<Option<i64>, DatabaseError> {
        if let Some(requested) = request.spot_id
            && let Some(spot) = self.db.get_spot(requested).await?
            && spot.is_parkable()
            && self.db.live_occupancy_at_spot(requested).await?.is_none()
        {
            return Ok(Some(requested));
        }
        Ok(self.db.first_free_spot(request.facility_id).await?.map(|s| s.id))
    }

    /// Create the occupancy record and complete the request. A racing
    /// insert on the same spot surfaces as a conflict and ends FULL.
    async fn park_at(&self, request: &VerificationRequest, spot_id: i64) {
        let new = NewOccupancy {
            spot_id,
            facility_id: request.facility_id,
            vehicle_id: request.vehicle_id,
            plate: request.plate.clone(),
            vehicle_class: class_for(request.vehicle_id).as_str(),
            entered_at: unix_timestamp(),
            depart_start_at: None,
            depart_end_at: None,
            auto_entry: true,
            owner_id: request.requested_by,
        };
        match self.db.insert_occupancy(&new).await {
            Ok(occupancy_id) => {
                match self
                    .db
                    .finish_request_with_occupancy(
                        request.id,
                        RequestStatus::Complete.as_str(),
                        occupancy_id,
                    )
                    .await
                {
                    Ok(true) => {
                        info!(request_id = request.id, spot_id, "Entry complete");
                        self.notify_outcome(
                            request,
                            "Parking confirmed",
                            format!("Vehicle {} parked at spot {spot_id}", request.plate),
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(request_id = request.id, error = %e, "Status update failed");
                    }
                }
            }
            Err(DatabaseError::Conflict(_)) => {
                info!(request_id = request.id, spot_id, "Lost the race for the spot");
                self.finish(request, RequestStatus::Full).await;
            }
            Err(e) => {
                warn!(request_id = request.id, error = %e, "Occupancy insert failed");
                self.finish(request, RequestStatus::Fail).await;
            }
        }
    }

    /// Close the linked occupancy record and complete an exit request.
    async fn close_and_complete(&self, request: &VerificationRequest) {
        let Some(occupancy_id) = request.occupancy_id else {
            warn!(request_id = request.id, "Exit request lost its occupancy link");
            self.finish(request, RequestStatus::Fail).await;
            return;
        };
        match self.db.close_occupancy(occupancy_id, true).await {
            Ok(()) => {
                self.finish(request, RequestStatus::Complete).await;
                self.notify_outcome(
                    request,
                    "Exit confirmed",
                    format!("Vehicle {} left spot {}", request.plate, request.spot_id.unwrap_or_default()),
                );
            }
            Err(e) => {
                warn!(request_id = request.id, error = %e, "Occupancy close failed");
                self.finish(request, RequestStatus::Fail).await;
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn finish(&self, request: &VerificationRequest, status: RequestStatus) {
        match self.db.finish_request(request.id, status.as_str()).await {
            Ok(true) => info!(request_id = request.id, status = %status, "Request resolved"),
            Ok(false) => debug!(request_id = request.id, "Request already terminal"),
            Err(e) => warn!(request_id = request.id, error = %e, "Status update failed"),
        }
    }

    fn notify_outcome(&self, request: &VerificationRequest, title: &str, body: String) {
        if request.method().notify_policy() == NotifyPolicy::NotifyOnOutcome {
            self.notifier.notify(Notification {
                user_id: request.requested_by,
                facility_id: request.facility_id,
                title: title.to_string(),
                body,
            });
        }
    }
}

const fn class_for(vehicle_id: Option<i64>) -> VehicleClass {
    match vehicle_id {
        Some(_) => VehicleClass::Registered,
        None => VehicleClass::Visitor,
    }
}

#[cfg(test)]
mod tests;
