//! Database queries for the Lotkeeper daemon.

use lotkeeper_core::db::{is_unique_violation, unix_timestamp};
use lotkeeper_proto::CameraInfo;

use super::db::{Database, DatabaseError};
use super::models::{OccupancyRow, SpotRow, VerificationRequest};

/// Parameters for inserting an occupancy record.
#[derive(Debug, Clone)]
pub struct NewOccupancy {
    pub spot_id: i64,
    pub facility_id: i64,
    pub vehicle_id: Option<i64>,
    pub plate: String,
    pub vehicle_class: &'static str,
    pub entered_at: i64,
    pub depart_start_at: Option<i64>,
    pub depart_end_at: Option<i64>,
    pub auto_entry: bool,
    pub owner_id: i64,
}

/// Parameters for creating a verification request.
#[derive(Debug, Clone)]
pub struct NewVerificationRequest {
    pub facility_id: i64,
    pub vehicle_id: Option<i64>,
    pub plate: String,
    pub spot_id: Option<i64>,
    pub kind: &'static str,
    pub method: &'static str,
    pub occupancy_id: Option<i64>,
    pub requested_by: i64,
}

impl Database {
    // =========================================================================
    // Facility / device queries
    // =========================================================================

    /// Create a facility, returning its id.
    pub async fn create_facility(&self, name: &str) -> Result<i64, DatabaseError> {
        let result = sqlx::query("INSERT INTO facilities (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Register a gateway device for a facility.
    pub async fn create_device(&self, device_id: i64, facility_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO devices (id, facility_id, created_at) VALUES (?, ?, ?)")
            .bind(device_id)
            .bind(facility_id)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Resolve the facility a device belongs to. `None` for unknown devices.
    pub async fn facility_for_device(&self, device_id: i64) -> Result<Option<i64>, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT facility_id FROM devices WHERE id = ?")
                .bind(device_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|r| r.0))
    }

    /// A facility has camera coverage when a gateway device is registered.
    pub async fn has_camera_coverage(&self, facility_id: i64) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM devices WHERE facility_id = ? LIMIT 1")
                .bind(facility_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.is_some())
    }

    /// Replace the stored camera inventory for a device with the list the
    /// gateway sent in its authentication handshake.
    pub async fn replace_cameras(
        &self,
        device_id: i64,
        cameras: &[CameraInfo],
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM cameras WHERE device_id = ?")
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
        for camera in cameras {
            sqlx::query("INSERT INTO cameras (device_id, camera_id, camera_ip) VALUES (?, ?, ?)")
                .bind(device_id)
                .bind(camera.camera_id)
                .bind(&camera.camera_ip)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// First administrator of a facility, used as the recipient of
    /// reconciliation notifications and owner of unrecognized arrivals.
    pub async fn admin_user(&self, facility_id: i64) -> Result<Option<i64>, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT user_id FROM facility_admins WHERE facility_id = ? ORDER BY user_id LIMIT 1",
        )
        .bind(facility_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn add_admin(&self, facility_id: i64, user_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO facility_admins (facility_id, user_id) VALUES (?, ?)")
            .bind(facility_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn register_vehicle(&self, facility_id: i64, plate: &str) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO registered_vehicles (facility_id, plate) VALUES (?, ?)")
            .bind(facility_id)
            .bind(plate)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// All plates registered to a facility.
    pub async fn registered_plates(&self, facility_id: i64) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT plate FROM registered_vehicles WHERE facility_id = ?")
                .bind(facility_id)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    // =========================================================================
    // Spot queries
    // =========================================================================

    pub async fn create_spot(
        &self,
        facility_id: i64,
        category: &str,
        name: &str,
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query("INSERT INTO spots (facility_id, category, name) VALUES (?, ?, ?)")
            .bind(facility_id)
            .bind(category)
            .bind(name)
            .execute(self.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_spot(&self, spot_id: i64) -> Result<Option<SpotRow>, DatabaseError> {
        let spot = sqlx::query_as::<_, SpotRow>("SELECT * FROM spots WHERE id = ?")
            .bind(spot_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(spot)
    }

    /// All spot ids belonging to a facility.
    pub async fn spot_ids(&self, facility_id: i64) -> Result<Vec<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM spots WHERE facility_id = ?")
            .bind(facility_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Lowest-id parkable spot with no live occupancy.
    pub async fn first_free_spot(&self, facility_id: i64) -> Result<Option<SpotRow>, DatabaseError> {
        let spot = sqlx::query_as::<_, SpotRow>(
            "SELECT * FROM spots
             WHERE facility_id = ?
               AND category IN ('standard', 'accessible')
               AND id NOT IN (SELECT spot_id FROM occupancy WHERE departed_at IS NULL)
             ORDER BY id LIMIT 1",
        )
        .bind(facility_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(spot)
    }

    // =========================================================================
    // Occupancy queries
    // =========================================================================

    /// Insert a live occupancy record.
    ///
    /// Returns `Conflict` when the spot already holds a live record (the
    /// partial unique index fires), which callers surface as FULL.
    pub async fn insert_occupancy(&self, new: &NewOccupancy) -> Result<i64, DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            "INSERT INTO occupancy
               (spot_id, facility_id, vehicle_id, plate, vehicle_class, entered_at,
                depart_start_at, depart_end_at, auto_entry, owner_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.spot_id)
        .bind(new.facility_id)
        .bind(new.vehicle_id)
        .bind(&new.plate)
        .bind(new.vehicle_class)
        .bind(if new.entered_at > 0 { new.entered_at } else { now })
        .bind(new.depart_start_at)
        .bind(new.depart_end_at)
        .bind(i64::from(new.auto_entry))
        .bind(new.owner_id)
        .execute(self.pool())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DatabaseError::Conflict(format!("spot {} already occupied", new.spot_id))
            } else {
                e.into()
            }
        })?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_occupancy(&self, id: i64) -> Result<OccupancyRow, DatabaseError> {
        sqlx::query_as::<_, OccupancyRow>("SELECT * FROM occupancy WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("occupancy {id}")))
    }

    /// Live record at a spot, if any.
    pub async fn live_occupancy_at_spot(
        &self,
        spot_id: i64,
    ) -> Result<Option<OccupancyRow>, DatabaseError> {
        let row = sqlx::query_as::<_, OccupancyRow>(
            "SELECT * FROM occupancy WHERE spot_id = ? AND departed_at IS NULL",
        )
        .bind(spot_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// All live records for a facility, ordered by record id.
    pub async fn live_occupancy_for_facility(
        &self,
        facility_id: i64,
    ) -> Result<Vec<OccupancyRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, OccupancyRow>(
            "SELECT * FROM occupancy WHERE facility_id = ? AND departed_at IS NULL ORDER BY id",
        )
        .bind(facility_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Close a live occupancy record into history.
    pub async fn close_occupancy(&self, id: i64, auto_exit: bool) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query_as::<_, OccupancyRow>(
            "SELECT * FROM occupancy WHERE id = ? AND departed_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("live occupancy {id}")))?;

        if !close_occupancy_tx(&mut tx, &row, unix_timestamp(), auto_exit).await? {
            return Err(DatabaseError::NotFound(format!("live occupancy {id}")));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Move a live record to a different spot (camera-driven correction).
    pub async fn relocate_occupancy(&self, id: i64, new_spot: i64) -> Result<(), DatabaseError> {
        let result =
            sqlx::query("UPDATE occupancy SET spot_id = ? WHERE id = ? AND departed_at IS NULL")
                .bind(new_spot)
                .bind(id)
                .execute(self.pool())
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        DatabaseError::Conflict(format!("spot {new_spot} already occupied"))
                    } else {
                        e.into()
                    }
                })?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("live occupancy {id}")));
        }
        Ok(())
    }

    /// Number of closed stays recorded for a facility.
    pub async fn history_count(&self, facility_id: i64) -> Result<i64, DatabaseError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM occupancy_history WHERE facility_id = ?")
                .bind(facility_id)
                .fetch_one(self.pool())
                .await?;
        Ok(row.0)
    }

    // =========================================================================
    // Verification request queries
    // =========================================================================

    /// Create a verification request.
    ///
    /// Rejects duplicates: at most one PENDING request per (facility,
    /// vehicle, kind) for entry, or per (spot, kind) for exit.
    pub async fn create_verification_request(
        &self,
        new: &NewVerificationRequest,
    ) -> Result<VerificationRequest, DatabaseError> {
        let duplicate: Option<(i64,)> = if new.kind == "exit" {
            sqlx::query_as(
                "SELECT id FROM verification_requests
                 WHERE spot_id = ? AND kind = ? AND status = 'PENDING' LIMIT 1",
            )
            .bind(new.spot_id)
            .bind(new.kind)
            .fetch_optional(self.pool())
            .await?
        } else {
            sqlx::query_as(
                "SELECT id FROM verification_requests
                 WHERE facility_id = ? AND vehicle_id IS ? AND kind = ? AND status = 'PENDING'
                 LIMIT 1",
            )
            .bind(new.facility_id)
            .bind(new.vehicle_id)
            .bind(new.kind)
            .fetch_optional(self.pool())
            .await?
        };
        if duplicate.is_some() {
            return Err(DatabaseError::Conflict(format!(
                "a PENDING {} request already exists",
                new.kind
            )));
        }

        let now = unix_timestamp();
        let result = sqlx::query(
            "INSERT INTO verification_requests
               (facility_id, vehicle_id, plate, spot_id, kind, method, status,
                occupancy_id, requested_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'PENDING', ?, ?, ?, ?)",
        )
        .bind(new.facility_id)
        .bind(new.vehicle_id)
        .bind(&new.plate)
        .bind(new.spot_id)
        .bind(new.kind)
        .bind(new.method)
        .bind(new.occupancy_id)
        .bind(new.requested_by)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_verification_request(result.last_insert_rowid()).await
    }

    pub async fn get_verification_request(
        &self,
        id: i64,
    ) -> Result<VerificationRequest, DatabaseError> {
        sqlx::query_as::<_, VerificationRequest>(
            "SELECT * FROM verification_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("verification request {id}")))
    }

    /// Status lookup for external pollers.
    pub async fn request_status(&self, id: i64) -> Result<String, DatabaseError> {
        Ok(self.get_verification_request(id).await?.status)
    }

    /// Move a request out of PENDING into a terminal status.
    ///
    /// Returns `false` when the request was already terminal; terminal
    /// states are never overwritten.
    pub async fn finish_request(&self, id: i64, status: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE verification_requests
             SET status = ?, updated_at = ?
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(status)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// As [`Self::finish_request`], also linking the occupancy record an
    /// automatic entry produced.
    pub async fn finish_request_with_occupancy(
        &self,
        id: i64,
        status: &str,
        occupancy_id: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE verification_requests
             SET status = ?, occupancy_id = ?, updated_at = ?
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(status)
        .bind(occupancy_id)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Transaction-scoped helpers (reconciliation applies its whole plan in one
// transaction; these take the open connection instead of the pool)
// =============================================================================

/// Close a live record and archive it into history.
///
/// Returns `false` without touching history when the record is no longer
/// live. The caller's `row` may come from a snapshot taken before the
/// transaction; a stale close must not archive the stay a second time.
pub async fn close_occupancy_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    row: &OccupancyRow,
    departed_at: i64,
    auto_exit: bool,
) -> Result<bool, DatabaseError> {
    let result =
        sqlx::query("UPDATE occupancy SET departed_at = ? WHERE id = ? AND departed_at IS NULL")
            .bind(departed_at)
            .bind(row.id)
            .execute(&mut **tx)
            .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO occupancy_history
           (facility_id, spot_id, vehicle_id, plate, vehicle_class, entered_at,
            departed_at, depart_start_at, depart_end_at, auto_entry, auto_exit, owner_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(row.facility_id)
    .bind(row.spot_id)
    .bind(row.vehicle_id)
    .bind(&row.plate)
    .bind(&row.vehicle_class)
    .bind(row.entered_at)
    .bind(departed_at)
    .bind(row.depart_start_at)
    .bind(row.depart_end_at)
    .bind(row.auto_entry)
    .bind(i64::from(auto_exit))
    .bind(row.owner_id)
    .execute(&mut **tx)
    .await?;
    Ok(true)
}

/// Relocate a batch of live records within an open transaction.
///
/// Two passes: every moving record is first lifted out of the live-spot
/// unique index, then dropped onto its new spot. Swaps and rotations
/// within the batch would otherwise trip the index mid-flight.
pub async fn relocate_batch_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    moves: &[(i64, i64)],
) -> Result<(), DatabaseError> {
    for &(id, _) in moves {
        sqlx::query("UPDATE occupancy SET departed_at = -1 WHERE id = ? AND departed_at IS NULL")
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }
    for &(id, new_spot) in moves {
        sqlx::query("UPDATE occupancy SET spot_id = ?, departed_at = NULL WHERE id = ? AND departed_at = -1")
            .bind(new_spot)
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Insert a live record within an open transaction.
pub async fn insert_occupancy_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    new: &NewOccupancy,
) -> Result<i64, DatabaseError> {
    let result = sqlx::query(
        "INSERT INTO occupancy
           (spot_id, facility_id, vehicle_id, plate, vehicle_class, entered_at,
            depart_start_at, depart_end_at, auto_entry, owner_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.spot_id)
    .bind(new.facility_id)
    .bind(new.vehicle_id)
    .bind(&new.plate)
    .bind(new.vehicle_class)
    .bind(new.entered_at)
    .bind(new.depart_start_at)
    .bind(new.depart_end_at)
    .bind(i64::from(new.auto_entry))
    .bind(new.owner_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}
