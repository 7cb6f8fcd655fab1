//! Full-scan reconciliation.
//!
//! A gateway periodically reports the plate it currently reads at every
//! spot. Reconciliation computes the minimal set of departures,
//! relocations, and new arrivals that makes stored occupancy agree with
//! the scan, then applies the whole set in one transaction.
//!
//! Planning is pure and operates on a snapshot taken at the start of the
//! pass; phases run in strict order (departures, relocations, arrivals)
//! so no intermediate state ever shows two vehicles on one spot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lotkeeper_core::db::unix_timestamp;
use lotkeeper_core::plate::{self, StoredPlate};
use lotkeeper_proto::{CarEntry, ScanReport, ScanSummary};

use crate::notify::{Notification, Notifier};
use crate::storage::queries::{close_occupancy_tx, insert_occupancy_tx, relocate_batch_tx};
use crate::storage::{Database, DatabaseError, NewOccupancy, OccupancyRow, VehicleClass};

/// Plate recorded when the camera sees a vehicle it cannot read.
pub const UNRECOGNIZED_PLATE: &str = "미인식";

/// One planned new-arrival insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub spot_id: i64,
    pub plate: String,
    /// Plate fuzzy-matches a registered vehicle the store believed absent;
    /// an administrator is told, but no automated correction happens.
    pub flagged: bool,
}

/// The mutations one scan requires, in application order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    /// Occupancy record ids to close into history.
    pub departures: Vec<i64>,
    /// `(record id, new spot)` moves.
    pub relocations: Vec<(i64, i64)>,
    pub arrivals: Vec<Arrival>,
    pub skipped: u32,
}

impl ScanPlan {
    pub fn is_empty(&self) -> bool {
        self.departures.is_empty() && self.relocations.is_empty() && self.arrivals.is_empty()
    }
}

/// Compute the plan for one scan against a snapshot of live occupancy.
///
/// Scan entries on unknown spots are skipped. An empty plate at an
/// occupied spot protects the record there (the camera sees *something*
/// it cannot read); an empty plate at a free spot becomes an
/// unrecognized arrival.
pub fn plan_scan(
    stored: &[OccupancyRow],
    scan: &[CarEntry],
    known_spots: &HashSet<i64>,
    registered: &[String],
) -> ScanPlan {
    let mut plan = ScanPlan::default();

    let occupant_of: HashMap<i64, &OccupancyRow> =
        stored.iter().map(|row| (row.spot_id, row)).collect();

    // One entry per spot; duplicates are gateway noise.
    let mut entries: Vec<&CarEntry> = Vec::new();
    let mut seen_spots = HashSet::new();
    for entry in scan {
        if !known_spots.contains(&entry.surface_id) {
            debug!(spot_id = entry.surface_id, "Scan entry for unknown spot skipped");
            plan.skipped += 1;
            continue;
        }
        if !seen_spots.insert(entry.surface_id) {
            plan.skipped += 1;
            continue;
        }
        entries.push(entry);
    }
    entries.sort_by_key(|e| e.surface_id);

    // Match readable scan entries one-to-one against stored records.
    let mut claims: HashMap<i64, i64> = HashMap::new(); // record -> new spot
    let mut protected: HashSet<i64> = HashSet::new(); // records behind unreadable plates
    let mut unmatched: Vec<&CarEntry> = Vec::new();
    for entry in &entries {
        if entry.car_no.is_empty() {
            match occupant_of.get(&entry.surface_id) {
                Some(row) => {
                    protected.insert(row.id);
                }
                None => unmatched.push(entry),
            }
            continue;
        }
        let candidates: Vec<StoredPlate<'_>> = stored
            .iter()
            .filter(|row| !claims.contains_key(&row.id))
            .map(|row| StoredPlate { record_id: row.id, spot_id: row.spot_id, plate: &row.plate })
            .collect();
        match plate::best_match(&entry.car_no, entry.surface_id, &candidates) {
            Some(found) => {
                claims.insert(found.record_id, entry.surface_id);
            }
            None => unmatched.push(entry),
        }
    }

    // Phase 1: stored vehicles whose plate appears nowhere in the scan
    // have left.
    let scanned_plates: Vec<&str> =
        entries.iter().filter(|e| !e.car_no.is_empty()).map(|e| e.car_no.as_str()).collect();
    let mut departing: HashSet<i64> = HashSet::new();
    for row in stored {
        if claims.contains_key(&row.id) || protected.contains(&row.id) {
            continue;
        }
        if !plate::fuzzy_member(&row.plate, scanned_plates.iter().copied()) {
            departing.insert(row.id);
        }
    }

    // Phase 2: claimed records seen at a different spot move there, but
    // only onto spots vacated within this batch or already free. Skipping
    // one move can invalidate another that counted on its vacated spot,
    // so filter to a fixpoint.
    let mut relocations: Vec<(i64, i64, i64)> = stored
        .iter()
        .filter_map(|row| {
            claims.get(&row.id).and_then(|&to| {
                (to != row.spot_id).then_some((row.id, row.spot_id, to))
            })
        })
        .collect();
    relocations.sort_by_key(|&(record_id, _, _)| record_id);
    loop {
        let moving: HashSet<i64> = relocations.iter().map(|&(record_id, _, _)| record_id).collect();
        let feasible = |&(_, _, to): &(i64, i64, i64)| match occupant_of.get(&to) {
            None => true,
            Some(occupant) => departing.contains(&occupant.id) || moving.contains(&occupant.id),
        };
        let before = relocations.len();
        relocations.retain(feasible);
        if relocations.len() == before {
            break;
        }
    }
    let planned_moves: HashSet<i64> = relocations.iter().map(|&(record_id, _, _)| record_id).collect();
    for row in stored {
        if claims.get(&row.id).is_some_and(|&to| to != row.spot_id)
            && !planned_moves.contains(&row.id)
        {
            debug!(record_id = row.id, "Relocation target still occupied; skipped");
            plan.skipped += 1;
        }
    }

    // Phase 3: unabsorbed scan entries are new arrivals, onto spots left
    // genuinely free by phases 1-2.
    let moved_records: HashSet<i64> = planned_moves;
    let mut filled: HashSet<i64> = relocations.iter().map(|&(_, _, to)| to).collect();
    for entry in unmatched {
        let free = match occupant_of.get(&entry.surface_id) {
            None => !filled.contains(&entry.surface_id),
            Some(occupant) => {
                (departing.contains(&occupant.id) || moved_records.contains(&occupant.id))
                    && !filled.contains(&entry.surface_id)
            }
        };
        if !free {
            debug!(spot_id = entry.surface_id, "Arrival onto occupied spot skipped");
            plan.skipped += 1;
            continue;
        }
        filled.insert(entry.surface_id);
        let plate_string = if entry.car_no.is_empty() {
            UNRECOGNIZED_PLATE.to_string()
        } else {
            entry.car_no.clone()
        };
        let flagged =
            !entry.car_no.is_empty() && plate::fuzzy_member(&entry.car_no, registered.iter().map(String::as_str));
        plan.arrivals.push(Arrival { spot_id: entry.surface_id, plate: plate_string, flagged });
    }

    plan.departures = departing.into_iter().collect();
    plan.departures.sort_unstable();
    plan.relocations = relocations.into_iter().map(|(record_id, _, to)| (record_id, to)).collect();
    plan
}

/// Applies scan reports, one facility at a time.
#[derive(Clone)]
pub struct Reconciler {
    db: Database,
    notifier: Arc<dyn Notifier>,
    // Single-flight per facility; passes for different facilities run in
    // parallel.
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl Reconciler {
    pub fn new(db: Database, notifier: Arc<dyn Notifier>) -> Self {
        Self { db, notifier, locks: Arc::new(Mutex::new(HashMap::new())) }
    }

    async fn facility_lock(&self, facility_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(facility_id).or_default())
    }

    /// Reconcile one scan report. The whole pass commits atomically.
    pub async fn reconcile(&self, report: &ScanReport) -> Result<ScanSummary, DatabaseError> {
        let facility_id = self
            .db
            .facility_for_device(report.park_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("device {}", report.park_id)))?;

        let lock = self.facility_lock(facility_id).await;
        let _guard = lock.lock().await;

        // Snapshot; planning never touches the database again.
        let stored = self.db.live_occupancy_for_facility(facility_id).await?;
        let known_spots: HashSet<i64> = self.db.spot_ids(facility_id).await?.into_iter().collect();
        let registered = self.db.registered_plates(facility_id).await?;

        let plan = plan_scan(&stored, &report.cars, &known_spots, &registered);
        let summary = ScanSummary {
            departed: u32::try_from(plan.departures.len()).unwrap_or(u32::MAX),
            relocated: u32::try_from(plan.relocations.len()).unwrap_or(u32::MAX),
            newly_parked: u32::try_from(plan.arrivals.len()).unwrap_or(u32::MAX),
            skipped: plan.skipped,
        };
        if plan.is_empty() {
            debug!(facility_id, skipped = plan.skipped, "Scan matches stored occupancy");
            return Ok(summary);
        }

        let admin = self.db.admin_user(facility_id).await?;
        self.apply(facility_id, &stored, &plan, admin).await?;

        info!(
            facility_id,
            departed = summary.departed,
            relocated = summary.relocated,
            newly_parked = summary.newly_parked,
            skipped = summary.skipped,
            "Reconciliation applied"
        );

        if let Some(admin) = admin {
            for arrival in &plan.arrivals {
                let (title, body) = if arrival.flagged {
                    (
                        "Registered vehicle detected",
                        format!(
                            "Scan found registered plate {} at spot {} with no prior entry",
                            arrival.plate, arrival.spot_id
                        ),
                    )
                } else {
                    (
                        "Unrecognized vehicle parked",
                        format!("Scan found plate {} at spot {}", arrival.plate, arrival.spot_id),
                    )
                };
                self.notifier.notify(Notification {
                    user_id: admin,
                    facility_id,
                    title: title.to_string(),
                    body,
                });
            }
        }

        Ok(summary)
    }

    async fn apply(
        &self,
        facility_id: i64,
        stored: &[OccupancyRow],
        plan: &ScanPlan,
        admin: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let by_id: HashMap<i64, &OccupancyRow> = stored.iter().map(|row| (row.id, row)).collect();
        let now = unix_timestamp();

        let mut tx = self.db.pool().begin().await?;
        for record_id in &plan.departures {
            let Some(row) = by_id.get(record_id) else {
                warn!(record_id, "Planned departure vanished from snapshot");
                continue;
            };
            if !close_occupancy_tx(&mut tx, row, now, true).await? {
                warn!(record_id, "Planned departure was already closed; skipped");
            }
        }
        relocate_batch_tx(&mut tx, &plan.relocations).await?;
        for arrival in &plan.arrivals {
            insert_occupancy_tx(
                &mut tx,
                &NewOccupancy {
                    spot_id: arrival.spot_id,
                    facility_id,
                    vehicle_id: None,
                    plate: arrival.plate.clone(),
                    vehicle_class: VehicleClass::Unregistered.as_str(),
                    entered_at: now,
                    depart_start_at: None,
                    depart_end_at: None,
                    auto_entry: true,
                    owner_id: admin.unwrap_or_default(),
                },
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
