use std::sync::Arc;
use std::time::Duration;

use lotkeeper_core::config::VerificationConfig;
use lotkeeper_proto::{CarEntry, EntryReport, ExitReport};

use crate::notify::testing::RecordingNotifier;
use crate::registry::{ConnectionRegistry, FacilityConnection};
use crate::storage::{Database, RequestMethod};

use super::{Coordinator, EntryAttempt, ExitAttempt};

struct Harness {
    coordinator: Coordinator,
    db: Database,
    registry: ConnectionRegistry,
    notifier: Arc<RecordingNotifier>,
    facility: i64,
    spots: Vec<i64>,
}

async fn harness(spot_count: usize, timeout_secs: u64) -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let facility = db.create_facility("lot").await.unwrap();
    db.create_device(900, facility).await.unwrap();
    let mut spots = Vec::new();
    for i in 0..spot_count {
        spots.push(db.create_spot(facility, "standard", &format!("A-{i}")).await.unwrap());
    }
    let registry = ConnectionRegistry::new();
    let notifier = RecordingNotifier::new();
    let config = VerificationConfig {
        request_timeout_secs: timeout_secs,
        heartbeat_interval_secs: 30,
        camera_verification_enabled: true,
        notify_webhook: None,
    };
    let coordinator = Coordinator::new(
        db.clone(),
        registry.clone(),
        Arc::clone(&notifier) as Arc<dyn crate::notify::Notifier>,
        config,
    );
    Harness { coordinator, db, registry, notifier, facility, spots }
}

impl Harness {
    async fn connect(&self) -> (Arc<FacilityConnection>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(16 * 1024);
        let conn = Arc::new(FacilityConnection::new(self.facility, 900, Box::new(local)));
        self.registry.register(Arc::clone(&conn)).await;
        (conn, remote)
    }

    fn auto_entry(&self, vehicle_id: i64, plate: &str, spot: Option<i64>) -> EntryAttempt {
        EntryAttempt {
            facility_id: self.facility,
            vehicle_id: Some(vehicle_id),
            plate: plate.to_string(),
            requested_spot: spot,
            method: RequestMethod::Auto,
            requested_by: vehicle_id,
            depart_start_at: None,
            depart_end_at: None,
        }
    }

    async fn wait_terminal(&self, request_id: i64) -> String {
        for _ in 0..400 {
            let status = self.db.request_status(request_id).await.unwrap();
            if status != "PENDING" {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request {request_id} never resolved");
    }
}

fn car(surface_id: i64, plate: &str) -> CarEntry {
    CarEntry { surface_id, car_no: plate.to_string() }
}

#[tokio::test]
async fn auto_entry_without_gateway_uses_fallback() {
    let h = harness(2, 3600).await;
    let request = h
        .coordinator
        .begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0])))
        .await
        .unwrap();

    assert_eq!(h.wait_terminal(request.id).await, "COMPLETE");
    let live = h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().unwrap();
    assert_eq!(live.plate, "12가3456");
    assert_eq!(h.notifier.sent().len(), 1);
    assert_eq!(h.notifier.sent()[0].title, "Parking confirmed");
}

#[tokio::test]
async fn fallback_moves_to_first_free_when_requested_spot_taken() {
    let h = harness(2, 3600).await;
    let first = h.coordinator.begin_entry(h.auto_entry(1, "11가1111", Some(h.spots[0]))).await.unwrap();
    h.wait_terminal(first.id).await;

    let second = h.coordinator.begin_entry(h.auto_entry(2, "22나2222", Some(h.spots[0]))).await.unwrap();
    assert_eq!(h.wait_terminal(second.id).await, "COMPLETE");
    let live = h.db.live_occupancy_at_spot(h.spots[1]).await.unwrap().unwrap();
    assert_eq!(live.plate, "22나2222");
}

#[tokio::test]
async fn fallback_with_no_free_spot_ends_full() {
    let h = harness(1, 3600).await;
    let first = h.coordinator.begin_entry(h.auto_entry(1, "11가1111", None)).await.unwrap();
    assert_eq!(h.wait_terminal(first.id).await, "COMPLETE");

    let second = h.coordinator.begin_entry(h.auto_entry(2, "22나2222", None)).await.unwrap();
    assert_eq!(h.wait_terminal(second.id).await, "FULL");
    assert_eq!(h.db.live_occupancy_for_facility(h.facility).await.unwrap().len(), 1);
}

#[tokio::test]
async fn camera_match_parks_at_reported_spot() {
    let h = harness(3, 3600).await;
    let (conn, _remote) = h.connect().await;

    let request = h
        .coordinator
        .begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0])))
        .await
        .unwrap();
    assert!(request.is_pending());

    // Camera saw the vehicle at a different spot than requested.
    let report = EntryReport {
        event_seq: 1,
        request_seq: 0,
        car_list: vec![car(h.spots[2], "99허3456")],
    };
    h.coordinator.handle_entry_report(&conn, report).await;

    assert_eq!(h.wait_terminal(request.id).await, "COMPLETE");
    assert!(h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().is_none());
    let live = h.db.live_occupancy_at_spot(h.spots[2]).await.unwrap().unwrap();
    assert_eq!(live.plate, "12가3456");
}

#[tokio::test]
async fn same_vehicle_already_parked_completes_without_duplicate() {
    let h = harness(2, 3600).await;
    let (conn, _remote) = h.connect().await;

    let first = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    let report = EntryReport { event_seq: 1, request_seq: 0, car_list: vec![car(h.spots[0], "12가3456")] };
    h.coordinator.handle_entry_report(&conn, report).await;
    assert_eq!(h.wait_terminal(first.id).await, "COMPLETE");
    let notified_before = h.notifier.sent().len();

    // Same vehicle tries again; camera reports it where it already is.
    let second = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    let report = EntryReport { event_seq: 2, request_seq: 0, car_list: vec![car(h.spots[0], "12가3456")] };
    h.coordinator.handle_entry_report(&conn, report).await;

    assert_eq!(h.wait_terminal(second.id).await, "COMPLETE");
    assert_eq!(h.db.live_occupancy_for_facility(h.facility).await.unwrap().len(), 1);
    // Idempotent completion sends no second notification.
    assert_eq!(h.notifier.sent().len(), notified_before);
}

#[tokio::test]
async fn reported_spot_held_by_another_vehicle_ends_full() {
    let h = harness(1, 3600).await;
    let (conn, _remote) = h.connect().await;

    let first = h.coordinator.begin_entry(h.auto_entry(9, "99허9999", Some(h.spots[0]))).await.unwrap();
    let report = EntryReport { event_seq: 1, request_seq: 0, car_list: vec![car(h.spots[0], "99허9999")] };
    h.coordinator.handle_entry_report(&conn, report).await;
    h.wait_terminal(first.id).await;

    let second = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    let report = EntryReport { event_seq: 2, request_seq: 0, car_list: vec![car(h.spots[0], "12가3456")] };
    h.coordinator.handle_entry_report(&conn, report).await;

    assert_eq!(h.wait_terminal(second.id).await, "FULL");
    assert_eq!(h.db.live_occupancy_for_facility(h.facility).await.unwrap().len(), 1);
}

#[tokio::test]
async fn no_match_report_falls_back_to_requested_spot() {
    let h = harness(2, 3600).await;
    let (conn, _remote) = h.connect().await;

    let request = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[1]))).await.unwrap();
    let report = EntryReport { event_seq: 1, request_seq: 0, car_list: vec![car(h.spots[0], "55도1111")] };
    h.coordinator.handle_entry_report(&conn, report).await;

    assert_eq!(h.wait_terminal(request.id).await, "COMPLETE");
    assert!(h.db.live_occupancy_at_spot(h.spots[1]).await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_reply_is_dropped() {
    let h = harness(3, 3600).await;
    let (conn, _remote) = h.connect().await;

    let request = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    let report = EntryReport { event_seq: 1, request_seq: 0, car_list: vec![car(h.spots[1], "12가3456")] };
    h.coordinator.handle_entry_report(&conn, report).await;
    assert_eq!(h.wait_terminal(request.id).await, "COMPLETE");

    // Replaying the reply with a different spot must change nothing.
    let replay = EntryReport { event_seq: 1, request_seq: 0, car_list: vec![car(h.spots[2], "12가3456")] };
    h.coordinator.handle_entry_report(&conn, replay).await;

    assert_eq!(h.db.live_occupancy_for_facility(h.facility).await.unwrap().len(), 1);
    assert!(h.db.live_occupancy_at_spot(h.spots[1]).await.unwrap().is_some());
}

#[tokio::test]
async fn entry_check_timeout_triggers_fallback() {
    let h = harness(1, 0).await;
    let (conn, _remote) = h.connect().await;

    let request = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    assert_eq!(h.wait_terminal(request.id).await, "COMPLETE");
    assert!(h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().is_some());

    // The timer consumed the pending entry; a late reply is a no-op.
    assert!(conn.take_pending(1).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_timeout_never_strands_a_request() {
    let h = harness(4, 0).await;
    let (_conn, _remote) = h.connect().await;

    // The timer runs on another worker and can fire before the check is
    // even written; every request must still reach a terminal status.
    for i in 0..4i64 {
        let request = h
            .coordinator
            .begin_entry(h.auto_entry(i + 1, &format!("1{i}가111{i}"), None))
            .await
            .unwrap();
        assert_eq!(h.wait_terminal(request.id).await, "COMPLETE");
    }
}

#[tokio::test]
async fn exit_report_absent_closes_the_record() {
    let h = harness(1, 3600).await;
    let (conn, _remote) = h.connect().await;

    let entry = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    let report = EntryReport { event_seq: 1, request_seq: 0, car_list: vec![car(h.spots[0], "12가3456")] };
    h.coordinator.handle_entry_report(&conn, report).await;
    h.wait_terminal(entry.id).await;

    let exit = h
        .coordinator
        .begin_exit(ExitAttempt {
            facility_id: h.facility,
            spot_id: h.spots[0],
            method: RequestMethod::Auto,
            requested_by: 1,
        })
        .await
        .unwrap();
    h.coordinator
        .handle_exit_report(&conn, ExitReport { event_seq: 2, is_present: Some(false) })
        .await;

    assert_eq!(h.wait_terminal(exit.id).await, "COMPLETE");
    assert!(h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().is_none());
    assert_eq!(h.db.history_count(h.facility).await.unwrap(), 1);
}

#[tokio::test]
async fn exit_report_present_rejects_the_exit() {
    let h = harness(1, 3600).await;
    let (conn, _remote) = h.connect().await;

    let entry = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    let report = EntryReport { event_seq: 1, request_seq: 0, car_list: vec![car(h.spots[0], "12가3456")] };
    h.coordinator.handle_entry_report(&conn, report).await;
    h.wait_terminal(entry.id).await;
    let notified_before = h.notifier.sent().len();

    let exit = h
        .coordinator
        .begin_exit(ExitAttempt {
            facility_id: h.facility,
            spot_id: h.spots[0],
            method: RequestMethod::Auto,
            requested_by: 1,
        })
        .await
        .unwrap();
    h.coordinator
        .handle_exit_report(&conn, ExitReport { event_seq: 2, is_present: Some(true) })
        .await;

    assert_eq!(h.wait_terminal(exit.id).await, "FAIL");
    // Record stays open; no notification for a rejected exit.
    assert!(h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().is_some());
    assert_eq!(h.notifier.sent().len(), notified_before);
}

#[tokio::test]
async fn malformed_exit_report_fails_the_request() {
    let h = harness(1, 3600).await;
    let (conn, _remote) = h.connect().await;

    let entry = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    let report = EntryReport { event_seq: 1, request_seq: 0, car_list: vec![car(h.spots[0], "12가3456")] };
    h.coordinator.handle_entry_report(&conn, report).await;
    h.wait_terminal(entry.id).await;

    let exit = h
        .coordinator
        .begin_exit(ExitAttempt {
            facility_id: h.facility,
            spot_id: h.spots[0],
            method: RequestMethod::Auto,
            requested_by: 1,
        })
        .await
        .unwrap();
    h.coordinator
        .handle_exit_report(&conn, ExitReport { event_seq: 2, is_present: None })
        .await;

    assert_eq!(h.wait_terminal(exit.id).await, "FAIL");
    assert!(h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().is_some());
}

#[tokio::test]
async fn exit_timeout_closes_optimistically() {
    let h = harness(1, 0).await;
    let (_conn, _remote) = h.connect().await;

    let entry = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    h.wait_terminal(entry.id).await;

    let exit = h
        .coordinator
        .begin_exit(ExitAttempt {
            facility_id: h.facility,
            spot_id: h.spots[0],
            method: RequestMethod::Auto,
            requested_by: 1,
        })
        .await
        .unwrap();

    assert_eq!(h.wait_terminal(exit.id).await, "COMPLETE");
    assert!(h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().is_none());
}

#[tokio::test]
async fn manual_entry_notifies_immediately_then_verifies_silently() {
    let h = harness(2, 3600).await;
    let (conn, _remote) = h.connect().await;

    let request = h
        .coordinator
        .begin_entry(EntryAttempt {
            facility_id: h.facility,
            vehicle_id: Some(1),
            plate: "12가3456".to_string(),
            requested_spot: Some(h.spots[0]),
            method: RequestMethod::Manual,
            requested_by: 1,
            depart_start_at: None,
            depart_end_at: None,
        })
        .await
        .unwrap();

    // The occupancy and its notification happened synchronously.
    assert!(h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().is_some());
    assert_eq!(h.notifier.sent().len(), 1);
    assert_eq!(h.notifier.sent()[0].title, "Parking recorded");

    // Camera saw the vehicle at another (free) spot: correct the record.
    let report = EntryReport { event_seq: 1, request_seq: 0, car_list: vec![car(h.spots[1], "12가3456")] };
    h.coordinator.handle_entry_report(&conn, report).await;

    assert_eq!(h.wait_terminal(request.id).await, "COMPLETE");
    assert!(h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().is_none());
    assert!(h.db.live_occupancy_at_spot(h.spots[1]).await.unwrap().is_some());
    // Verification never re-notifies.
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn manual_exit_closes_synchronously_and_survives_timeout() {
    let h = harness(1, 0).await;
    let (_conn, _remote) = h.connect().await;

    let entry = h.coordinator.begin_entry(h.auto_entry(1, "12가3456", Some(h.spots[0]))).await.unwrap();
    h.wait_terminal(entry.id).await;
    let notified_before = h.notifier.sent().len();

    let exit = h
        .coordinator
        .begin_exit(ExitAttempt {
            facility_id: h.facility,
            spot_id: h.spots[0],
            method: RequestMethod::Manual,
            requested_by: 1,
        })
        .await
        .unwrap();

    // Closed at request time, notified once, and the verification timeout
    // resolves COMPLETE without re-notifying.
    assert!(h.db.live_occupancy_at_spot(h.spots[0]).await.unwrap().is_none());
    assert_eq!(h.wait_terminal(exit.id).await, "COMPLETE");
    assert_eq!(h.notifier.sent().len(), notified_before + 1);
    assert_eq!(h.notifier.sent()[notified_before].title, "Exit recorded");
}

#[tokio::test]
async fn racing_entries_for_one_spot_yield_one_complete_one_full() {
    let h = harness(1, 3600).await;

    let first = h
        .db
        .create_verification_request(&crate::storage::NewVerificationRequest {
            facility_id: h.facility,
            vehicle_id: Some(1),
            plate: "11가1111".to_string(),
            spot_id: Some(h.spots[0]),
            kind: "entry",
            method: "auto",
            occupancy_id: None,
            requested_by: 1,
        })
        .await
        .unwrap();
    let second = h
        .db
        .create_verification_request(&crate::storage::NewVerificationRequest {
            facility_id: h.facility,
            vehicle_id: Some(2),
            plate: "22나2222".to_string(),
            spot_id: Some(h.spots[0]),
            kind: "entry",
            method: "auto",
            occupancy_id: None,
            requested_by: 2,
        })
        .await
        .unwrap();

    // Both believed the spot was free; the unique live-spot index decides.
    h.coordinator.park_at(&first, h.spots[0]).await;
    h.coordinator.park_at(&second, h.spots[0]).await;

    let statuses = [
        h.db.request_status(first.id).await.unwrap(),
        h.db.request_status(second.id).await.unwrap(),
    ];
    assert!(statuses.contains(&"COMPLETE".to_string()));
    assert!(statuses.contains(&"FULL".to_string()));
    assert_eq!(h.db.live_occupancy_for_facility(h.facility).await.unwrap().len(), 1);
}
