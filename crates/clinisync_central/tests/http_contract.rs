//! Wire-level tests of the central endpoints.

use chrono::{TimeZone, Utc};
use clinisync_central::{CentralConfig, CentralServer};
use clinisync_protocol::{
    Operation, PullRequest, PullResponse, PushItem, PushRequest, PushResponse, SyncId,
};
use serde_json::{json, Value};

fn push_body(node: &str, id: &str, data: Value, minutes: i64, force: bool) -> Vec<u8> {
    PushRequest::new(
        node,
        PushItem {
            sync_id: SyncId::new(),
            operation: Operation::Update,
            collection: "patients".into(),
            document_id: id.into(),
            data: Some(data),
            changed_fields: vec!["name".into()],
            changed_at: Utc.timestamp_opt(1_700_000_000 + minutes * 60, 0).unwrap(),
            force,
        },
    )
    .encode()
    .unwrap()
}

fn pull(server: &CentralServer, node: &str, since: Option<chrono::DateTime<Utc>>) -> PullResponse {
    let body = PullRequest::new(node, since, 2).encode().unwrap();
    let (status, body) = server.handle_http("POST", "/sync/pull", &body);
    assert_eq!(status, 200);
    PullResponse::decode(&body).unwrap()
}

#[test]
fn pages_through_other_nodes_changes() {
    let server = CentralServer::new(CentralConfig::default());
    for i in 0..5 {
        let body = push_body("clinic-2", &format!("p{i}"), json!({"name": i}), i, false);
        assert_eq!(server.handle_http("POST", "/sync/push", &body).0, 200);
    }

    let mut since = None;
    let mut seen = Vec::new();
    loop {
        let page = pull(&server, "clinic-1", since);
        seen.extend(page.changes.iter().map(|c| c.document_id.clone()));
        since = Some(page.timestamp);
        if !page.has_more {
            break;
        }
    }
    assert_eq!(seen, vec!["p0", "p1", "p2", "p3", "p4"]);
    assert!(pull(&server, "clinic-1", since).changes.is_empty());
}

#[test]
fn forced_push_overrides_conflict() {
    let server = CentralServer::new(CentralConfig::default());
    let newer = push_body("clinic-2", "p1", json!({"name": "newer"}), 10, false);
    server.handle_http("POST", "/sync/push", &newer);

    let stale = push_body("clinic-1", "p1", json!({"name": "stale"}), 5, false);
    let (status, body) = server.handle_http("POST", "/sync/push", &stale);
    assert_eq!(status, 409);
    assert!(PushResponse::decode(&body).unwrap().is_conflict());

    let forced = push_body("clinic-1", "p1", json!({"name": "stale"}), 5, true);
    let (status, body) = server.handle_http("POST", "/sync/push", &forced);
    assert_eq!(status, 200);
    assert!(PushResponse::decode(&body).unwrap().accepted);
    assert_eq!(server.document("patients", "p1"), Some(json!({"name": "stale"})));
}

#[test]
fn retried_push_is_recorded_once() {
    let server = CentralServer::new(CentralConfig::default());
    let body = push_body("clinic-1", "p1", json!({"name": "Amina"}), 1, false);

    for _ in 0..3 {
        assert_eq!(server.handle_http("POST", "/sync/push", &body).0, 200);
    }
    assert_eq!(server.change_count(), 1);
}

#[test]
fn offline_central_answers_unavailable() {
    let server = CentralServer::new(CentralConfig::default());
    server.set_available(false);

    assert_eq!(server.handle_http("GET", "/sync/health", b"").0, 503);
    let body = push_body("clinic-1", "p1", json!({}), 1, false);
    assert_eq!(server.handle_http("POST", "/sync/push", &body).0, 503);
    assert_eq!(server.change_count(), 0);
}
