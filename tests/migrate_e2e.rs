//! End-to-end migration driver tests against a stub remote endpoint.
//!
//! The stub is a real axum server on an ephemeral port recording every
//! request body it receives, so these tests exercise the full path:
//! record walk, filtering, message building, dedup, HTTP delivery.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::put;
use axum::Router;
use mdmshift::{
    build_authenticate, digest, encode, DeliveryClient, DeviceRecord, Ledger, Migrator, PushInfo,
    RecordSource, SelectionFilter, StoreError, UserRecord,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// In-memory record source; the redb adapter has its own tests.
#[derive(Default)]
struct MemorySource {
    devices: Vec<DeviceRecord>,
    users: Vec<UserRecord>,
    push: HashMap<String, PushInfo>,
}

impl RecordSource for MemorySource {
    fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.devices.clone())
    }

    fn users(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.users.clone())
    }

    fn device_by_udid(&self, udid: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices.iter().find(|d| d.udid == udid).cloned())
    }

    fn push_info(&self, id: &str) -> Result<PushInfo, StoreError> {
        self.push
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::PushInfoNotFound(id.to_string()))
    }
}

#[derive(Clone, Default)]
struct StubRemote {
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    fail: bool,
}

async fn record_checkin(State(stub): State<StubRemote>, body: Bytes) -> StatusCode {
    if stub.fail {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    stub.bodies.lock().unwrap().push(body.to_vec());
    StatusCode::OK
}

async fn spawn_stub(fail: bool) -> (String, StubRemote) {
    let stub = StubRemote {
        fail,
        ..StubRemote::default()
    };
    let app = Router::new()
        .route("/migration", put(record_checkin))
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/migration"), stub)
}

fn device(udid: &str) -> DeviceRecord {
    DeviceRecord {
        udid: udid.into(),
        serial_number: "SN1".into(),
        unlock_token: "0011".into(),
        ..DeviceRecord::default()
    }
}

fn push() -> PushInfo {
    PushInfo {
        topic: "com.example.push".into(),
        token: "aabbcc".into(),
        push_magic: "magic1".into(),
    }
}

fn source_with_device() -> MemorySource {
    MemorySource {
        devices: vec![device("D1")],
        users: vec![],
        push: HashMap::from([("D1".to_string(), push())]),
    }
}

#[tokio::test]
async fn delivers_authenticate_and_token_update_per_device() {
    let (url, stub) = spawn_stub(false).await;
    let migrator = Migrator::new(
        source_with_device(),
        Some(DeliveryClient::new(&url, "secret")),
        None,
        SelectionFilter::default(),
    );

    let summary = migrator.run().await.unwrap();
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.failed, 0);

    let bodies = stub.bodies.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    let first = String::from_utf8(bodies[0].clone()).unwrap();
    let second = String::from_utf8(bodies[1].clone()).unwrap();
    assert!(first.contains("<string>Authenticate</string>"), "{first}");
    assert!(second.contains("<string>TokenUpdate</string>"), "{second}");
    assert!(second.contains("<key>PushMagic</key>"));
}

#[tokio::test]
async fn user_phase_delivers_user_token_update() {
    let (url, stub) = spawn_stub(false).await;
    let mut source = source_with_device();
    source.users = vec![UserRecord {
        user_id: "U1".into(),
        udid: "D1".into(),
        user_shortname: "jdoe".into(),
        user_longname: "Jo Doe".into(),
    }];
    source.push.insert("U1".to_string(), push());

    let migrator = Migrator::new(
        source,
        Some(DeliveryClient::new(&url, "secret")),
        None,
        SelectionFilter::default(),
    );
    let summary = migrator.run().await.unwrap();
    assert_eq!(summary.delivered, 3);

    let bodies = stub.bodies.lock().unwrap();
    let user_update = String::from_utf8(bodies[2].clone()).unwrap();
    assert!(user_update.contains("<key>UserID</key>"));
    assert!(user_update.contains("<string>U1</string>"));
}

#[tokio::test]
async fn second_run_with_ledger_skips_seen_messages() {
    let (url, stub) = spawn_stub(false).await;
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.redb");
    let client = DeliveryClient::new(&url, "secret");

    let migrator = Migrator::new(
        source_with_device(),
        Some(client.clone()),
        Some(Ledger::open(&ledger_path).unwrap()),
        SelectionFilter::default(),
    );
    let first = migrator.run().await.unwrap();
    assert_eq!(first.delivered, 2);
    drop(migrator);

    let migrator = Migrator::new(
        source_with_device(),
        Some(client),
        Some(Ledger::open(&ledger_path).unwrap()),
        SelectionFilter::default(),
    );
    let second = migrator.run().await.unwrap();
    assert_eq!(second.delivered, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(stub.bodies.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn prepopulated_ledger_skips_only_the_seen_message() {
    let (url, stub) = spawn_stub(false).await;
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(dir.path().join("ledger.redb")).unwrap();

    // Record the Authenticate digest as if an earlier run had sent it.
    let authenticate = build_authenticate(&device("D1"), &push());
    let seen = digest(&encode(&authenticate).unwrap());
    ledger.mark_sent(&seen, "device_authenticate D1").unwrap();

    let migrator = Migrator::new(
        source_with_device(),
        Some(DeliveryClient::new(&url, "secret")),
        Some(ledger),
        SelectionFilter::default(),
    );
    let summary = migrator.run().await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.skipped, 1);

    let bodies = stub.bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    let only = String::from_utf8(bodies[0].clone()).unwrap();
    assert!(only.contains("<string>TokenUpdate</string>"));
}

#[tokio::test]
async fn filtered_devices_never_reach_the_remote() {
    let (url, stub) = spawn_stub(false).await;
    let filter = SelectionFilter::new(HashSet::from(["A".to_string()]), None);
    let migrator = Migrator::new(
        source_with_device(), // only device is D1
        Some(DeliveryClient::new(&url, "secret")),
        None,
        filter,
    );

    let summary = migrator.run().await.unwrap();
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.skipped, 1);
    assert!(stub.bodies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_push_info_skips_the_record() {
    let (url, stub) = spawn_stub(false).await;
    let source = MemorySource {
        devices: vec![device("D1")],
        users: vec![],
        push: HashMap::new(),
    };
    let migrator = Migrator::new(
        source,
        Some(DeliveryClient::new(&url, "secret")),
        None,
        SelectionFilter::default(),
    );

    let summary = migrator.run().await.unwrap();
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.skipped, 1);
    assert!(stub.bodies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_delivery_is_not_recorded_in_the_ledger() {
    let (url, _stub) = spawn_stub(true).await;
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.redb");

    let migrator = Migrator::new(
        source_with_device(),
        Some(DeliveryClient::new(&url, "secret")),
        Some(Ledger::open(&ledger_path).unwrap()),
        SelectionFilter::default(),
    );
    let summary = migrator.run().await.unwrap();
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.failed, 2);
    drop(migrator);

    let ledger = Ledger::open(&ledger_path).unwrap();
    let authenticate = build_authenticate(&device("D1"), &push());
    let d = digest(&encode(&authenticate).unwrap());
    assert!(!ledger.seen(&d).unwrap());
}

#[tokio::test]
async fn dry_run_builds_but_never_delivers() {
    let migrator = Migrator::new(source_with_device(), None, None, SelectionFilter::default());
    let summary = migrator.run().await.unwrap();
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.failed, 0);
}
