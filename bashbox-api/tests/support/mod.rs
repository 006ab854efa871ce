//! In-process fake of the machines control plane.
//!
//! Implements just enough of the wire contract for the pool to run against:
//! machine lifecycle transitions happen instantly, leases are tracked per
//! machine, and every mutating call checks the lease nonce so tests can
//! assert nonce discipline.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use bashbox_api::machines::{
    CreateMachineReq, LeaseData, LeaseReq, LeaseResp, MachineResp, OkResp, StartResp,
    LEASE_NONCE_HEADER,
};

#[derive(Debug, Clone)]
pub struct FakeLease {
    pub nonce: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct FakeMachine {
    pub id: String,
    pub name: String,
    pub state: String,
    pub region: String,
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    pub lease: Option<FakeLease>,
    pub stop_count: usize,
}

#[derive(Default)]
struct Inner {
    machines: HashMap<String, FakeMachine>,
    next_id: u64,
    create_count: usize,
    start_attempts: usize,
    lease_renewals: usize,
    nonce_violations: usize,
    fail_starts: u32,
    destroy_attempts: HashMap<String, usize>,
}

type Shared = Arc<Mutex<Inner>>;

pub struct FakeControlPlane {
    shared: Shared,
    pub url: String,
}

impl FakeControlPlane {
    pub async fn start() -> Self {
        let shared: Shared = Arc::new(Mutex::new(Inner::default()));

        let app = Router::new()
            .route("/v1/apps/{app}/machines", post(create_mach).get(list_machs))
            .route("/v1/apps/{app}/machines/{id}/start", post(start_mach))
            .route("/v1/apps/{app}/machines/{id}/stop", post(stop_mach))
            .route("/v1/apps/{app}/machines/{id}", delete(destroy_mach))
            .route("/v1/apps/{app}/machines/{id}/wait", get(wait_mach))
            .route(
                "/v1/apps/{app}/machines/{id}/lease",
                post(lease_mach).get(get_lease_mach),
            )
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { shared, url }
    }

    pub fn seed_machine(
        &self,
        name: &str,
        pool_id: &str,
        state: &str,
        created_at: DateTime<Utc>,
        lease: Option<(&str, i64)>,
    ) -> String {
        let mut inner = self.shared.lock();
        inner.next_id += 1;
        let id = format!("mach{}", inner.next_id);
        let machine = FakeMachine {
            id: id.clone(),
            name: name.to_string(),
            state: state.to_string(),
            region: "qmx".to_string(),
            instance_id: format!("inst{}", inner.next_id),
            created_at,
            metadata: HashMap::from([("pool_id".to_string(), pool_id.to_string())]),
            lease: lease.map(|(nonce, expires_at)| FakeLease {
                nonce: nonce.to_string(),
                expires_at,
            }),
            stop_count: 0,
        };
        inner.machines.insert(id.clone(), machine);
        id
    }

    pub fn create_count(&self) -> usize {
        self.shared.lock().create_count
    }

    pub fn start_attempts(&self) -> usize {
        self.shared.lock().start_attempts
    }

    pub fn lease_renewals(&self) -> usize {
        self.shared.lock().lease_renewals
    }

    pub fn nonce_violations(&self) -> usize {
        self.shared.lock().nonce_violations
    }

    pub fn machine_count(&self) -> usize {
        self.shared.lock().machines.len()
    }

    pub fn set_fail_starts(&self, n: u32) {
        self.shared.lock().fail_starts = n;
    }

    pub fn machine_by_name(&self, name: &str) -> Option<FakeMachine> {
        self.shared
            .lock()
            .machines
            .values()
            .find(|m| m.name == name)
            .cloned()
    }

    pub fn machine_state_by_name(&self, name: &str) -> Option<String> {
        self.machine_by_name(name).map(|m| m.state)
    }

    pub fn stop_count_by_name(&self, name: &str) -> usize {
        self.machine_by_name(name).map_or(0, |m| m.stop_count)
    }

    pub fn destroy_attempts_by_name(&self, name: &str) -> usize {
        self.shared
            .lock()
            .destroy_attempts
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

fn machine_resp(machine: &FakeMachine, nonce: &str) -> MachineResp {
    MachineResp {
        id: machine.id.clone(),
        name: machine.name.clone(),
        state: machine.state.clone(),
        region: machine.region.clone(),
        instance_id: machine.instance_id.clone(),
        private_ip: String::new(),
        created_at: machine.created_at.to_rfc3339(),
        config: bashbox_api::machines::MachineConfig {
            metadata: machine.metadata.clone(),
            ..Default::default()
        },
        nonce: nonce.to_string(),
    }
}

/// Nonce discipline for calls the pool always makes through a handle: a
/// leased machine must see its current nonce.
fn check_nonce(inner: &mut Inner, id: &str, headers: &HeaderMap) -> bool {
    let Some(machine) = inner.machines.get(id) else {
        return true;
    };
    let ok = match (&machine.lease, headers.get(LEASE_NONCE_HEADER)) {
        (Some(lease), Some(got)) => got.to_str().ok() == Some(lease.nonce.as_str()),
        (Some(_), None) => false,
        (None, _) => true,
    };
    if !ok {
        inner.nonce_violations += 1;
    }
    ok
}

async fn create_mach(
    State(shared): State<Shared>,
    Path(_app): Path<String>,
    Json(req): Json<CreateMachineReq>,
) -> Json<MachineResp> {
    let mut inner = shared.lock();
    inner.next_id += 1;
    inner.create_count += 1;

    let id = format!("mach{}", inner.next_id);
    let nonce = format!("nonce-{}", inner.next_id);
    let machine = FakeMachine {
        id: id.clone(),
        name: req.name.clone(),
        state: "started".to_string(),
        region: req.region.clone(),
        instance_id: format!("inst{}", inner.next_id),
        created_at: Utc::now(),
        metadata: req.config.metadata.clone(),
        lease: Some(FakeLease {
            nonce: nonce.clone(),
            expires_at: Utc::now().timestamp() + req.lease_ttl,
        }),
        stop_count: 0,
    };
    let resp = machine_resp(&machine, &nonce);
    inner.machines.insert(id, machine);
    Json(resp)
}

async fn start_mach(
    State(shared): State<Shared>,
    Path((_app, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut inner = shared.lock();
    inner.start_attempts += 1;
    if !inner.machines.contains_key(&id) {
        return (StatusCode::NOT_FOUND, "no such machine").into_response();
    }
    if !check_nonce(&mut inner, &id, &headers) {
        return (StatusCode::BAD_REQUEST, "bad nonce").into_response();
    }
    if inner.fail_starts > 0 {
        inner.fail_starts -= 1;
        return (StatusCode::PRECONDITION_FAILED, "machine still stopping").into_response();
    }

    if let Some(machine) = inner.machines.get_mut(&id) {
        machine.state = "started".to_string();
    }
    Json(StartResp::default()).into_response()
}

async fn stop_mach(
    State(shared): State<Shared>,
    Path((_app, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut inner = shared.lock();
    if !inner.machines.contains_key(&id) {
        return (StatusCode::NOT_FOUND, "no such machine").into_response();
    }
    if !check_nonce(&mut inner, &id, &headers) {
        return (StatusCode::BAD_REQUEST, "bad nonce").into_response();
    }

    if let Some(machine) = inner.machines.get_mut(&id) {
        machine.state = "stopped".to_string();
        machine.stop_count += 1;
    }
    Json(OkResp { ok: true }).into_response()
}

async fn destroy_mach(
    State(shared): State<Shared>,
    Path((_app, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut inner = shared.lock();
    let Some(machine) = inner.machines.get(&id) else {
        return (StatusCode::NOT_FOUND, "no such machine").into_response();
    };
    let name = machine.name.clone();
    let leased = machine
        .lease
        .as_ref()
        .is_some_and(|lease| lease.expires_at > Utc::now().timestamp());
    *inner.destroy_attempts.entry(name).or_default() += 1;
    if leased {
        match headers.get(LEASE_NONCE_HEADER) {
            // Destroying a leased machine without the nonce is refused.
            None => return (StatusCode::PRECONDITION_FAILED, "machine is leased").into_response(),
            Some(_) => {
                if !check_nonce(&mut inner, &id, &headers) {
                    return (StatusCode::BAD_REQUEST, "bad nonce").into_response();
                }
            }
        }
    }

    inner.machines.remove(&id);
    Json(OkResp { ok: true }).into_response()
}

async fn wait_mach(
    State(shared): State<Shared>,
    Path((_app, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let mut inner = shared.lock();
    if !inner.machines.contains_key(&id) {
        return (StatusCode::NOT_FOUND, "no such machine").into_response();
    }
    if !check_nonce(&mut inner, &id, &headers) {
        return (StatusCode::BAD_REQUEST, "bad nonce").into_response();
    }

    let wanted = params.get("state").cloned().unwrap_or_default();
    let ok = inner
        .machines
        .get(&id)
        .is_some_and(|machine| machine.state == wanted);
    Json(OkResp { ok }).into_response()
}

async fn lease_mach(
    State(shared): State<Shared>,
    Path((_app, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<LeaseReq>,
) -> Response {
    let mut inner = shared.lock();
    if !inner.machines.contains_key(&id) {
        return (StatusCode::NOT_FOUND, "no such machine").into_response();
    }
    if !check_nonce(&mut inner, &id, &headers) {
        return (StatusCode::BAD_REQUEST, "bad nonce").into_response();
    }
    inner.lease_renewals += 1;

    let fallback_nonce = format!("nonce-l{}", inner.next_id + 1);
    let Some(machine) = inner.machines.get_mut(&id) else {
        return (StatusCode::NOT_FOUND, "no such machine").into_response();
    };
    let nonce = match &machine.lease {
        Some(lease) => lease.nonce.clone(),
        None => fallback_nonce,
    };
    let expires_at = Utc::now().timestamp() + req.ttl;
    machine.lease = Some(FakeLease {
        nonce: nonce.clone(),
        expires_at,
    });

    Json(LeaseResp {
        status: "success".to_string(),
        data: LeaseData {
            nonce,
            expires_at,
            owner: "fake".to_string(),
            description: req.description,
            version: "1".to_string(),
        },
    })
    .into_response()
}

async fn get_lease_mach(
    State(shared): State<Shared>,
    Path((_app, id)): Path<(String, String)>,
) -> Response {
    let inner = shared.lock();
    let Some(machine) = inner.machines.get(&id) else {
        return (StatusCode::NOT_FOUND, "no such machine").into_response();
    };
    let Some(lease) = &machine.lease else {
        return (StatusCode::NOT_FOUND, "no lease").into_response();
    };

    Json(LeaseResp {
        status: "success".to_string(),
        data: LeaseData {
            nonce: lease.nonce.clone(),
            expires_at: lease.expires_at,
            owner: "fake".to_string(),
            description: String::new(),
            version: "1".to_string(),
        },
    })
    .into_response()
}

async fn list_machs(
    State(shared): State<Shared>,
    Path(_app): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<MachineResp>> {
    let inner = shared.lock();
    let region = params.get("region");
    let machines = inner
        .machines
        .values()
        .filter(|m| region.map_or(true, |r| &m.region == r))
        .map(|m| machine_resp(m, ""))
        .collect();
    Json(machines)
}
