use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use tokio::sync::watch;
use crate::api::error::ApiError;
use crate::registry::store::Registration;
use crate::registry_manager::RegistryHandle;
use shared::protocol::{
    HASH_PATH, HEARTBEAT_PATH, MAX_HEARTBEAT_INTERVAL_SECS, REGISTER_PATH, SERVICES_PATH,
};
use shared::types::{
    DiscoverResponse, HeartbeatRequest, HeartbeatResponse, InstanceStatus, ListedInstance,
    MessageResponse, RegisterRequest, RegisterResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub hash_rx: watch::Receiver<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(REGISTER_PATH, post(register))
        .route(HEARTBEAT_PATH, post(heartbeat))
        .route(SERVICES_PATH, get(list_services))
        .route(&format!("{}/:name", SERVICES_PATH), get(discover))
        .route(&format!("{}/:name/:port", SERVICES_PATH), delete(remove))
        .route(HASH_PATH, get(get_hash))
        .with_state(state)
}

/// The caller's address, with IPv4-mapped IPv6 folded back to IPv4 so a
/// dual-stack listener produces the same instance id as an IPv4 one.
fn peer_ip(addr: SocketAddr) -> IpAddr {
    addr.ip().to_canonical()
}

fn validate(req: RegisterRequest, ip: IpAddr) -> Result<Registration, ApiError> {
    let name = req
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    let (name, port) = match (name, req.port) {
        (Some(name), Some(port)) if port != 0 => (name, port),
        _ => return Err(ApiError::Validation("Service name and port are required".to_string())),
    };

    match req.heartbeat_interval {
        Some(0) => {
            return Err(ApiError::Validation(
                "heartbeatInterval must be greater than zero".to_string(),
            ))
        }
        Some(secs) if secs > MAX_HEARTBEAT_INTERVAL_SECS => {
            return Err(ApiError::Validation(format!(
                "heartbeatInterval must not exceed {}",
                MAX_HEARTBEAT_INTERVAL_SECS
            )))
        }
        _ => {}
    }

    Ok(Registration {
        name,
        ip,
        port,
        heartbeat_interval: req.heartbeat_interval,
    })
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(inner)| inner)
        .map_err(|e| ApiError::Validation(e.body_text()))
}

async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let reg = validate(json_body(body)?, peer_ip(addr))?;
    let instance = state.registry.register(reg).await?;

    Ok(Json(RegisterResponse {
        id: instance.id,
        heartbeat_interval: instance.heartbeat_interval,
        registered_at: instance.registered_at,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let reg = validate(json_body(body)?, peer_ip(addr))?;
    let outcome = state.registry.heartbeat(reg).await??;

    Ok(Json(HeartbeatResponse {
        ok: true,
        last_heartbeat: outcome.instance.last_heartbeat,
        next_heartbeat_in: outcome.instance.heartbeat_interval,
    }))
}

async fn discover(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DiscoverResponse>, ApiError> {
    let services = state.registry.discover(name).await?;
    Ok(Json(DiscoverResponse { services }))
}

async fn list_services(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, Vec<ListedInstance>>>, ApiError> {
    let listing = state
        .registry
        .list_all()
        .await?
        .into_iter()
        .map(|(name, instances)| {
            let tagged = instances
                .into_iter()
                .map(|instance| ListedInstance {
                    instance,
                    status: InstanceStatus::Alive,
                })
                .collect();
            (name, tagged)
        })
        .collect();

    Ok(Json(listing))
}

async fn remove(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((name, port)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    let port: u16 = port
        .parse()
        .map_err(|_| ApiError::Validation(format!("Invalid port: {}", port)))?;

    let removed = state.registry.remove(name, peer_ip(addr), port).await??;

    Ok(Json(MessageResponse {
        message: format!("Service {} removed", removed.id),
    }))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use axum::body::{to_bytes, Body};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use shared::clock::ManualClock;
    use tower::ServiceExt;
    use crate::config::RegistryConfig;

    const PEER: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 50_000);

    fn test_app() -> (Router, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let (hash_tx, hash_rx) = watch::channel(String::new());
        let registry = RegistryHandle::spawn(&RegistryConfig::default(), clock.clone(), hash_tx);
        let app = router(AppState { registry, hash_rx }).layer(MockConnectInfo(PEER));
        (app, clock)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_register_derives_ip_from_connection() {
        let (app, _clock) = test_app();

        let (status, body) = send(
            &app,
            "POST",
            "/register",
            Some(json!({ "name": "svc-a", "port": 9000, "heartbeatInterval": 5 })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "svc-a-10.0.0.1-9000");
        assert_eq!(body["heartbeatInterval"], 5);
        assert_eq!(body["registeredAt"], 1_000_000);
    }

    #[tokio::test]
    async fn test_register_default_interval() {
        let (app, _clock) = test_app();
        let (_, body) = send(&app, "POST", "/register", Some(json!({ "name": "svc-a", "port": 9000 }))).await;
        assert_eq!(body["heartbeatInterval"], 30);
    }

    #[tokio::test]
    async fn test_register_missing_fields() {
        let (app, _clock) = test_app();

        let (status, body) = send(&app, "POST", "/register", Some(json!({ "port": 9000 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, "POST", "/register", Some(json!({ "name": "svc-a" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/heartbeat", Some(json!({ "name": "  " , "port": 1 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, "POST", "/register", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_heartbeat_interval_bounds() {
        let (app, _clock) = test_app();

        for interval in [0, 86_401, u64::MAX] {
            let (status, body) = send(
                &app,
                "POST",
                "/register",
                Some(json!({ "name": "svc-a", "port": 9000, "heartbeatInterval": interval })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "interval {}", interval);
            assert!(body["error"].is_string());
        }

        let (status, _) = send(
            &app,
            "POST",
            "/heartbeat",
            Some(json!({ "name": "svc-a", "port": 9000, "heartbeatInterval": u64::MAX })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            "POST",
            "/register",
            Some(json!({ "name": "svc-a", "port": 9000, "heartbeatInterval": 86_400 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["heartbeatInterval"], 86_400);
    }

    #[tokio::test]
    async fn test_reregister_keeps_one_entry() {
        let (app, _clock) = test_app();
        let req = json!({ "name": "svc-a", "port": 9000 });

        send(&app, "POST", "/register", Some(req.clone())).await;
        send(&app, "POST", "/register", Some(req)).await;

        let (_, body) = send(&app, "GET", "/services/svc-a", None).await;
        assert_eq!(body["services"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_window() {
        let (app, clock) = test_app();
        send(
            &app,
            "POST",
            "/register",
            Some(json!({ "name": "svc-a", "port": 9000, "heartbeatInterval": 5 })),
        )
        .await;

        clock.advance_secs(4);
        let (status, body) = send(&app, "POST", "/heartbeat", Some(json!({ "name": "svc-a", "port": 9000 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["lastHeartbeat"], 1_004_000);
        assert_eq!(body["nextHeartbeatIn"], 5);

        let (_, body) = send(&app, "GET", "/services/svc-a", None).await;
        let services = body["services"].as_array().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0]["ip"], "10.0.0.1");

        clock.advance_secs(9);
        let (status, body) = send(&app, "GET", "/services/svc-a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["services"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_registers_unknown_instance() {
        let (app, _clock) = test_app();
        let (status, _) = send(&app, "POST", "/heartbeat", Some(json!({ "name": "svc-b", "port": 7000 }))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, "GET", "/services/svc-b", None).await;
        assert_eq!(body["services"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discover_unknown_is_empty() {
        let (app, _clock) = test_app();
        let (status, body) = send(&app, "GET", "/services/ghost", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "services": [] }));
    }

    #[tokio::test]
    async fn test_list_tags_alive() {
        let (app, _clock) = test_app();
        send(&app, "POST", "/register", Some(json!({ "name": "svc-a", "port": 9000 }))).await;
        send(&app, "POST", "/register", Some(json!({ "name": "svc-b", "port": 9001 }))).await;

        let (status, body) = send(&app, "GET", "/services", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["svc-a"][0]["status"], "alive");
        assert_eq!(body["svc-b"][0]["port"], 9001);
    }

    #[tokio::test]
    async fn test_remove() {
        let (app, _clock) = test_app();
        send(&app, "POST", "/register", Some(json!({ "name": "svc-a", "port": 9000 }))).await;

        let (status, body) = send(&app, "DELETE", "/services/svc-a/9000", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());

        let (status, body) = send(&app, "DELETE", "/services/svc-a/9000", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (_, body) = send(&app, "GET", "/services", None).await;
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn test_remove_unknown_instance_of_known_service() {
        let (app, _clock) = test_app();
        send(&app, "POST", "/register", Some(json!({ "name": "svc-a", "port": 9000 }))).await;

        let (status, _) = send(&app, "DELETE", "/services/svc-a/9001", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hash_tracks_membership() {
        let (app, _clock) = test_app();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/registry/hash").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let before = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        send(&app, "POST", "/register", Some(json!({ "name": "svc-a", "port": 9000 }))).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/registry/hash").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let after = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        assert_ne!(before, after);
        assert_eq!(after.len(), 64);
    }

    #[test]
    fn test_peer_ip_folds_mapped_ipv4() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:4000".parse().unwrap();
        assert_eq!(peer_ip(mapped), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));

        let v6: SocketAddr = "[::1]:4000".parse().unwrap();
        assert_eq!(peer_ip(v6), "::1".parse::<IpAddr>().unwrap());
    }
}
