//! Portal HTTP server
//!
//! Resident, gate device, admin and metrics routes on one hyper HTTP/1 server.
//! A gate poll that is cancelled by server shutdown fails the request, so hyper
//! drops the connection without writing a response.

use crate::domain::types::{OpenOutcome, PollOutcome, User, UserId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::audit_log::{AuditLog, JsonlAuditLog};
use crate::io::firmware::{is_valid_version, FirmwareDirectory, FirmwareStore};
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::auth::Authenticator;
use crate::services::connection_tracker::GateConnectionTracker;
use crate::services::long_poll::{GateLongPoll, RunningVersion};
use crate::services::open_request::OpenRequest;
use crate::services::open_signal::OpenSignal;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use serde_json::json;
use std::borrow::Cow;
use std::fmt;
use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const VERSION_HEADER: &str = "x-version";
const ESP32_VERSION_HEADER: &str = "x-esp32-version";
const CHECKSUM_HEADER: &str = "x-sha256";
const FIRMWARE_VERSION_HEADER: &str = "x-firmware-version";
const MAX_FIRMWARE_BYTES: usize = 16 * 1024 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared state behind every route
pub struct AppState {
    pub auth: Authenticator,
    pub open_request: OpenRequest,
    pub long_poll: GateLongPoll,
    pub signal: Arc<OpenSignal>,
    pub tracker: Arc<GateConnectionTracker>,
    pub firmware: Arc<FirmwareDirectory>,
    pub audit: Arc<dyn AuditLog>,
    pub running_version: Arc<RunningVersion>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire the services together from configuration
    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Self {
        let audit: Arc<dyn AuditLog> = Arc::new(JsonlAuditLog::new(config.audit_file()));
        Self::with_audit_log(config, metrics, audit)
    }

    /// Same as `from_config` with a caller-provided audit log
    pub fn with_audit_log(config: &Config, metrics: Arc<Metrics>, audit: Arc<dyn AuditLog>) -> Self {
        let signal = Arc::new(OpenSignal::new());
        let tracker = Arc::new(GateConnectionTracker::new(config.max_connections()));
        let firmware = Arc::new(FirmwareDirectory::new(config.firmware_directory()));
        let running_version = Arc::new(RunningVersion::new());

        let long_poll = GateLongPoll::new(
            signal.clone(),
            tracker.clone(),
            firmware.clone(),
            running_version.clone(),
            metrics.clone(),
            config.poll_timeout(),
        );
        let open_request = OpenRequest::new(signal.clone(), audit.clone(), metrics.clone());

        Self {
            auth: Authenticator::from_config(config),
            open_request,
            long_poll,
            signal,
            tracker,
            firmware,
            audit,
            running_version,
            metrics,
        }
    }
}

/// Returned by the service when a gate poll is cancelled; hyper aborts the
/// connection instead of answering
#[derive(Debug)]
pub struct PollAborted;

impl fmt::Display for PollAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("gate poll cancelled by server shutdown")
    }
}

impl std::error::Error for PollAborted {}

/// Resolves once shutdown is signalled; never resolves if the sender is gone
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("static response should not fail")
}

fn respond_json(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .expect("static response should not fail")
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    respond(status, Bytes::new())
}

fn header<'a>(req: &'a Parts, name: &str) -> Option<&'a str> {
    req.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Percent-decoded value of `key` in the query string
fn query_param<'a>(req: &'a Parts, key: &str) -> Option<Cow<'a, str>> {
    req.uri
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| percent_decode_str(v).decode_utf8().ok())
}

fn authorize_user<'s>(
    state: &'s AppState,
    req: &Parts,
) -> Result<&'s User, Response<Full<Bytes>>> {
    state
        .auth
        .user(header(req, AUTHORIZATION.as_str()))
        .ok_or_else(|| respond(StatusCode::UNAUTHORIZED, "Unauthorized"))
}

fn authorize_admin<'s>(
    state: &'s AppState,
    req: &Parts,
) -> Result<&'s User, Response<Full<Bytes>>> {
    let user = authorize_user(state, req)?;
    if !user.admin {
        warn!(user_id = %user.id, path = %req.uri.path(), "admin_route_forbidden");
        return Err(respond(StatusCode::FORBIDDEN, "Forbidden"));
    }
    Ok(user)
}

/// Handle HTTP requests
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Result<Response<Full<Bytes>>, PollAborted>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let (parts, body) = req.into_parts();
    let req = &parts;

    let response = match (&req.method, req.uri.path()) {
        (&Method::PUT, "/user/open") => open_gate(&state, req).await,
        (&Method::GET, "/user") | (&Method::GET, "/user/") => user_status(&state, req),
        (&Method::GET, "/gate") | (&Method::GET, "/gate/") => {
            return gate_poll(&state, req, shutdown).await;
        }
        (&Method::GET, "/gate/firmware") => download_firmware(&state, req).await,
        (&Method::GET, "/admin/status") => admin_status(&state, req).await,
        (&Method::GET, "/admin/logs") => admin_logs(&state, req).await,
        (&Method::PUT, "/admin/firmware") => upload_firmware(&state, req, body).await,
        (&Method::GET, "/metrics") => {
            let summary = state.metrics.snapshot(state.tracker.count(), state.signal.is_pending());
            let body = format_prometheus_metrics(&summary, state.tracker.capacity());
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        (&Method::GET, "/health") => respond(StatusCode::OK, "ok"),
        _ => respond(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

async fn open_gate(state: &AppState, req: &Parts) -> Response<Full<Bytes>> {
    let user = match authorize_user(state, req) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match state.open_request.request_open(user).await {
        OpenOutcome::Opening => respond(StatusCode::OK, "The gate is opening"),
        OpenOutcome::AlreadyOpening => respond(StatusCode::OK, "The gate is already opening"),
        OpenOutcome::Failed(_) => {
            respond(StatusCode::UNPROCESSABLE_ENTITY, "Failed to record the open request")
        }
    }
}

fn user_status(state: &AppState, req: &Parts) -> Response<Full<Bytes>> {
    let user = match authorize_user(state, req) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    respond_json(
        StatusCode::OK,
        json!({
            "user": user,
            "gate_connected": state.tracker.is_reachable(),
            "open_pending": state.signal.is_pending(),
        }),
    )
}

async fn gate_poll(
    state: &AppState,
    req: &Parts,
    shutdown: watch::Receiver<bool>,
) -> Result<Response<Full<Bytes>>, PollAborted> {
    if !state.auth.is_gate(header(req, AUTHORIZATION.as_str())) {
        warn!(path = %req.uri.path(), "gate_key_rejected");
        return Ok(respond(StatusCode::UNAUTHORIZED, "Unauthorized"));
    }

    let version = header(req, VERSION_HEADER);
    let outcome = state.long_poll.poll(version, shutdown_requested(shutdown)).await;

    let status = match outcome {
        PollOutcome::Opened => StatusCode::OK,
        PollOutcome::TimedOut => StatusCode::REQUEST_TIMEOUT,
        PollOutcome::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
        PollOutcome::Saturated => StatusCode::SERVICE_UNAVAILABLE,
        PollOutcome::Cancelled => return Err(PollAborted),
    };
    Ok(empty(status))
}

async fn download_firmware(state: &AppState, req: &Parts) -> Response<Full<Bytes>> {
    let mut reported = req.headers.get_all(ESP32_VERSION_HEADER).iter();
    let running = reported.next();
    if reported.next().is_some() {
        error!("firmware_version_header_repeated");
        return empty(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let running = running.and_then(|v| v.to_str().ok());

    let current = match state.firmware.current_version().await {
        Ok(Some(current)) => current,
        Ok(None) => {
            warn!("firmware_not_uploaded");
            return empty(StatusCode::NOT_MODIFIED);
        }
        Err(e) => {
            error!(error = %e, "firmware_version_unavailable");
            return empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    if running == Some(current.as_str()) {
        return empty(StatusCode::NOT_MODIFIED);
    }

    match state.firmware.load_current().await {
        Ok(Some(image)) => {
            info!(version = %image.version, sha256 = %image.sha256, bytes = %image.bytes.len(), "firmware_sent");
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CHECKSUM_HEADER, image.sha256.as_str())
                .header(FIRMWARE_VERSION_HEADER, image.version.as_str())
                .body(Full::new(image.bytes))
                .expect("static response should not fail")
        }
        Ok(None) => empty(StatusCode::NOT_MODIFIED),
        Err(e) => {
            error!(error = %e, "firmware_read_failed");
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn admin_status(state: &AppState, req: &Parts) -> Response<Full<Bytes>> {
    if let Err(resp) = authorize_admin(state, req) {
        return resp;
    }

    let current_version = match state.firmware.current_version().await {
        Ok(version) => version,
        Err(e) => {
            error!(error = %e, "firmware_version_unavailable");
            None
        }
    };

    respond_json(
        StatusCode::OK,
        json!({
            "gate_connections": state.tracker.count(),
            "gate_capacity": state.tracker.capacity(),
            "gate_connected": state.tracker.is_reachable(),
            "open_pending": state.signal.is_pending(),
            "running_version": state.running_version.get(),
            "current_version": current_version,
        }),
    )
}

async fn admin_logs(state: &AppState, req: &Parts) -> Response<Full<Bytes>> {
    if let Err(resp) = authorize_admin(state, req) {
        return resp;
    }

    let Some(user_id) = query_param(req, "user").and_then(|v| v.parse::<UserId>().ok()) else {
        return respond(StatusCode::BAD_REQUEST, "Missing or invalid user id");
    };

    match state.audit.entries_for(user_id).await {
        Ok(entries) => respond_json(StatusCode::OK, json!(entries)),
        Err(e) => {
            error!(user_id = %user_id, error = %e, "audit_log_read_failed");
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn upload_firmware<B>(state: &AppState, req: &Parts, body: B) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let admin = match authorize_admin(state, req) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let version = match query_param(req, "version") {
        Some(version) if is_valid_version(&version) => version.into_owned(),
        _ => return respond(StatusCode::UNPROCESSABLE_ENTITY, "Invalid firmware version"),
    };

    let image = match Limited::new(body, MAX_FIRMWARE_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(version = %version, error = %e, "firmware_upload_read_failed");
            return respond(StatusCode::UNPROCESSABLE_ENTITY, "Failed to read firmware upload");
        }
    };

    match state.firmware.install(&version, &image).await {
        Ok(()) => {
            info!(user_id = %admin.id, version = %version, bytes = %image.len(), "firmware_uploaded");
            respond(StatusCode::OK, "Firmware uploaded")
        }
        Err(e) => {
            error!(version = %version, error = %format!("{e:#}"), "firmware_install_failed");
            respond(StatusCode::UNPROCESSABLE_ENTITY, "Failed to store firmware")
        }
    }
}

/// Accept connections until shutdown is signalled
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();
                        let conn_shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, state.clone(), conn_shutdown.clone())
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                if e.is_user() || e.is_incomplete_message() {
                                    debug!(error = %e, "http_connection_aborted");
                                } else {
                                    error!(error = %e, "http_connection_error");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

/// Bind the portal listener and serve until shutdown
pub async fn start_http_server(
    bind_address: &str,
    port: u16,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ip = bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid http.bind_address {bind_address:?}: {e}"))?;
    let addr = SocketAddr::new(ip, port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))?;

    info!(addr = %addr, "http_server_started");
    serve(listener, state, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::UserConfig;
    use crate::io::audit_log::MemoryAuditLog;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use uuid::Uuid;

    struct Fixture {
        state: Arc<AppState>,
        audit: Arc<MemoryAuditLog>,
        resident: Uuid,
        shutdown_tx: watch::Sender<bool>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let resident = Uuid::now_v7();
        let toml = format!(
            r#"
[gate]
secret = "gate-key"
poll_timeout_secs = 1
max_connections = 2

[firmware]
directory = "{}"

[[users]]
id = "{}"
name = "alice"
token = "alice-token"

[[users]]
id = "{}"
name = "root"
token = "root-token"
admin = true
"#,
            dir.path().join("firmware").display(),
            resident,
            Uuid::now_v7(),
        );
        let config = Config::from_toml_str(&toml, "test").unwrap();
        let audit = Arc::new(MemoryAuditLog::new());
        let state = Arc::new(AppState::with_audit_log(
            &config,
            Arc::new(Metrics::new()),
            audit.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Fixture { state, audit, resident, shutdown_tx, _dir: dir }
    }

    fn request(method: Method, uri: &str, auth: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    async fn send(f: &Fixture, req: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        handle_request(req, f.state.clone(), f.shutdown_tx.subscribe()).await.unwrap()
    }

    async fn body_text(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_open_requires_user() {
        let f = fixture();

        let resp = send(&f, request(Method::PUT, "/user/open", None)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = send(&f, request(Method::PUT, "/user/open", Some("Bearer gate-key"))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(!f.state.signal.is_pending());
    }

    #[tokio::test]
    async fn test_open_then_already_opening() {
        let f = fixture();

        let resp = send(&f, request(Method::PUT, "/user/open", Some("Bearer alice-token"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "The gate is opening");

        let resp = send(&f, request(Method::PUT, "/user/open", Some("Bearer alice-token"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "The gate is already opening");

        assert_eq!(f.audit.len(), 2);
    }

    #[tokio::test]
    async fn test_gate_poll_consumes_pending_open() {
        let f = fixture();
        assert!(f.state.signal.try_open());

        let resp = send(&f, request(Method::GET, "/gate", Some("gate-key"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!f.state.signal.is_pending());
        assert_eq!(f.state.tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_gate_poll_times_out() {
        let f = fixture();

        let resp = send(&f, request(Method::GET, "/gate/", Some("Bearer gate-key"))).await;
        assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_gate_poll_rejects_wrong_key() {
        let f = fixture();

        let resp = send(&f, request(Method::GET, "/gate", Some("alice-token"))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(f.state.tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_gate_poll_aborted_on_shutdown() {
        let f = fixture();
        f.shutdown_tx.send_replace(true);

        let result =
            handle_request(request(Method::GET, "/gate", Some("gate-key")), f.state.clone(), f.shutdown_tx.subscribe())
                .await;
        assert!(result.is_err());
        assert_eq!(f.state.tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_gate_poll_saturated() {
        let f = fixture();
        let _a = f.state.tracker.try_enter().unwrap();
        let _b = f.state.tracker.try_enter().unwrap();

        let resp = send(&f, request(Method::GET, "/gate", Some("gate-key"))).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_gate_poll_upgrade_required() {
        let f = fixture();
        f.state.firmware.install("2.0", b"image").await.unwrap();

        let mut req = request(Method::GET, "/gate", Some("gate-key"));
        req.headers_mut().insert(VERSION_HEADER, "1.0".parse().unwrap());
        let resp = send(&f, req).await;
        assert_eq!(resp.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(f.state.running_version.get().as_deref(), Some("1.0"));
    }

    #[tokio::test]
    async fn test_user_status_reports_gate() {
        let f = fixture();
        let _slot = f.state.tracker.try_enter().unwrap();
        f.state.signal.try_open();

        let resp = send(&f, request(Method::GET, "/user", Some("Bearer alice-token"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(value["user"]["name"], "alice");
        assert_eq!(value["gate_connected"], true);
        assert_eq!(value["open_pending"], true);
    }

    #[tokio::test]
    async fn test_firmware_download() {
        let f = fixture();

        // Nothing uploaded yet
        let resp = send(&f, request(Method::GET, "/gate/firmware", None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        f.state.firmware.install("3.1", b"abc").await.unwrap();

        let resp = send(&f, request(Method::GET, "/gate/firmware", None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CHECKSUM_HEADER).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(resp.headers().get(FIRMWARE_VERSION_HEADER).unwrap(), "3.1");
        assert_eq!(body_text(resp).await, "abc");

        let mut req = request(Method::GET, "/gate/firmware", None);
        req.headers_mut().insert(ESP32_VERSION_HEADER, "3.1".parse().unwrap());
        assert_eq!(send(&f, req).await.status(), StatusCode::NOT_MODIFIED);

        let mut req = request(Method::GET, "/gate/firmware", None);
        req.headers_mut().append(ESP32_VERSION_HEADER, "3.0".parse().unwrap());
        req.headers_mut().append(ESP32_VERSION_HEADER, "3.1".parse().unwrap());
        assert_eq!(send(&f, req).await.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_admin_routes_require_admin() {
        let f = fixture();

        let resp = send(&f, request(Method::GET, "/admin/status", None)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = send(&f, request(Method::GET, "/admin/status", Some("Bearer alice-token"))).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = send(&f, request(Method::GET, "/admin/status", Some("Bearer root-token"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(value["gate_capacity"], 2);
        assert_eq!(value["gate_connections"], 0);
        assert!(value["current_version"].is_null());
    }

    #[tokio::test]
    async fn test_admin_logs() {
        let f = fixture();
        send(&f, request(Method::PUT, "/user/open", Some("Bearer alice-token"))).await;

        let uri = format!("/admin/logs?user={}", f.resident);
        let resp = send(&f, request(Method::GET, &uri, Some("Bearer root-token"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);

        let encoded = format!("/admin/logs?user={}", f.resident.to_string().replace('-', "%2D"));
        let resp = send(&f, request(Method::GET, &encoded, Some("Bearer root-token"))).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp =
            send(&f, request(Method::GET, "/admin/logs?user=nope", Some("Bearer root-token"))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_firmware_upload() {
        let f = fixture();

        let req = Request::builder()
            .method(Method::PUT)
            .uri("/admin/firmware?version=4.0")
            .header(AUTHORIZATION, "Bearer root-token")
            .body(Full::new(Bytes::from_static(b"new image")))
            .unwrap();
        let resp = send(&f, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(f.state.firmware.current_version().await.unwrap().as_deref(), Some("4.0"));

        let req = Request::builder()
            .method(Method::PUT)
            .uri("/admin/firmware?version=../4.1")
            .header(AUTHORIZATION, "Bearer root-token")
            .body(Full::new(Bytes::from_static(b"x")))
            .unwrap();
        assert_eq!(send(&f, req).await.status(), StatusCode::UNPROCESSABLE_ENTITY);

        // Query values are percent-decoded before validation
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/admin/firmware?version=..%2F4.1")
            .header(AUTHORIZATION, "Bearer root-token")
            .body(Full::new(Bytes::from_static(b"x")))
            .unwrap();
        assert_eq!(send(&f, req).await.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let req = Request::builder()
            .method(Method::PUT)
            .uri("/admin/firmware?version=4.2%2Drc1")
            .header(AUTHORIZATION, "Bearer root-token")
            .body(Full::new(Bytes::from_static(b"rc image")))
            .unwrap();
        assert_eq!(send(&f, req).await.status(), StatusCode::OK);
        assert_eq!(f.state.firmware.current_version().await.unwrap().as_deref(), Some("4.2-rc1"));
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let f = fixture();
        send(&f, request(Method::PUT, "/user/open", Some("Bearer alice-token"))).await;

        let resp = send(&f, request(Method::GET, "/metrics", None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("gate_portal_open_requests_total 1"));
        assert!(text.contains("gate_portal_open_pending 1"));

        let resp = send(&f, request(Method::GET, "/health", None)).await;
        assert_eq!(body_text(resp).await, "ok");

        let resp = send(&f, request(Method::GET, "/nope", None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shutdown_future_waits_for_signal() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(shutdown_requested(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
