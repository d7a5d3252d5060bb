//! HTTP front end for the build orchestrator.
//!
//! Routes:
//!
//! | Method | Path                        | Result                              |
//! |--------|-----------------------------|-------------------------------------|
//! | POST   | `/builds`                   | submit a `BuildRequest`, 202        |
//! | GET    | `/builds`                   | every build record                  |
//! | GET    | `/builds/{id}`              | one build record                    |
//! | POST   | `/builds/{id}/cancel`       | cancel a queued or building build   |
//! | GET    | `/builds/{id}/result`       | download location of the installer  |
//! | GET    | `/builds/{id}/installer`    | the installer archive itself        |
//! | GET    | `/health`                   | liveness                            |
//!
//! Errors are JSON objects `{"error": "..."}`. Unknown ids answer 404,
//! operations that do not fit the build's state answer 409.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use ferry_core::{CoreError, Orchestrator};
use ferry_store::StoreError;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::thread::JoinHandle;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

/// Largest request body accepted by `POST /builds`.
pub const MAX_REQUEST_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Health,
    Builds,
    Build(&'a str),
    Cancel(&'a str),
    Result(&'a str),
    Installer(&'a str),
}

/// Map a request path (query string ignored) to a route.
pub fn parse_route(url: &str) -> Option<Route<'_>> {
    let path = url.split_once('?').map_or(url, |(p, _)| p);
    let path = path.strip_suffix('/').unwrap_or(path);
    if path == "/health" {
        return Some(Route::Health);
    }
    if path == "/builds" {
        return Some(Route::Builds);
    }
    let rest = path.strip_prefix("/builds/")?;
    let (id, action) = match rest.split_once('/') {
        Some((id, action)) => (id, Some(action)),
        None => (rest, None),
    };
    if id.is_empty() {
        return None;
    }
    match action {
        None => Some(Route::Build(id)),
        Some("cancel") => Some(Route::Cancel(id)),
        Some("result") => Some(Route::Result(id)),
        Some("installer") => Some(Route::Installer(id)),
        Some(_) => None,
    }
}

/// HTTP status for an orchestrator error.
pub fn status_for(err: &CoreError) -> u16 {
    match err {
        CoreError::Store(StoreError::NotFound { .. }) => 404,
        CoreError::Store(StoreError::InvalidName(_)) | CoreError::Schema(_) => 400,
        CoreError::InvalidState { .. }
        | CoreError::NotReady { .. }
        | CoreError::InvalidTransition { .. }
        | CoreError::Store(StoreError::Conflict(_)) => 409,
        CoreError::ShuttingDown => 503,
        _ => 500,
    }
}

fn with_header<R: Read>(resp: Response<R>, name: &str, value: &str) -> Response<R> {
    match Header::from_bytes(name, value) {
        Ok(header) => resp.with_header(header),
        Err(()) => resp,
    }
}

fn respond_json(req: Request, code: u16, value: &impl Serialize) {
    let (code, body) = match serde_json::to_vec(value) {
        Ok(body) => (code, body),
        Err(e) => {
            error!("response serialization failed: {e}");
            (500, br#"{"error":"serialization failed"}"#.to_vec())
        }
    };
    let resp = Response::from_data(body).with_status_code(StatusCode(code));
    let _ = req.respond(with_header(resp, "Content-Type", "application/json"));
}

fn respond_err(req: Request, code: u16, msg: &str) {
    respond_json(req, code, &serde_json::json!({ "error": msg }));
}

fn respond_core_err(req: Request, err: &CoreError) {
    let code = status_for(err);
    if code >= 500 {
        error!("{} {}: {err}", req.method(), req.url());
    } else {
        debug!("{} {}: {err}", req.method(), req.url());
    }
    respond_err(req, code, &err.to_string());
}

fn read_body(req: &mut Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    req.as_reader()
        .take(MAX_REQUEST_BYTES + 1)
        .read_to_end(&mut body)
        .ok()?;
    Some(body)
}

fn handle_submit(orchestrator: &Orchestrator, mut req: Request) {
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 400, "failed to read request body");
        return;
    };
    if body.len() as u64 > MAX_REQUEST_BYTES {
        respond_err(req, 413, "request body too large");
        return;
    }
    let request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            respond_err(req, 400, &format!("invalid build request: {e}"));
            return;
        }
    };
    match orchestrator.submit(request) {
        Ok(id) => {
            info!("POST /builds: queued {id}");
            respond_json(
                req,
                202,
                &serde_json::json!({ "id": id, "status": "queued" }),
            );
        }
        Err(e) => respond_core_err(req, &e),
    }
}

fn handle_installer(orchestrator: &Orchestrator, req: Request, id: &str) {
    let result = match orchestrator.result(id) {
        Ok(result) => result,
        Err(e) => {
            respond_core_err(req, &e);
            return;
        }
    };
    match File::open(&result.path) {
        Ok(file) => {
            info!("GET installer for {id}");
            let resp = with_header(Response::from_file(file), "Content-Type", "application/gzip");
            let disposition = format!("attachment; filename=\"{id}-installer.tar.gz\"");
            let _ = req.respond(with_header(resp, "Content-Disposition", &disposition));
        }
        Err(e) => {
            warn!("installer for {id} missing at {}: {e}", result.path.display());
            respond_err(req, 410, "installer is no longer available");
        }
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(orchestrator: &Orchestrator, req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let Some(route) = parse_route(&url) else {
        respond_err(req, 404, "not found");
        return;
    };
    match (route, &method) {
        (Route::Health, Method::Get) => {
            respond_json(
                req,
                200,
                &serde_json::json!({
                    "status": "ok",
                    "active_builds": orchestrator.active_builds(),
                }),
            );
        }
        (Route::Builds, Method::Get) => match orchestrator.list() {
            Ok(builds) => respond_json(req, 200, &builds),
            Err(e) => respond_core_err(req, &e),
        },
        (Route::Builds, Method::Post) => handle_submit(orchestrator, req),
        (Route::Build(id), Method::Get) => match orchestrator.status(id) {
            Ok(build) => respond_json(req, 200, &build),
            Err(e) => respond_core_err(req, &e),
        },
        (Route::Cancel(id), Method::Post) => match orchestrator.cancel(id) {
            Ok(build) => {
                info!("POST cancel {id}: {}", build.status);
                respond_json(req, 200, &build);
            }
            Err(e) => respond_core_err(req, &e),
        },
        (Route::Result(id), Method::Get) => match orchestrator.result(id) {
            Ok(result) => respond_json(req, 200, &result),
            Err(e) => respond_core_err(req, &e),
        },
        (Route::Installer(id), Method::Get) => handle_installer(orchestrator, req, id),
        _ => respond_err(req, 405, "method not allowed"),
    }
}

/// Serve until `stop` returns true, checking it between requests.
pub fn serve(server: &Server, orchestrator: &Orchestrator, stop: impl Fn() -> bool) {
    let tick = std::time::Duration::from_millis(250);
    while !stop() {
        match server.recv_timeout(tick) {
            Ok(Some(request)) => handle_request(orchestrator, request),
            Ok(None) => {}
            Err(e) => {
                error!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Bind `addr` and serve until `stop` returns true.
pub fn run_server(
    orchestrator: &Orchestrator,
    addr: &str,
    stop: impl Fn() -> bool,
) -> Result<(), String> {
    let server = Server::http(addr).map_err(|e| format!("failed to bind {addr}: {e}"))?;
    info!("listening on {addr}");
    serve(&server, orchestrator, stop);
    Ok(())
}

/// A test helper that serves an orchestrator on a random port in a background thread.
///
/// The server listens on `127.0.0.1:{port}`. Dropping the `TestServer`
/// unblocks the listener, joins the thread and shuts the orchestrator down.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Binds to `127.0.0.1:0` (random port).
    pub fn start(orchestrator: Orchestrator) -> Result<Self, String> {
        let server = Arc::new(
            Server::http("127.0.0.1:0").map_err(|e| format!("failed to bind test server: {e}"))?,
        );
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| "test server is not bound to an IP address".to_owned())?;
        let url = format!("http://127.0.0.1:{port}");

        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&orchestrator, request);
            }
            orchestrator.shutdown();
        });

        Ok(Self {
            url,
            port,
            server,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
