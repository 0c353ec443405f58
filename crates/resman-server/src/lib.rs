//! HTTP front end for the resource manager.
//!
//! Routes live under `/api/resource-manager`. Transition submissions return
//! `202 Accepted` immediately; the transition itself runs in the background
//! and is tracked until it finishes so shutdown can wait for it.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use resman_core::{shutdown_requested, CoreError, ResourceManager, TaskHandle, TransitionRequest};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

pub const API_PREFIX: &str = "/api/resource-manager";

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind HTTP server on {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("failed to spawn server thread: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed API route. Path parameters are percent-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    Configuration,
    Transitions,
    Transition(String),
    TransitionStatus(String),
    Locations,
    Location(String),
    LocationInstances(String),
    Instance(String),
    Types,
    Type(String),
}

pub fn parse_route(path: &str) -> Option<Route> {
    if path == "/health" {
        return Some(Route::Health);
    }
    let rest = path.strip_prefix(API_PREFIX)?.trim_matches('/');
    let segments: Vec<String> = rest.split('/').map(percent_decode).collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    let route = match segments.as_slice() {
        ["configuration"] => Route::Configuration,
        ["lifecycle", "transitions"] => Route::Transitions,
        ["lifecycle", "transitions", id] => Route::Transition((*id).to_owned()),
        ["lifecycle", "transitions", id, "status"] => Route::TransitionStatus((*id).to_owned()),
        ["locations"] => Route::Locations,
        ["locations", name] => Route::Location((*name).to_owned()),
        ["locations", name, "instances"] => Route::LocationInstances((*name).to_owned()),
        ["resource-instances", id] => Route::Instance((*id).to_owned()),
        ["types"] => Route::Types,
        ["types", name] => Route::Type((*name).to_owned()),
        _ => return None,
    };
    Some(route)
}

/// Decode `%XX` escapes. Malformed escapes are kept verbatim.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let decoded = bytes
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| percent_decode(&v.replace('+', " ")))
        .filter(|v| !v.is_empty())
}

/// HTTP status for a manager error.
pub fn status_for(err: &CoreError) -> u16 {
    match err {
        CoreError::TypeNotFound(_)
        | CoreError::InstanceNotFound(_)
        | CoreError::TransitionNotFound(_) => 404,
        CoreError::TypeMissingFromRequest
        | CoreError::InvalidTransition(_)
        | CoreError::NoLocationInRequest
        | CoreError::UnknownLocationInRequest(_)
        | CoreError::MissingProperty(_)
        | CoreError::ResourceBusy(_) => 400,
        _ => 500,
    }
}

/// Short name of the error kind, reported as `details.detail`.
pub fn error_kind(err: &CoreError) -> &'static str {
    match err {
        CoreError::TypeNotFound(_) => "TypeNotFound",
        CoreError::TypeMissingFromRequest => "TypeMissingFromRequest",
        CoreError::InstanceNotFound(_) => "InstanceNotFound",
        CoreError::InvalidTransition(_) => "InvalidTransition",
        CoreError::NoLocationInRequest => "NoLocationInRequest",
        CoreError::UnknownLocationInRequest(_) => "UnknownLocationInRequest",
        CoreError::MissingProperty(_) => "MissingProperty",
        CoreError::ResourceBusy(_) => "ResourceBusy",
        CoreError::TransitionNotFound(_) => "TransitionNotFound",
        CoreError::Persistence(_) => "PersistenceFailure",
        CoreError::NoImageFound(_) => "NoImageFound",
        CoreError::NoContainerFound(_) => "NoContainerFound",
        _ => "InternalError",
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    localized_message: String,
    url: &'a str,
    details: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    detail: &'static str,
}

/// The manager plus the transitions it is still running.
pub struct App {
    manager: ResourceManager,
    in_flight: Mutex<Vec<TaskHandle>>,
}

impl App {
    pub fn new(manager: ResourceManager) -> Self {
        Self {
            manager,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    fn track(&self, handle: TaskHandle) {
        match self.in_flight.lock() {
            Ok(mut handles) => {
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(_) => warn!("in-flight list poisoned, not tracking request {}", handle.request_id()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or_default()
    }

    /// Block until every tracked transition has finished.
    pub fn drain(&self) {
        let handles = match self.in_flight.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };
        for handle in handles {
            let request_id = handle.request_id();
            match handle.wait() {
                Ok(record) => debug!("request {request_id} settled as {:?}", record.request_state),
                Err(e) => warn!("request {request_id}: {e}"),
            }
        }
    }
}

fn json_header() -> Option<Header> {
    Header::from_bytes("Content-Type", "application/json").ok()
}

fn respond_json(req: Request, status: u16, body: &impl Serialize) {
    let data = match serde_json::to_vec(body) {
        Ok(data) => data,
        Err(e) => {
            error!("failed to serialize response: {e}");
            let _ = req.respond(Response::empty(500));
            return;
        }
    };
    let mut response = Response::from_data(data).with_status_code(StatusCode(status));
    if let Some(header) = json_header() {
        response.add_header(header);
    }
    let _ = req.respond(response);
}

fn respond_message(req: Request, status: u16, url: &str, message: String, detail: &'static str) {
    let body = ErrorBody {
        localized_message: message,
        url,
        details: ErrorDetails { detail },
    };
    respond_json(req, status, &body);
}

fn respond_err(req: Request, url: &str, err: &CoreError) {
    respond_err_with_status(req, status_for(err), url, err);
}

fn respond_err_with_status(req: Request, status: u16, url: &str, err: &CoreError) {
    if status >= 500 {
        error!("{url}: {err}");
    } else {
        debug!("{url}: {err}");
    }
    respond_message(req, status, url, err.to_string(), error_kind(err));
}

fn respond_result<T: Serialize>(req: Request, url: &str, result: Result<T, CoreError>) {
    match result {
        Ok(value) => respond_json(req, 200, &value),
        Err(e) => respond_err(req, url, &e),
    }
}

fn read_body(req: &mut Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    if req.as_reader().read_to_end(&mut body).is_ok() {
        Some(body)
    } else {
        None
    }
}

fn parse_request_id(raw: &str) -> Result<u64, CoreError> {
    raw.parse()
        .map_err(|_| CoreError::InvalidTransition(format!("invalid request id: {raw}")))
}

fn handle_submit(app: &App, mut req: Request, url: &str) {
    let Some(body) = read_body(&mut req) else {
        respond_message(req, 500, url, "failed to read request body".to_owned(), "InternalError");
        return;
    };
    let request: TransitionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            respond_message(
                req,
                400,
                url,
                format!("invalid transition request: {e}"),
                "InvalidRequest",
            );
            return;
        }
    };
    match app.manager.submit(request) {
        Ok((response, handle)) => {
            info!("accepted transition request {}", response.request_id);
            app.track(handle);
            respond_json(req, 202, &response);
        }
        Err(e) => respond_err(req, url, &e),
    }
}

fn handle_transition(app: &App, req: Request, url: &str, raw_id: &str, summary: bool) {
    let request_id = match parse_request_id(raw_id) {
        Ok(id) => id,
        Err(e) => {
            respond_err_with_status(req, 404, url, &e);
            return;
        }
    };
    if summary {
        respond_result(req, url, app.manager.transition_status(request_id));
    } else {
        respond_result(req, url, app.manager.transition(request_id));
    }
}

fn handle_location(app: &App, req: Request, url: &str, name: &str, instance_type: Option<&str>, instances: bool) {
    let result = if instances {
        app.manager
            .search_instances(name, instance_type)
            .map(serde_json::to_value)
    } else {
        app.manager.location(name).map(serde_json::to_value)
    };
    match result {
        Ok(Ok(value)) => respond_json(req, 200, &value),
        Ok(Err(e)) => respond_err(req, url, &CoreError::Serialization(e)),
        Err(e @ CoreError::UnknownLocationInRequest(_)) => respond_err_with_status(req, 404, url, &e),
        Err(e) => respond_err(req, url, &e),
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(app: &App, req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url.as_str(), None),
    };
    let Some(route) = parse_route(path) else {
        respond_message(req, 404, &url, format!("no route for {path}"), "NotFound");
        return;
    };

    match (&method, route) {
        (Method::Get, Route::Health) => respond_json(req, 200, &serde_json::json!({"status": "ok"})),
        (Method::Get, Route::Configuration) => respond_json(req, 200, &app.manager.info()),
        (Method::Post, Route::Transitions) => handle_submit(app, req, &url),
        (Method::Get, Route::Transition(id)) => handle_transition(app, req, &url, &id, false),
        (Method::Get, Route::TransitionStatus(id)) => handle_transition(app, req, &url, &id, true),
        (Method::Get, Route::Locations) => respond_json(req, 200, &app.manager.locations()),
        (Method::Get, Route::Location(name)) => handle_location(app, req, &url, &name, None, false),
        (Method::Get, Route::LocationInstances(name)) => {
            let instance_type = query_param(query, "instanceType");
            handle_location(app, req, &url, &name, instance_type.as_deref(), true);
        }
        (Method::Get, Route::Instance(id)) => respond_result(req, &url, app.manager.instance(&id)),
        (Method::Get, Route::Types) => respond_result(req, &url, app.manager.resource_types()),
        (Method::Put, Route::Types) => respond_result(req, &url, app.manager.reload_types()),
        (Method::Get, Route::Type(name)) => respond_result(req, &url, app.manager.resource_type(&name)),
        _ => respond_message(req, 405, &url, format!("{method} not allowed"), "MethodNotAllowed"),
    }
}

pub fn bind(addr: &str) -> Result<Server, ServerError> {
    Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })
}

/// Serve requests until shutdown is requested, then wait for in-flight
/// transitions to finish.
pub fn serve(app: &App, server: &Server) {
    while !shutdown_requested() {
        match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => handle_request(app, request),
            Ok(None) => {}
            Err(e) => {
                error!("failed to receive request: {e}");
                break;
            }
        }
    }
    info!("shutting down, waiting for {} in-flight transitions", app.in_flight());
    app.drain();
}

/// A test helper that serves an [`App`] on `127.0.0.1` at a random port in a
/// background thread. Dropping it stops the server.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    app: Arc<App>,
    server: Arc<Server>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(manager: ResourceManager) -> Result<Self, ServerError> {
        let server = Arc::new(bind("127.0.0.1:0")?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| ServerError::Bind {
                addr: "127.0.0.1:0".to_owned(),
                reason: "not an IP address".to_owned(),
            })?;
        let app = Arc::new(App::new(manager));

        let srv = Arc::clone(&server);
        let served = Arc::clone(&app);
        let handle = thread::Builder::new()
            .name("resman-test-server".to_owned())
            .spawn(move || {
                for request in srv.incoming_requests() {
                    handle_request(&served, request);
                }
            })?;

        Ok(Self {
            url: format!("http://127.0.0.1:{port}{API_PREFIX}"),
            port,
            app,
            server,
            handle: Some(handle),
        })
    }

    pub fn app(&self) -> &App {
        &self.app
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.app.drain();
    }
}
