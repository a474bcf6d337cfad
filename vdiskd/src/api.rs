//! Simple HTTP control API for the device manager.
//!
//! Uses `std::net::TcpListener` with no external HTTP framework. One
//! request per connection, served in arrival order.
//!
//! Endpoints:
//!
//! - `GET /health`: liveness check
//! - `GET /devices`: summaries of attached devices (JSON)
//! - `POST /devices?kind=&size=&sector_size=&id=&path=&read_only=&reserve=&label=`: attach
//! - `DELETE /devices/<id>?force=<bool>`: detach
//! - `GET /devices/<id>/stats`: statistics snapshot (JSON)
//! - `POST /devices/<id>/resize?size=`: always refused
//! - `POST /shutdown`: stop serving; the daemon then unloads the registry

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;

use thiserror::Error;
use vdisk::{BackingKind, ControlSurface, DeviceId, DeviceParams, VdiskError};

/// Errors turned into HTTP error responses.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request could not be understood.
    #[error("{0}")]
    BadRequest(String),

    /// No route matches the path.
    #[error("no route for {0}")]
    NoRoute(String),

    /// The route exists but not for this method.
    #[error("method {method} not allowed on {path}")]
    MethodNotAllowed {
        /// The request method.
        method: String,
        /// The request path.
        path: String,
    },

    /// The device manager refused the operation.
    #[error(transparent)]
    Device(#[from] VdiskError),

    /// A response body could not be encoded.
    #[error("encoding response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ApiError {
    /// HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NoRoute(_) => 404,
            Self::MethodNotAllowed { .. } => 405,
            Self::Device(err) => device_status(err),
            Self::Encode(_) => 500,
        }
    }
}

/// Maps manager errors onto HTTP status codes.
fn device_status(err: &VdiskError) -> u16 {
    match err {
        VdiskError::InvalidParameter { .. } | VdiskError::OutOfRange { .. } => 400,
        VdiskError::NotFound { .. } => 404,
        VdiskError::AlreadyExists { .. }
        | VdiskError::Busy { .. }
        | VdiskError::Unsupported { .. } => 409,
        VdiskError::ResourceExhausted { .. } => 507,
        _ => 500,
    }
}

/// A response ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// JSON body.
    pub body: String,
}

impl Response {
    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            body: value.to_string(),
        }
    }
}

impl From<ApiError> for Response {
    fn from(err: ApiError) -> Self {
        Self::json(err.status(), &serde_json::json!({ "error": err.to_string() }))
    }
}

/// What the server loop should do after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep accepting connections.
    Continue,
    /// Stop serving.
    Shutdown,
}

/// Runs the HTTP API server until `POST /shutdown` (blocking).
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub fn run_api_server(control: &ControlSurface, port: u16) -> std::io::Result<()> {
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr)?;
    tracing::info!("control API listening on {addr}");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("accept error: {e}");
                continue;
            }
        };

        // Set a short read timeout so we don't block forever on slow clients
        let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(5)));

        match handle_request(&stream, control) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Shutdown) => {
                tracing::info!("shutdown requested");
                break;
            }
            Err(e) => tracing::debug!("request error: {e}"),
        }
    }
    Ok(())
}

/// Reads one HTTP request, dispatches it and writes the response.
fn handle_request(
    stream: &TcpStream,
    control: &ControlSurface,
) -> Result<Flow, Box<dyn std::error::Error>> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Drain remaining headers; bodies are not used.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
            break;
        }
    }

    // Parse: "METHOD /path?query HTTP/1.x"
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    let (response, flow) = match parts.as_slice() {
        [method, target, ..] => route(control, method, target),
        _ => (
            ApiError::BadRequest("malformed request line".to_string()).into(),
            Flow::Continue,
        ),
    };

    send_response(stream, &response)?;
    Ok(flow)
}

/// Dispatches a request to its handler.
pub fn route(control: &ControlSurface, method: &str, target: &str) -> (Response, Flow) {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let result = match (method, segments.as_slice()) {
        ("GET", ["health"]) => Ok(Response::json(200, &serde_json::json!({ "status": "ok" }))),
        ("POST", ["shutdown"]) => {
            let response = Response::json(200, &serde_json::json!({ "status": "shutting down" }));
            return (response, Flow::Shutdown);
        }
        ("GET", ["devices"]) => list_devices(control),
        ("POST", ["devices"]) => attach_device(control, query),
        ("DELETE", ["devices", id]) => detach_device(control, id, query),
        ("GET", ["devices", id, "stats"]) => device_stats(control, id),
        ("POST", ["devices", id, "resize"]) => resize_device(control, id, query),
        (_, ["health" | "shutdown" | "devices"] | ["devices", _] | ["devices", _, "stats" | "resize"]) => {
            Err(ApiError::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
            })
        }
        _ => Err(ApiError::NoRoute(path.to_string())),
    };

    (result.unwrap_or_else(Response::from), Flow::Continue)
}

/// `GET /devices`
fn list_devices(control: &ControlSurface) -> Result<Response, ApiError> {
    let devices = serde_json::to_value(control.list())?;
    Ok(Response::json(200, &devices))
}

/// `POST /devices?...`
fn attach_device(control: &ControlSurface, query: &str) -> Result<Response, ApiError> {
    let params = parse_device_params(&parse_query(query))?;
    let id = control.attach(params)?;
    Ok(Response::json(
        201,
        &serde_json::json!({ "id": id, "name": id.name() }),
    ))
}

/// `DELETE /devices/<id>?force=<bool>`
fn detach_device(control: &ControlSurface, id: &str, query: &str) -> Result<Response, ApiError> {
    let id = parse_id(id)?;
    let force = match parse_query(query).get("force") {
        Some(v) => parse_bool("force", v)?,
        None => false,
    };
    control.detach(id, force)?;
    Ok(Response::json(200, &serde_json::json!({ "detached": id })))
}

/// `GET /devices/<id>/stats`
fn device_stats(control: &ControlSurface, id: &str) -> Result<Response, ApiError> {
    let stats = control.stats(parse_id(id)?)?;
    Ok(Response::json(200, &serde_json::to_value(stats)?))
}

/// `POST /devices/<id>/resize?size=`
fn resize_device(control: &ControlSurface, id: &str, query: &str) -> Result<Response, ApiError> {
    let id = parse_id(id)?;
    let size = parse_query(query)
        .get("size")
        .map(|s| parse_size(s))
        .transpose()?
        .unwrap_or(0);
    control.resize(id, size)?;
    Ok(Response::json(200, &serde_json::json!({ "resized": id })))
}

/// Builds attach parameters from query-string pairs.
fn parse_device_params(query: &HashMap<String, String>) -> Result<DeviceParams, ApiError> {
    let kind: BackingKind = query
        .get("kind")
        .ok_or_else(|| ApiError::BadRequest("missing 'kind' parameter".to_string()))?
        .parse()
        .map_err(ApiError::BadRequest)?;

    let size_bytes = query.get("size").map(|s| parse_size(s)).transpose()?;
    let sector_size = match query.get("sector_size") {
        Some(s) => s
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid sector_size '{s}'")))?,
        None => DeviceParams::DEFAULT_SECTOR_SIZE,
    };
    let id = query.get("id").map(|s| parse_id(s)).transpose()?;
    let flag = |name: &str| match query.get(name) {
        Some(v) => parse_bool(name, v),
        None => Ok(false),
    };

    Ok(DeviceParams {
        kind,
        size_bytes,
        sector_size,
        id,
        path: query.get("path").map(PathBuf::from),
        read_only: flag("read_only")?,
        reserve: flag("reserve")?,
        label: query.get("label").cloned(),
    })
}

fn parse_id(s: &str) -> Result<DeviceId, ApiError> {
    s.strip_prefix("vd")
        .unwrap_or(s)
        .parse()
        .map(DeviceId)
        .map_err(|_| ApiError::BadRequest(format!("invalid device id '{s}'")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ApiError> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(ApiError::BadRequest(format!(
            "invalid boolean '{other}' for '{name}'"
        ))),
    }
}

/// Parses a byte count with an optional binary suffix (`k`, `m`, `g`, `t`).
pub fn parse_size(s: &str) -> Result<u64, ApiError> {
    let s = s.trim();
    let invalid = || ApiError::BadRequest(format!("invalid size '{s}'"));
    let (digits, shift) = match s.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&s[..s.len() - 1], 10),
        Some('m') => (&s[..s.len() - 1], 20),
        Some('g') => (&s[..s.len() - 1], 30),
        Some('t') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(1u64 << shift).ok_or_else(invalid)
}

/// Parses a query string into key-value pairs.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((percent_decode(k), percent_decode(v)))
        })
        .collect()
}

/// Decodes `%XX` escapes and `+` in a query component.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => match bytes
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                Some(b) => {
                    out.push(b);
                    i += 2;
                }
                None => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Writes an HTTP response.
fn send_response(
    mut stream: &TcpStream,
    response: &Response,
) -> Result<(), Box<dyn std::error::Error>> {
    let status_text = match response.status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        507 => "Insufficient Storage",
        _ => "Unknown",
    };

    write!(
        stream,
        "HTTP/1.1 {} {status_text}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        response.status,
        response.body.len(),
        response.body,
    )?;

    Ok(())
}
