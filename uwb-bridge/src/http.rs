use http_body_util::BodyExt;
use hyper::{Method, StatusCode};
use tracing::{debug, info, warn};

use crate::anchor_config::AnchorConfig;
use crate::api::Bridge;
use crate::{HttpResponse, HttpResult};

pub async fn run_server(addr: &str, bridge: Bridge) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{addr}");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "connection");
                tokio::task::spawn(handle_connection(stream, bridge.clone()));
            }
            Err(e) => {
                warn!("failed to accept: {e:?}");
                continue;
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, bridge: Bridge) {
    let io = hyper_util::rt::TokioIo::new(stream);

    let builder =
        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::tokio::TokioExecutor::new());
    let conn = builder.serve_connection(
        io,
        hyper::service::service_fn(|r| handle_request(r, bridge.clone())),
    );

    if let Err(e) = conn.await {
        warn!("connection error: {e:?}");
    }
}

async fn handle_request(r: hyper::Request<hyper::body::Incoming>, bridge: Bridge) -> HttpResult {
    let method = r.method().clone();
    let path = r.uri().path().to_string();
    let body = match r.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => return uwb_bridge::bad_request!("failed to read body: {e}"),
    };
    route(&method, &path, &body, &bridge).await
}

pub async fn route(method: &Method, path: &str, body: &[u8], bridge: &Bridge) -> HttpResult {
    match (method, path) {
        (&Method::GET, "/api/config") => match bridge.get_config().await {
            Ok(readout) => json(readout),
            Err(e) => link_error(&e),
        },
        (&Method::POST, "/api/config") => {
            let config: AnchorConfig = match serde_json::from_slice(body) {
                Ok(config) => config,
                Err(e) => return uwb_bridge::bad_request!("invalid config: {e}"),
            };
            if config.is_empty() {
                return uwb_bridge::bad_request!("no fields to set");
            }
            match bridge.set_config(&config).await {
                Ok(outcome) => json(outcome),
                Err(e) => link_error(&e),
            }
        }
        (&Method::GET, "/api/status") => json(bridge.status()),
        (_, "/api/config" | "/api/status") => {
            error_(StatusCode::METHOD_NOT_ALLOWED, format!("{method} not allowed"))
        }
        (_, t) => uwb_bridge::not_found!("not found: {t}"),
    }
}

/// HTTP status for a failed link operation
pub fn link_error_status(e: &uwb_link::Error) -> StatusCode {
    use uwb_link::Error;

    match e {
        Error::LinkNotReady => StatusCode::SERVICE_UNAVAILABLE,
        Error::Busy(_) => StatusCode::CONFLICT,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::LinkDropped(_) => StatusCode::BAD_GATEWAY,
        Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::DiscoveryIncomplete { .. } | Error::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn link_error(e: &uwb_link::Error) -> HttpResult {
    error_(link_error_status(e), e.to_string())
}

pub fn json<T: serde::Serialize>(o: T) -> HttpResult {
    json_with_status(o, StatusCode::OK)
}

pub fn json_with_status<T: serde::Serialize>(o: T, status: StatusCode) -> HttpResult {
    let bytes = match serde_json::to_vec(&o) {
        Ok(v) => v,
        Err(e) => return server_error_(format!("failed to serialize json: {e:?}")),
    };
    let mut r = bytes_to_resp(bytes, status)?;
    r.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(r)
}

/// `{"ok": false, "error": m}`
pub fn error_(status: StatusCode, m: String) -> HttpResult {
    if status.is_server_error() {
        warn!(%status, "{m}");
    } else {
        debug!(%status, "{m}");
    }
    json_with_status(serde_json::json!({ "ok": false, "error": m }), status)
}

pub fn server_error_(s: String) -> HttpResult {
    bytes_to_resp(s.into_bytes(), StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn bytes_to_resp(bytes: Vec<u8>, status: StatusCode) -> HttpResult {
    let mut r: HttpResponse = hyper::Response::new(
        http_body_util::Full::new(hyper::body::Bytes::from(bytes))
            .map_err(|e| match e {})
            .boxed(),
    );
    *r.status_mut() = status;
    Ok(r)
}

pub fn not_found_(m: String) -> HttpResult {
    error_(StatusCode::NOT_FOUND, m)
}

pub fn bad_request_(m: String) -> HttpResult {
    error_(StatusCode::BAD_REQUEST, m)
}

#[macro_export]
macro_rules! not_found {
    ($($t:tt)*) => {{
        uwb_bridge::http::not_found_(format!($($t)*))
    }};
}

#[macro_export]
macro_rules! bad_request {
    ($($t:tt)*) => {{
        uwb_bridge::http::bad_request_(format!($($t)*))
    }};
}
