//! Operator API.
//!
//! Loopback HTTP/1.1 on a plain std thread, one connection at a time. Every route except
//! `/health` requires the capability token as `Authorization: Bearer <hex>`.
//!
//! - `GET /health`
//! - `GET /pending`: the event awaiting a decision, 404 when idle
//! - `GET /events?limit=N`: newest resolved events
//! - `GET /stats`: arbiter counters and today's resolution counts
//! - `POST /respond`: JSON `HumanResponse`
//! - `GET /identities`: remembered people, without embeddings
//! - `DELETE /identities/<id>`: forget one person

use crate::arbiter::service::ArbiterHandle;
use crate::arbiter::{ArbiterError, HumanResponse};
use crate::event_log::EventLog;
use crate::gallery::{IdentityGallery, IdentityId};
use crate::{now_ms, start_of_day_ms};
use anyhow::{anyhow, Result};
use rand::RngCore;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_EVENTS_LIMIT: usize = 50;
const MAX_EVENTS_LIMIT: usize = 500;
const IDENTITY_PREFIX: &str = "/identities/";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8787".to_string(),
            token_path: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Random 32-byte bearer token, fixed for the life of the server.
#[derive(Clone)]
pub struct CapabilityToken {
    token: [u8; 32],
}

impl CapabilityToken {
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self { token }
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn validate(&self, presented: &str) -> Result<()> {
        let presented = parse_hex32(presented)?;
        let diff = presented
            .iter()
            .zip(self.token.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(anyhow!("capability token invalid"));
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    arbiter: ArbiterHandle,
    events: Arc<EventLog>,
    gallery: Arc<IdentityGallery>,
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        arbiter: ArbiterHandle,
        events: Arc<EventLog>,
        gallery: Arc<IdentityGallery>,
    ) -> Self {
        Self {
            cfg,
            arbiter,
            events,
            gallery,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let capability = CapabilityToken::generate();
        let token = capability.token_hex();
        match &self.cfg.token_path {
            Some(path) => write_token_file(path, &token)?,
            None => {
                log::warn!("api: no token path configured; set DOORMAN_API_TOKEN_PATH to persist");
                log::warn!("api: capability token (handle securely): {}", token);
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let token_path = self.cfg.token_path.clone();
        let join = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &self, &capability, shutdown_thread) {
                    log::error!("api stopped: {}", err);
                }
            })?;
        log::info!("api: listening on {}", addr);

        Ok(ApiHandle {
            addr,
            token,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    server: &ApiServer,
    capability: &CapabilityToken,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, server, capability) {
                    log::warn!("api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    server: &ApiServer,
    capability: &CapabilityToken,
) -> Result<()> {
    // accepted sockets can inherit non-blocking mode from the listener
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let _ = write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#);
            return Err(err);
        }
    };

    let expected_method = match request.path.as_str() {
        "/health" => {
            write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
            return Ok(());
        }
        "/pending" | "/events" | "/stats" | "/identities" => "GET",
        "/respond" => "POST",
        path if path.starts_with(IDENTITY_PREFIX) => "DELETE",
        _ => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
            return Ok(());
        }
    };
    if request.method != expected_method {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    if request.has_query_token() {
        write_json_response(
            &mut stream,
            400,
            r#"{"error":"token_query_param_not_allowed"}"#,
        )?;
        return Ok(());
    }

    let token = match request.bearer_token() {
        Some(token) => token,
        None => {
            write_json_response(&mut stream, 401, r#"{"error":"missing_token"}"#)?;
            return Ok(());
        }
    };
    if let Err(err) = capability.validate(&token) {
        write_json_response(&mut stream, 401, r#"{"error":"invalid_token"}"#)?;
        return Err(err);
    }

    match request.path.as_str() {
        "/pending" => match server.arbiter.pending() {
            Some(event) => write_json_value(&mut stream, 200, &serde_json::to_value(event)?),
            None => write_json_response(&mut stream, 404, r#"{"error":"nothing_pending"}"#),
        },
        "/events" => {
            let limit = match request.query_param("limit") {
                Some(raw) => match raw.parse::<usize>() {
                    Ok(limit) => limit.min(MAX_EVENTS_LIMIT),
                    Err(_) => {
                        return write_json_response(
                            &mut stream,
                            400,
                            r#"{"error":"invalid_limit"}"#,
                        );
                    }
                },
                None => DEFAULT_EVENTS_LIMIT,
            };
            let events = server.events.recent(limit)?;
            write_json_value(&mut stream, 200, &serde_json::to_value(events)?)
        }
        "/stats" => {
            let today = server.events.stats_since(start_of_day_ms(now_ms()))?;
            match server.arbiter.stats() {
                Ok(arbiter) => write_json_value(
                    &mut stream,
                    200,
                    &json!({ "arbiter": arbiter, "today": today }),
                ),
                Err(_) => write_json_response(&mut stream, 503, r#"{"error":"arbiter_stopped"}"#),
            }
        }
        "/identities" => write_json_value(
            &mut stream,
            200,
            &serde_json::to_value(server.gallery.snapshot().summaries())?,
        ),
        "/respond" => respond(&mut stream, server, &request.body),
        path => forget_identity(&mut stream, server, &path[IDENTITY_PREFIX.len()..]),
    }
}

fn forget_identity(stream: &mut TcpStream, server: &ApiServer, raw_id: &str) -> Result<()> {
    let id = match raw_id.parse::<IdentityId>() {
        Ok(id) => id,
        Err(_) => return write_json_response(stream, 400, r#"{"error":"invalid_identity_id"}"#),
    };
    match server.gallery.remove(id) {
        Ok(true) => write_json_value(stream, 200, &json!({ "removed": id })),
        Ok(false) => write_json_response(stream, 404, r#"{"error":"identity_not_found"}"#),
        Err(err) => {
            log::error!("api: could not remove identity {}: {}", id, err);
            write_json_response(stream, 503, r#"{"error":"gallery_unavailable"}"#)
        }
    }
}

fn respond(stream: &mut TcpStream, server: &ApiServer, body: &[u8]) -> Result<()> {
    let response: HumanResponse = match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(err) => {
            log::warn!("api: malformed response body: {}", err);
            return write_json_response(stream, 400, r#"{"error":"invalid_body"}"#);
        }
    };
    match server.arbiter.respond(response) {
        Ok(event) => write_json_value(stream, 200, &serde_json::to_value(event)?),
        Err(ArbiterError::StaleResponse { event_id, pending }) => write_json_value(
            stream,
            409,
            &json!({ "error": "stale_response", "event_id": event_id, "pending": pending }),
        ),
        Err(ArbiterError::Stopped) => {
            write_json_response(stream, 503, r#"{"error":"arbiter_stopped"}"#)
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };
    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if header_end + 4 + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_json_value(stream: &mut TcpStream, status: u16, value: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn query_param(&self, key: &str) -> Option<&str> {
        let query = self.raw_path.split('?').nth(1)?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    fn has_query_token(&self) -> bool {
        self.query_param("token").is_some()
    }
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_validates_only_itself() -> Result<()> {
        let token = CapabilityToken::generate();
        token.validate(&token.token_hex())?;
        assert!(token.validate(&CapabilityToken::generate().token_hex()).is_err());
        assert!(token.validate("abcd").is_err());
        assert!(token.validate("not hex").is_err());
        Ok(())
    }

    #[test]
    fn hex_tokens_are_64_chars() {
        assert_eq!(CapabilityToken::generate().token_hex().len(), 64);
    }
}
