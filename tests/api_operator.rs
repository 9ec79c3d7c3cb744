use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use doorman::api::{ApiConfig, ApiHandle, ApiServer};
use doorman::{
    ArbiterConfig, ArbiterHandle, ArbiterService, BoundingBox, Candidate, Category,
    DecisionArbiter, DetectionEvent, DetectionId, EventLog, FaceEmbedding, Identity,
    IdentityGallery, InMemoryStore, LogDispatch, MatchResult, Resolution, RetryPolicy,
};

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

struct TestApi {
    gallery: Arc<IdentityGallery>,
    service: Option<ArbiterService>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        Self::with_identities(Vec::new())
    }

    fn with_identities(identities: Vec<Identity>) -> Result<Self> {
        let store = Arc::new(InMemoryStore::with_identities(identities));
        let gallery = Arc::new(IdentityGallery::load(
            store.clone(),
            2,
            RetryPolicy::none(),
        )?);
        let events = Arc::new(EventLog::new(store, RetryPolicy::none()));
        let arbiter = DecisionArbiter::new(
            ArbiterConfig::default(),
            Arc::clone(&gallery),
            Arc::clone(&events),
            Box::new(LogDispatch),
        );
        let service = ArbiterService::spawn(arbiter, 8)?;

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        };
        let api_handle =
            ApiServer::new(api_config, service.handle(), events, Arc::clone(&gallery)).spawn()?;

        Ok(Self {
            gallery,
            service: Some(service),
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn arbiter(&self) -> ArbiterHandle {
        self.service
            .as_ref()
            .expect("arbiter service should be running")
            .handle()
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<(String, String)> {
        let token = &self.handle().token;
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer {token}\r\nContent-Length: {len}\r\n\r\n{body}",
            len = body.len()
        );
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn submit_visitor(&self, id: u64) -> Result<()> {
        let detection_id = DetectionId {
            frame_id: id,
            index: 0,
        };
        let arbiter = self.arbiter();
        arbiter.submit(Candidate {
            event: DetectionEvent {
                id,
                frame_id: id,
                bbox: BoundingBox::new(0, 0, 8, 16),
                person_identity: MatchResult::no_match(detection_id),
                is_known: false,
                category: Category::Unknown,
                display_name: None,
                confidence: 0.8,
                created_at: doorman::now_ms(),
                resolution: Resolution::Pending,
                resolved_at: None,
                persisted_identity: None,
                note: None,
            },
            embedding: FaceEmbedding::new(detection_id, vec![0.6, 0.8]),
            snapshot: None,
            speech: None,
        })?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while arbiter.pending().map(|e| e.id) != Some(id) {
            assert!(Instant::now() < deadline, "event {} never became pending", id);
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
        if let Some(service) = self.service.take() {
            service.shutdown().expect("failed to stop arbiter");
        }
    }
}

#[test]
fn api_health_endpoint_is_public() -> Result<()> {
    let api = TestApi::new()?;

    let mut stream = TcpStream::connect(api.handle().addr)?;
    let request = "GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n";
    stream.write_all(request.as_bytes())?;
    let (headers, body) = read_response(&mut stream)?;
    assert!(headers.contains("200 OK"));
    assert!(body.contains(r#""status":"ok""#));

    Ok(())
}

#[test]
fn api_rejects_missing_and_wrong_tokens() -> Result<()> {
    let api = TestApi::new()?;

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.write_all(b"GET /pending HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let (headers, body) = read_response(&mut stream)?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(body.contains("missing_token"));

    let mut stream = TcpStream::connect(api.handle().addr)?;
    let wrong = "00".repeat(32);
    let request =
        format!("GET /pending HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer {wrong}\r\n\r\n");
    stream.write_all(request.as_bytes())?;
    let (headers, body) = read_response(&mut stream)?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(body.contains("invalid_token"));

    Ok(())
}

#[test]
fn api_rejects_token_in_query_string() -> Result<()> {
    let api = TestApi::new()?;
    let path = format!("/events?token={}", api.handle().token);
    let (headers, body) = api.request("GET", &path, None)?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("token_query_param_not_allowed"));
    Ok(())
}

#[test]
fn api_reports_nothing_pending_when_idle() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.request("GET", "/pending", None)?;
    assert!(headers.contains("404 Not Found"));
    assert!(body.contains("nothing_pending"));
    Ok(())
}

#[test]
fn api_respond_resolves_pending_event_once() -> Result<()> {
    let api = TestApi::new()?;
    api.submit_visitor(5)?;

    let (headers, body) = api.request("GET", "/pending", None)?;
    assert!(headers.contains("200 OK"));
    let pending: Value = serde_json::from_str(&body)?;
    assert_eq!(pending["id"], 5);
    assert_eq!(pending["resolution"], "pending");

    let (headers, body) = api.request(
        "POST",
        "/respond",
        Some(r#"{"event_id": 5, "action": "allow", "persist": true, "display_name": "Ana"}"#),
    )?;
    assert!(headers.contains("200 OK"), "{}", headers);
    let resolved: Value = serde_json::from_str(&body)?;
    assert_eq!(resolved["resolution"], "allowed");
    assert!(resolved["persisted_identity"].is_u64());

    let (headers, body) = api.request(
        "POST",
        "/respond",
        Some(r#"{"event_id": 5, "action": "deny"}"#),
    )?;
    assert!(headers.contains("409 Conflict"));
    let stale: Value = serde_json::from_str(&body)?;
    assert_eq!(stale["error"], "stale_response");
    assert!(stale["pending"].is_null());

    let (headers, body) = api.request("GET", "/events?limit=10", None)?;
    assert!(headers.contains("200 OK"));
    let events: Value = serde_json::from_str(&body)?;
    let events = events.as_array().expect("event list");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["id"], 5);

    let (headers, body) = api.request("GET", "/stats", None)?;
    assert!(headers.contains("200 OK"));
    let stats: Value = serde_json::from_str(&body)?;
    assert_eq!(stats["arbiter"]["allowed"], 1);
    assert_eq!(stats["arbiter"]["stale_responses"], 1);
    assert_eq!(stats["today"]["allowed"], 1);

    Ok(())
}

#[test]
fn api_rejects_malformed_bodies_and_wrong_methods() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.request("POST", "/respond", Some(r#"{"event_id": "x"}"#))?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("invalid_body"));

    let (headers, _) = api.request("GET", "/respond", None)?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = api.request("DELETE", "/events", None)?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, body) = api.request("GET", "/events?limit=many", None)?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("invalid_limit"));

    let (headers, _) = api.request("GET", "/nope", None)?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

fn known(id: u64, name: &str, category: Category, embedding: Vec<f32>) -> Identity {
    Identity {
        id,
        display_name: name.to_string(),
        embedding,
        category,
        photo_reference: None,
    }
}

#[test]
fn api_lists_identities_without_embeddings() -> Result<()> {
    let api = TestApi::with_identities(vec![
        known(2, "Bo", Category::Delivery, vec![0.0, 1.0]),
        known(1, "Ana", Category::Known, vec![1.0, 0.0]),
    ])?;

    let (headers, body) = api.request("GET", "/identities", None)?;
    assert!(headers.contains("200 OK"));
    let listed: Value = serde_json::from_str(&body)?;
    let listed = listed.as_array().expect("identity list");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["id"], 1);
    assert_eq!(listed[0]["display_name"], "Ana");
    assert_eq!(listed[1]["category"], "delivery");
    assert!(listed.iter().all(|identity| identity.get("embedding").is_none()));
    Ok(())
}

#[test]
fn api_deletes_identity_once() -> Result<()> {
    let api = TestApi::with_identities(vec![
        known(1, "Ana", Category::Known, vec![1.0, 0.0]),
        known(2, "Bo", Category::Known, vec![0.0, 1.0]),
    ])?;

    let (headers, body) = api.request("DELETE", "/identities/1", None)?;
    assert!(headers.contains("200 OK"), "{}", headers);
    let removed: Value = serde_json::from_str(&body)?;
    assert_eq!(removed["removed"], 1);
    assert!(api.gallery.snapshot().get(1).is_none());
    assert!(api.gallery.snapshot().get(2).is_some());

    let (headers, body) = api.request("DELETE", "/identities/1", None)?;
    assert!(headers.contains("404 Not Found"));
    assert!(body.contains("identity_not_found"));

    let (_, body) = api.request("GET", "/identities", None)?;
    let listed: Value = serde_json::from_str(&body)?;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    Ok(())
}

#[test]
fn api_identity_routes_check_method_id_and_token() -> Result<()> {
    let api = TestApi::with_identities(vec![known(1, "Ana", Category::Known, vec![1.0, 0.0])])?;

    let (headers, body) = api.request("DELETE", "/identities/ana", None)?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("invalid_identity_id"));

    let (headers, _) = api.request("GET", "/identities/1", None)?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = api.request("DELETE", "/identities", None)?;
    assert!(headers.contains("405 Method Not Allowed"));

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.write_all(b"DELETE /identities/1 HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let (headers, _) = read_response(&mut stream)?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(api.gallery.snapshot().get(1).is_some());
    Ok(())
}
