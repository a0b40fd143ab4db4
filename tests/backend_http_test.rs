//! HttpBackend against an in-process HTTP server

use attendance_controller::domain::CardId;
use attendance_controller::io::{AttendanceUpdate, BackendClient, BackendError, HttpBackend};
use bytes::Bytes;
use chrono::{Local, NaiveDate, TimeZone};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const API_KEY: &str = "test-key";

/// Request seen by the server: method, path, body as JSON (or Null)
type Seen = (Method, String, Value);

#[derive(Default)]
struct Server {
    seen: Mutex<Vec<Seen>>,
    upload_sizes: Mutex<Vec<usize>>,
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    server: Arc<Server>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let auth_ok = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", API_KEY));
    if !auth_ok {
        return Ok(json_response(StatusCode::UNAUTHORIZED, json!({"message": "Unauthorized"})));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
    server.seen.lock().push((method.clone(), path.clone(), value));

    let response = match (method, path.as_str()) {
        (Method::GET, "/schedule/B-204") => json_response(
            StatusCode::OK,
            json!([
                {"id": "math", "name": "Math", "startTime": "09:00", "endTime": "10:30", "professorId": "p1"},
                {"id": "art", "startTime": "11:00:00", "endTime": "12:00:00"}
            ]),
        ),
        (Method::POST, "/session") => json_response(StatusCode::CREATED, json!({"id": "session-1"})),
        (Method::GET, "/class/math/students") => json_response(
            StatusCode::OK,
            json!(["e2:ee:c8:01", {"studentId": "04A1B2C3"}, "not-a-card"]),
        ),
        (Method::POST, "/session/session-1/attendance") => {
            json_response(StatusCode::CREATED, json!({"id": "record-7"}))
        }
        (Method::PUT, "/attendance/record-7") => json_response(StatusCode::OK, json!({})),
        (Method::PUT, "/attendance/missing") => {
            json_response(StatusCode::NOT_FOUND, json!({"message": "no such record"}))
        }
        (Method::POST, "/image") => {
            server.upload_sizes.lock().push(body.len());
            json_response(StatusCode::CREATED, json!({"message": "https://cdn.test/portrait.jpg"}))
        }
        (Method::POST, "/log") => json_response(StatusCode::CREATED, json!({"message": "ok"})),
        _ => json_response(StatusCode::NOT_FOUND, json!({"message": "Not Found"})),
    };
    Ok(response)
}

async fn start_server() -> (SocketAddr, Arc<Server>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::default());
    let state = server.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let state = state.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, state.clone()));
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
            });
        }
    });

    (addr, server)
}

fn client(addr: SocketAddr, api_key: &str) -> HttpBackend {
    HttpBackend::new(&format!("http://{}/", addr), api_key, "B-204", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_schedule_session_and_roster() {
    let (addr, server) = start_server().await;
    let backend = client(addr, API_KEY);

    let classes = backend.get_schedule("B-204").await.unwrap();
    assert_eq!(classes.len(), 2);
    assert_eq!(classes[0].class_id, "math");
    assert_eq!(classes[0].professor_id.as_deref(), Some("p1"));
    assert_eq!(classes[1].name, None);

    let day = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
    let start = day.and_time(classes[0].start_time);
    let end = day.and_time(classes[0].end_time);
    let session_id = backend.create_session(&classes[0], start, end).await.unwrap();
    assert_eq!(session_id, "session-1");

    let roster = backend.get_roster("math").await.unwrap();
    assert_eq!(roster, vec![CardId::parse("E2EEC801").unwrap(), CardId::parse("04a1b2c3").unwrap()]);

    let seen = server.seen.lock();
    let (_, _, session_body) = seen.iter().find(|(_, path, _)| path == "/session").unwrap();
    assert_eq!(session_body["classId"], "math");
    assert_eq!(session_body["professorId"], "p1");
    assert!(session_body["startTime"].as_str().unwrap().starts_with("2026-10-19T09:00"));
}

#[tokio::test]
async fn test_placeholder_and_update() {
    let (addr, server) = start_server().await;
    let backend = client(addr, API_KEY);
    let card = CardId::parse("E2EEC801").unwrap();

    let record_id = backend.create_attendance_placeholder("session-1", &card).await.unwrap();
    assert_eq!(record_id, "record-7");

    let update = AttendanceUpdate {
        check_in: Local.with_ymd_and_hms(2026, 10, 19, 9, 5, 0).unwrap(),
        portrait_url: Some("https://cdn.test/portrait.jpg".to_string()),
        identified_id: "E2EEC801".to_string(),
        flagged: false,
    };
    backend.update_attendance("record-7", &update).await.unwrap();

    let err = backend.update_attendance("missing", &update).await.unwrap_err();
    assert!(matches!(err, BackendError::Status { status: 404, .. }));
    assert!(!err.is_fatal());

    let seen = server.seen.lock();
    let (_, _, placeholder) = &seen[0];
    assert_eq!(placeholder["studentId"], "E2EEC801");
    assert!(placeholder["checkIn"].is_null());
    let (method, _, body) = &seen[1];
    assert_eq!(*method, Method::PUT);
    assert_eq!(body["FRIdentifiedId"], "E2EEC801");
    assert_eq!(body["flagged"], false);
}

#[tokio::test]
async fn test_upload_image_returns_url() {
    let (addr, server) = start_server().await;
    let backend = client(addr, API_KEY);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("E2EEC801_20261019_090500.jpg");
    std::fs::write(&path, vec![0xFFu8; 2048]).unwrap();

    let url = backend.upload_image(&path).await.unwrap();
    assert_eq!(url, "https://cdn.test/portrait.jpg");
    // multipart framing adds to the payload
    assert!(server.upload_sizes.lock()[0] > 2048);

    let missing = backend.upload_image(&dir.path().join("missing.jpg")).await.unwrap_err();
    assert!(matches!(missing, BackendError::Io(_)));
}

#[tokio::test]
async fn test_log_entry_shape() {
    let (addr, server) = start_server().await;
    let backend = client(addr, API_KEY);

    backend.log("card_scanned", json!({"card": "E2EEC801"})).await.unwrap();

    let seen = server.seen.lock();
    let (_, path, body) = &seen[0];
    assert_eq!(path, "/log");
    assert_eq!(body["user_id"], "Controller");
    assert_eq!(body["action"], "card_scanned");
    assert_eq!(body["entity_id"], "B-204");
    assert_eq!(body["metadata"]["card"], "E2EEC801");
}

#[tokio::test]
async fn test_bad_credentials_are_fatal() {
    let (addr, _server) = start_server().await;
    let backend = client(addr, "wrong-key");

    let err = backend.get_schedule("B-204").await.unwrap_err();
    assert!(matches!(err, BackendError::Unauthorized(401)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_unreachable_backend_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(addr, API_KEY).get_schedule("B-204").await.unwrap_err();
    assert!(matches!(err, BackendError::Transport(_)));
    assert!(!err.is_fatal());
}
