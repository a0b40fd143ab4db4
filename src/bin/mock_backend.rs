//! Mock attendance backend
//!
//! In-memory HTTP server implementing the routes the controller calls, for
//! bench testing without the real backend.
//!
//! Behavior:
//! 1. Serves one class for the configured room covering the whole day
//! 2. Every card in `--students` is on the class roster
//! 3. Sessions, placeholders and check-ins are kept in memory and can be
//!    inspected at `GET /state`
//! 4. Requests without `Authorization: Bearer <api-key>` get 401
//!
//! Usage:
//!   cargo run --bin mock-backend -- --port 8080 --students E2EEC801,04A1B2C3

use bytes::Bytes;
use clap::Parser;
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
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock attendance backend for local testing")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Bearer token the controller must present
    #[arg(long, default_value = "dev-key")]
    api_key: String,

    /// Class id served for every room
    #[arg(long, default_value = "demo-class")]
    class_id: String,

    /// Comma-separated card ids on the roster
    #[arg(long, value_delimiter = ',', default_value = "E2EEC801")]
    students: Vec<String>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    sessions: Vec<Value>,
    attendance: Vec<Value>,
    images: u64,
    logs: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

struct Backend {
    args: Args,
    state: Mutex<State>,
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

fn authorized(req: &Request<hyper::body::Incoming>, api_key: &str) -> bool {
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == api_key)
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    backend: Arc<Backend>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if !authorized(&req, &backend.args.api_key) {
        println!("[MOCK] 401 {} {}", req.method(), req.uri().path());
        return Ok(json_response(StatusCode::UNAUTHORIZED, json!({"message": "Unauthorized"})));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            eprintln!("[MOCK] Failed to read body: {}", e);
            return Ok(json_response(StatusCode::BAD_REQUEST, json!({"message": "bad body"})));
        }
    };
    let json_body = || serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["schedule", room]) => {
            println!("[MOCK] Schedule requested for room {}", room);
            json_response(
                StatusCode::OK,
                json!([{
                    "id": backend.args.class_id,
                    "name": "Demo class",
                    "startTime": "00:00",
                    "endTime": "23:59:59",
                    "professorId": "professor-1",
                }]),
            )
        }
        (&Method::POST, ["session"]) => {
            let mut state = backend.state.lock();
            let id = state.next_id("session");
            let mut session = json_body();
            session["id"] = Value::from(id.clone());
            println!("[MOCK] Session {} created: {}", id, session);
            state.sessions.push(session.clone());
            json_response(StatusCode::CREATED, session)
        }
        (&Method::GET, ["class", _class_id, "students"]) => {
            json_response(StatusCode::OK, json!(backend.args.students))
        }
        (&Method::POST, ["session", session_id, "attendance"]) => {
            let mut state = backend.state.lock();
            let id = state.next_id("attendance");
            let mut record = json_body();
            record["id"] = Value::from(id.clone());
            record["sessionId"] = Value::from(*session_id);
            state.attendance.push(record.clone());
            json_response(StatusCode::CREATED, record)
        }
        (&Method::PUT, ["attendance", record_id]) => {
            let update = json_body();
            let mut state = backend.state.lock();
            match state.attendance.iter_mut().find(|r| r["id"] == *record_id) {
                Some(record) => {
                    if let (Some(record), Some(update)) = (record.as_object_mut(), update.as_object()) {
                        record.extend(update.clone());
                    }
                    println!("[MOCK] Attendance {} updated: {}", record_id, update);
                    json_response(StatusCode::OK, record.clone())
                }
                None => json_response(StatusCode::NOT_FOUND, json!({"message": "no such record"})),
            }
        }
        (&Method::POST, ["image"]) => {
            let mut state = backend.state.lock();
            state.images += 1;
            let url = format!("http://localhost:{}/images/{}.jpg", backend.args.port, state.images);
            println!("[MOCK] Image received ({} bytes) -> {}", body.len(), url);
            json_response(StatusCode::CREATED, json!({ "message": url }))
        }
        (&Method::POST, ["log"]) => {
            backend.state.lock().logs += 1;
            let entry = json_body();
            println!("[MOCK] Log {}", entry["action"]);
            json_response(StatusCode::CREATED, json!({"message": "ok"}))
        }
        (&Method::GET, ["state"]) => {
            let state = backend.state.lock();
            json_response(
                StatusCode::OK,
                json!({
                    "sessions": state.sessions,
                    "attendance": state.attendance,
                    "images": state.images,
                    "logs": state.logs,
                }),
            )
        }
        _ => json_response(StatusCode::NOT_FOUND, json!({"message": "Not Found"})),
    };

    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;

    println!("[MOCK] Attendance backend listening on {}", addr);
    println!("[MOCK] Class {} roster: {:?}", args.class_id, args.students);

    let backend = Arc::new(Backend { args, state: Mutex::new(State::default()) });

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let backend = backend.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let backend = backend.clone();
                async move { handle_request(req, backend).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("[MOCK] Connection from {} failed: {}", peer, e);
            }
        });
    }
}
