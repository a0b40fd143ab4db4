//! Prometheus metrics HTTP endpoint
//!
//! Exposes controller metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_JOB_BOUNDS, METRICS_NUM_BUCKETS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with room label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, room: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{room=\"{room}\"}} {val}");
}

/// Write a histogram metric with buckets and count
///
/// Only the average is tracked, so the sum is reconstructed from it.
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    room: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{room=\"{room}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{room=\"{room}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{room=\"{room}\"}} {}", avg * cumulative);
    let _ = writeln!(output, "{name}_count{{room=\"{room}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, room: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_state_metrics(&mut output, room, &summary);
    write_sensor_metrics(&mut output, room, &summary);
    write_attendance_metrics(&mut output, room, &summary);

    output
}

fn write_state_metrics(output: &mut String, room: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "attendance_events_total",
        "Total events dispatched",
        MetricType::Counter,
        room,
        summary.events_total,
    );
    write_histogram(
        output,
        "attendance_dispatch_latency_us",
        "Queue to dispatch latency in microseconds",
        room,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_dispatch_latency_us,
    );
    write_metric(
        output,
        "attendance_device_state",
        "Device state (0=idle, 1=active, 2=streaming)",
        MetricType::Gauge,
        room,
        summary.device_state,
    );
    write_metric(
        output,
        "attendance_transitions_total",
        "State transitions applied",
        MetricType::Counter,
        room,
        summary.transitions_total,
    );
    write_metric(
        output,
        "attendance_effect_failures_total",
        "Peripheral side effects that failed",
        MetricType::Counter,
        room,
        summary.effect_failures_total,
    );
}

fn write_sensor_metrics(output: &mut String, room: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "attendance_motion_events_total",
        "Motion events emitted by the proximity monitor",
        MetricType::Counter,
        room,
        summary.motion_events_total,
    );
    write_metric(
        output,
        "attendance_card_scans_total",
        "Card scans emitted by the card poller",
        MetricType::Counter,
        room,
        summary.card_scans_total,
    );
    write_metric(
        output,
        "attendance_sensor_faults_total",
        "Range sensor reads without a usable distance",
        MetricType::Counter,
        room,
        summary.sensor_faults_total,
    );
    write_metric(
        output,
        "attendance_card_read_errors_total",
        "Card reader communication errors",
        MetricType::Counter,
        room,
        summary.card_read_errors_total,
    );
}

fn write_attendance_metrics(output: &mut String, room: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "attendance_attempts_total",
        "Attendance attempts started",
        MetricType::Counter,
        room,
        summary.attendance_attempts_total,
    );
    write_metric(
        output,
        "attendance_failures_total",
        "Attendance attempts aborted",
        MetricType::Counter,
        room,
        summary.attendance_failures_total,
    );
    write_metric(
        output,
        "attendance_deduped_total",
        "Repeated card taps coalesced",
        MetricType::Counter,
        room,
        summary.card_scans_deduped,
    );
    write_metric(
        output,
        "attendance_updates_total",
        "Attendance records updated with a check-in",
        MetricType::Counter,
        room,
        summary.attendance_updates_total,
    );
    write_metric(
        output,
        "attendance_recognition_completed_total",
        "Recognition jobs completed",
        MetricType::Counter,
        room,
        summary.recognition_completed_total,
    );
    write_metric(
        output,
        "attendance_recognition_failed_total",
        "Recognition jobs failed",
        MetricType::Counter,
        room,
        summary.recognition_failed_total,
    );
    write_metric(
        output,
        "attendance_recognition_dropped_total",
        "Recognition jobs dropped because the queue was full",
        MetricType::Counter,
        room,
        summary.recognition_dropped_total,
    );
    write_histogram(
        output,
        "attendance_recognition_job_ms",
        "Recognition job duration in milliseconds",
        room,
        &summary.job_buckets,
        &METRICS_JOB_BOUNDS,
        summary.job_avg_ms,
    );
    write_metric(
        output,
        "attendance_log_records_dropped_total",
        "Log records not forwarded because the queue was full",
        MetricType::Counter,
        room,
        summary.log_records_dropped,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    room: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &room);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    room: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let room = Arc::new(room);

    info!(port = %port, room = %room, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let room = room.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let room = room.clone();
                                async move { handle_request(req, metrics, room).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
