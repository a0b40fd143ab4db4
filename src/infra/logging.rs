//! Tracing setup and the backend log layer
//!
//! Console output goes through the `fmt` layer filtered by `RUST_LOG`.
//! `BackendLogLayer` independently picks up this crate's events at or above
//! the configured forward level and hands them to the log forwarder task
//! through a bounded channel. The layer never blocks: a full channel drops
//! the record.

use crate::infra::Metrics;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Events from these targets are never forwarded (the forwarder itself)
const EXCLUDED_TARGET: &str = "attendance_controller::io::log_forwarder";
const CRATE_TARGET: &str = "attendance_controller";

/// One captured log event bound for the backend
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub target: String,
    /// The event message (snake_case event name by convention)
    pub action: String,
    pub fields: Map<String, Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl LogRecord {
    /// Metadata payload posted alongside the action
    pub fn metadata(&self) -> Value {
        let mut metadata = self.fields.clone();
        metadata.insert("level".to_string(), Value::from(self.level.as_str()));
        metadata.insert("target".to_string(), Value::from(self.target.as_str()));
        metadata.insert("timestamp".to_string(), Value::from(self.timestamp.to_rfc3339()));
        Value::Object(metadata)
    }
}

/// Collects the message and structured fields of an event
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields.insert(field.name().to_string(), Value::from(rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }
}

/// Tracing layer that feeds the backend log forwarder
pub struct BackendLogLayer {
    tx: mpsc::Sender<LogRecord>,
    max_level: Level,
    metrics: Option<Arc<Metrics>>,
}

impl BackendLogLayer {
    pub fn new(tx: mpsc::Sender<LogRecord>, max_level: Level) -> Self {
        Self { tx, max_level, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn accepts(&self, level: &Level, target: &str) -> bool {
        // tracing orders ERROR < WARN < INFO < DEBUG < TRACE
        *level <= self.max_level
            && target.starts_with(CRATE_TARGET)
            && !target.starts_with(EXCLUDED_TARGET)
    }
}

impl<S> Layer<S> for BackendLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !self.accepts(metadata.level(), metadata.target()) {
            return;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let record = LogRecord {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            action: collector.message.unwrap_or_else(|| metadata.name().to_string()),
            fields: collector.fields,
            timestamp: chrono::Utc::now(),
        };

        if self.tx.try_send(record).is_err() {
            if let Some(metrics) = &self.metrics {
                metrics.record_log_dropped();
            }
        }
    }
}

/// Install the global subscriber
///
/// Console output is filtered by `RUST_LOG` (default: info); the backend
/// layer, when given, applies its own level.
pub fn init_tracing(backend_layer: Option<BackendLogLayer>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_filter(filter);

    tracing_subscriber::registry().with(fmt_layer).with(backend_layer).init();
}
