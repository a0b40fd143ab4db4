//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/device.toml
//!
//! Backend URL, API key and room may also come from the environment
//! (`ATTENDANCE_BACKEND_URL`, `ATTENDANCE_API_KEY`, `ATTENDANCE_ROOM`), which
//! takes precedence over the file. They are required: loading fails without them.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

pub const ENV_BACKEND_URL: &str = "ATTENDANCE_BACKEND_URL";
pub const ENV_API_KEY: &str = "ATTENDANCE_API_KEY";
pub const ENV_ROOM: &str = "ATTENDANCE_ROOM";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeviceConfig {
    /// Room identifier used to fetch the schedule
    #[serde(default)]
    pub room: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_backend_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProximityConfig {
    #[serde(default = "default_proximity_device")]
    pub device: String,
    #[serde(default = "default_proximity_baud")]
    pub baud: u32,
    /// Readings closer than this count as someone present (cm)
    #[serde(default = "default_threshold_cm")]
    pub threshold_cm: f64,
    /// Minimum change between readings to count as movement (cm)
    #[serde(default = "default_noise_margin_cm")]
    pub noise_margin_cm: f64,
    #[serde(default = "default_proximity_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Upper bound on a single ranging read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_proximity_device() -> String {
    "/dev/ttyAMA2".to_string()
}

fn default_proximity_baud() -> u32 {
    9600
}

fn default_threshold_cm() -> f64 {
    50.0
}

fn default_noise_margin_cm() -> f64 {
    5.0
}

fn default_proximity_poll_ms() -> u64 {
    500
}

fn default_cooldown_ms() -> u64 {
    2000
}

fn default_read_timeout_ms() -> u64 {
    150
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            device: default_proximity_device(),
            baud: default_proximity_baud(),
            threshold_cm: default_threshold_cm(),
            noise_margin_cm: default_noise_margin_cm(),
            poll_interval_ms: default_proximity_poll_ms(),
            cooldown_ms: default_cooldown_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NfcConfig {
    #[serde(default = "default_nfc_device")]
    pub device: String,
    #[serde(default = "default_nfc_baud")]
    pub baud: u32,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_active_poll_ms")]
    pub active_poll_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_nfc_device() -> String {
    "/dev/ttyAMA0".to_string()
}

fn default_nfc_baud() -> u32 {
    115_200
}

fn default_idle_poll_ms() -> u64 {
    5000
}

fn default_active_poll_ms() -> u64 {
    500
}

impl Default for NfcConfig {
    fn default() -> Self {
        Self {
            device: default_nfc_device(),
            baud: default_nfc_baud(),
            idle_poll_ms: default_idle_poll_ms(),
            active_poll_ms: default_active_poll_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Still capture command; must write a JPEG to stdout
    #[serde(default = "default_capture_command")]
    pub capture_command: Vec<String>,
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
    #[serde(default = "default_clip_dir")]
    pub clip_dir: PathBuf,
    /// Keep a rolling pre-trigger frame buffer while the camera is on
    #[serde(default)]
    pub clip_buffer: bool,
    #[serde(default = "default_buffer_secs")]
    pub buffer_secs: u64,
    #[serde(default = "default_post_secs")]
    pub post_secs: u64,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Save a clip when recognition flags a tap (unknown face or mismatch)
    #[serde(default)]
    pub clip_on_flag: bool,
}

fn default_capture_command() -> Vec<String> {
    ["rpicam-still", "-n", "-t", "1", "--width", "640", "--height", "480", "-o", "-"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("/var/lib/attendance/captures")
}

fn default_clip_dir() -> PathBuf {
    PathBuf::from("/var/lib/attendance/clips")
}

fn default_buffer_secs() -> u64 {
    10
}

fn default_post_secs() -> u64 {
    5
}

fn default_fps() -> u32 {
    20
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            capture_command: default_capture_command(),
            capture_dir: default_capture_dir(),
            clip_dir: default_clip_dir(),
            clip_buffer: false,
            buffer_secs: default_buffer_secs(),
            post_secs: default_post_secs(),
            fps: default_fps(),
            clip_on_flag: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    /// Recognizer command; the image path is appended as the last argument
    #[serde(default = "default_recognizer_command")]
    pub command: Vec<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_recognition_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_recognizer_command() -> Vec<String> {
    vec!["python3".to_string(), "/opt/attendance/recognize.py".to_string()]
}

fn default_workers() -> usize {
    3
}

fn default_queue_depth() -> usize {
    16
}

fn default_dedup_window_secs() -> u64 {
    5
}

fn default_recognition_timeout_secs() -> u64 {
    30
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            command: default_recognizer_command(),
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            dedup_window_secs: default_dedup_window_secs(),
            timeout_secs: default_recognition_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// ACTIVE falls back to IDLE after this long without motion
    #[serde(default = "default_motion_timeout_secs")]
    pub motion_timeout_secs: u64,
    /// STREAMING falls back to ACTIVE after this long without a card scan
    #[serde(default = "default_streaming_timeout_secs")]
    pub streaming_timeout_secs: u64,
    /// Dispatcher queue wait; bounds how often timeouts are checked
    #[serde(default = "default_dispatch_wait_ms")]
    pub dispatch_wait_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_motion_timeout_secs() -> u64 {
    20
}

fn default_streaming_timeout_secs() -> u64 {
    60
}

fn default_dispatch_wait_ms() -> u64 {
    500
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            motion_timeout_secs: default_motion_timeout_secs(),
            streaming_timeout_secs: default_streaming_timeout_secs(),
            dispatch_wait_ms: default_dispatch_wait_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_schedule_refresh_secs")]
    pub refresh_secs: u64,
}

fn default_schedule_refresh_secs() -> u64 {
    3600
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { refresh_secs: default_schedule_refresh_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level forwarded to the backend log endpoint ("off" disables)
    #[serde(default = "default_forward_level")]
    pub forward_level: String,
    #[serde(default = "default_forward_queue")]
    pub forward_queue: usize,
}

fn default_forward_level() -> String {
    "info".to_string()
}

fn default_forward_queue() -> usize {
    256
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { forward_level: default_forward_level(), forward_queue: default_forward_queue() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub proximity: ProximityConfig,
    #[serde(default)]
    pub nfc: NfcConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    room: String,
    backend_url: String,
    api_key: String,
    backend_timeout_ms: u64,
    proximity: ProximityConfig,
    nfc: NfcConfig,
    camera: CameraConfig,
    recognition: RecognitionConfig,
    timeouts: TimeoutsConfig,
    schedule_refresh_secs: u64,
    forward_level: Option<Level>,
    forward_queue: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Config {
    /// Determine config file path from the CLI value or environment
    pub fn resolve_config_path(cli: Option<&str>) -> String {
        if let Some(path) = cli {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/device.toml".to_string()
    }

    /// Parse TOML content and apply the required-value checks
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).with_context(|| format!("Failed to parse config {}", source))?;
        Self::from_parts(toml_config, source, |key| env::var(key).ok())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load configuration for startup
    ///
    /// A missing file is tolerated when every required value comes from the
    /// environment; anything else missing is an error.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            return Self::from_file(path);
        }
        Self::from_parts(TomlConfig::default(), "environment", |key| env::var(key).ok())
    }

    fn from_parts(
        toml_config: TomlConfig,
        source: &str,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let pick = |env_key: &str, file_value: Option<String>| {
            env_lookup(env_key).or(file_value).filter(|v| !v.trim().is_empty())
        };

        let mut missing = Vec::new();
        let backend_url = pick(ENV_BACKEND_URL, toml_config.backend.base_url);
        if backend_url.is_none() {
            missing.push("backend.base_url / ATTENDANCE_BACKEND_URL");
        }
        let api_key = pick(ENV_API_KEY, toml_config.backend.api_key);
        if api_key.is_none() {
            missing.push("backend.api_key / ATTENDANCE_API_KEY");
        }
        let room = pick(ENV_ROOM, toml_config.device.room);
        if room.is_none() {
            missing.push("device.room / ATTENDANCE_ROOM");
        }
        let (Some(backend_url), Some(api_key), Some(room)) = (backend_url, api_key, room) else {
            bail!("missing required configuration in {}: {}", source, missing.join(", "));
        };

        if toml_config.recognition.workers == 0 {
            bail!("recognition.workers must be at least 1");
        }
        if toml_config.camera.capture_command.is_empty() {
            bail!("camera.capture_command must not be empty");
        }
        if toml_config.recognition.command.is_empty() {
            bail!("recognition.command must not be empty");
        }

        let forward_level = parse_forward_level(&toml_config.logging.forward_level)
            .with_context(|| format!("invalid logging.forward_level in {}", source))?;

        Ok(Self {
            room,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            api_key,
            backend_timeout_ms: toml_config.backend.timeout_ms,
            proximity: toml_config.proximity,
            nfc: toml_config.nfc,
            camera: toml_config.camera,
            recognition: toml_config.recognition,
            timeouts: toml_config.timeouts,
            schedule_refresh_secs: toml_config.schedule.refresh_secs,
            forward_level,
            forward_queue: toml_config.logging.forward_queue.max(1),
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: source.to_string(),
        })
    }

    // Getters for all config fields
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn proximity(&self) -> &ProximityConfig {
        &self.proximity
    }

    pub fn nfc(&self) -> &NfcConfig {
        &self.nfc
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn recognition(&self) -> &RecognitionConfig {
        &self.recognition
    }

    pub fn motion_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.motion_timeout_secs)
    }

    pub fn streaming_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.streaming_timeout_secs)
    }

    pub fn dispatch_wait(&self) -> Duration {
        Duration::from_millis(self.timeouts.dispatch_wait_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_grace_secs)
    }

    pub fn schedule_refresh(&self) -> Duration {
        Duration::from_secs(self.schedule_refresh_secs)
    }

    pub fn forward_level(&self) -> Option<Level> {
        self.forward_level
    }

    pub fn forward_queue(&self) -> usize {
        self.forward_queue
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

fn parse_forward_level(value: &str) -> anyhow::Result<Option<Level>> {
    if value.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let level = value.parse::<Level>().map_err(|e| anyhow::anyhow!("{}: {}", value, e))?;
    Ok(Some(level))
}
