//! Face recognition adapter
//!
//! The recognizer runs out of process: the configured command gets the image
//! path as its last argument and prints a JSON array on stdout, one object
//! per face:
//!
//! ```json
//! [{"identity": "E2EEC801", "distance": 0.62, "croppedPath": "/data/FRedPic/x.jpg"}]
//! ```
//!
//! `confidence` may be given directly; otherwise it is derived from the
//! embedding distance (`1 - distance / 2`, clamped to [0, 1]).

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

use crate::domain::types::UNKNOWN_IDENTITY;
use crate::domain::FaceMatch;
use crate::infra::config::RecognitionConfig;

#[async_trait]
pub trait RecognitionService: Send + Sync {
    /// Zero or more faces found in the image, best match first
    async fn identify(&self, image_path: &Path) -> anyhow::Result<Vec<FaceMatch>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecognizerFace {
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    distance: Option<f32>,
    #[serde(alias = "croppedImagePath")]
    cropped_path: PathBuf,
}

impl From<RecognizerFace> for FaceMatch {
    fn from(face: RecognizerFace) -> Self {
        let confidence = face
            .confidence
            .or_else(|| face.distance.map(|d| 1.0 - d / 2.0))
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        FaceMatch {
            identity: face
                .identity
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string()),
            confidence,
            cropped_image_path: face.cropped_path,
        }
    }
}

/// Parse recognizer stdout
pub fn parse_recognizer_output(stdout: &[u8]) -> anyhow::Result<Vec<FaceMatch>> {
    let text = std::str::from_utf8(stdout).context("recognizer output is not UTF-8")?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let faces: Vec<RecognizerFace> =
        serde_json::from_str(text).context("recognizer output is not a JSON face list")?;
    Ok(faces.into_iter().map(FaceMatch::from).collect())
}

pub struct CommandRecognizer {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandRecognizer {
    pub fn new(config: &RecognitionConfig) -> Self {
        Self { command: config.command.clone(), timeout: Duration::from_secs(config.timeout_secs) }
    }
}

#[async_trait]
impl RecognitionService for CommandRecognizer {
    async fn identify(&self, image_path: &Path) -> anyhow::Result<Vec<FaceMatch>> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("recognizer command is empty");
        };

        let child = tokio::process::Command::new(program)
            .args(args)
            .arg(image_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start recognizer {}", program))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("recognizer timed out after {:?}", self.timeout))?
            .context("recognizer I/O failed")?;

        if !output.status.success() {
            bail!(
                "recognizer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let faces = parse_recognizer_output(&output.stdout)?;
        debug!(image = %image_path.display(), faces = faces.len(), "recognizer_finished");
        Ok(faces)
    }
}
