//! Attendance backend REST client
//!
//! Routes (JSON, `Authorization: Bearer <api_key>`):
//! - `GET  /schedule/{room}` - classes held in the room today
//! - `POST /session` - open a session for a class period
//! - `GET  /class/{classId}/students` - class roster
//! - `POST /session/{sessionId}/attendance` - placeholder record per student
//! - `PUT  /attendance/{recordId}` - check-in result
//! - `POST /image` - multipart portrait upload, returns the stored URL
//! - `POST /log` - controller activity log

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::domain::{CardId, ClassInfo};

/// `userId` the controller logs under
pub const LOG_USER_ID: &str = "Controller";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend rejected credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("unexpected backend response: {0}")]
    Decode(String),
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// The process cannot continue (bad credentials)
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Unauthorized(_))
    }
}

/// Check-in result written to an attendance record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceUpdate {
    #[serde(rename = "checkIn")]
    pub check_in: DateTime<Local>,
    #[serde(rename = "portraitUrl", skip_serializing_if = "Option::is_none")]
    pub portrait_url: Option<String>,
    /// Recognized identity; empty when the face was not recognized
    #[serde(rename = "FRIdentifiedId")]
    pub identified_id: String,
    pub flagged: bool,
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn get_schedule(&self, room: &str) -> Result<Vec<ClassInfo>, BackendError>;

    /// Returns the backend-assigned session id
    async fn create_session(
        &self,
        class: &ClassInfo,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<String, BackendError>;

    async fn get_roster(&self, class_id: &str) -> Result<Vec<CardId>, BackendError>;

    /// Returns the attendance record id
    async fn create_attendance_placeholder(
        &self,
        session_id: &str,
        student: &CardId,
    ) -> Result<String, BackendError>;

    async fn update_attendance(
        &self,
        record_id: &str,
        update: &AttendanceUpdate,
    ) -> Result<(), BackendError>;

    /// Upload an image file; returns the URL it is stored under
    async fn upload_image(&self, path: &Path) -> Result<String, BackendError>;

    async fn log(&self, action: &str, metadata: Value) -> Result<(), BackendError>;
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    message: String,
}

/// Roster entries come back either as bare ids or as student objects
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RosterEntry {
    Id(String),
    Student {
        #[serde(alias = "studentId")]
        id: String,
    },
}

impl RosterEntry {
    fn into_id(self) -> String {
        match self {
            RosterEntry::Id(id) | RosterEntry::Student { id } => id,
        }
    }
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    /// Room this controller serves; used as the log entity id
    room: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: &str, room: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("attendance-controller/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            room: room.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let response =
            request.bearer_auth(&self.api_key).send().await.map_err(BackendError::Transport)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BackendError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status: status.as_u16(), body });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = self.send(request).await?;
        let body = response.bytes().await.map_err(BackendError::Transport)?;
        serde_json::from_slice(&body).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn get_schedule(&self, room: &str) -> Result<Vec<ClassInfo>, BackendError> {
        let classes: Vec<ClassInfo> =
            self.send_json(self.client.get(self.url(&format!("/schedule/{}", room)))).await?;
        debug!(room = %room, classes = classes.len(), "schedule_fetched");
        Ok(classes)
    }

    async fn create_session(
        &self,
        class: &ClassInfo,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<String, BackendError> {
        let body = json!({
            "startTime": start,
            "endTime": end,
            "classId": class.class_id,
            "professorId": class.professor_id,
        });
        let created: CreatedResponse =
            self.send_json(self.client.post(self.url("/session")).json(&body)).await?;
        Ok(created.id)
    }

    async fn get_roster(&self, class_id: &str) -> Result<Vec<CardId>, BackendError> {
        let entries: Vec<RosterEntry> = self
            .send_json(self.client.get(self.url(&format!("/class/{}/students", class_id))))
            .await?;

        let mut roster = Vec::with_capacity(entries.len());
        for entry in entries {
            let raw = entry.into_id();
            match CardId::parse(&raw) {
                Some(id) => roster.push(id),
                None => debug!(class_id = %class_id, student_id = %raw, "roster_entry_not_card_id"),
            }
        }
        Ok(roster)
    }

    async fn create_attendance_placeholder(
        &self,
        session_id: &str,
        student: &CardId,
    ) -> Result<String, BackendError> {
        let body = json!({
            "studentId": student.as_str(),
            "checkIn": Value::Null,
            "portraitUrl": "",
        });
        let created: CreatedResponse = self
            .send_json(
                self.client.post(self.url(&format!("/session/{}/attendance", session_id))).json(&body),
            )
            .await?;
        Ok(created.id)
    }

    async fn update_attendance(
        &self,
        record_id: &str,
        update: &AttendanceUpdate,
    ) -> Result<(), BackendError> {
        self.send(self.client.put(self.url(&format!("/attendance/{}", record_id))).json(update))
            .await?;
        Ok(())
    }

    async fn upload_image(&self, path: &Path) -> Result<String, BackendError> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("portrait.jpg")
            .to_string();

        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str("image/jpeg")
            .map_err(BackendError::Transport)?;
        let form = reqwest::multipart::Form::new().part("image", part);

        let uploaded: UploadResponse =
            self.send_json(self.client.post(self.url("/image")).multipart(form)).await?;
        Ok(uploaded.message)
    }

    async fn log(&self, action: &str, metadata: Value) -> Result<(), BackendError> {
        let body = json!({
            "user_id": LOG_USER_ID,
            "action": action,
            "entity_type": "Controller",
            "entity_id": self.room,
            "metadata": metadata,
        });
        self.send(self.client.post(self.url("/log")).json(&body)).await?;
        Ok(())
    }
}
