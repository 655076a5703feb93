use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};

/// asciicast v2 header, written as the first line of the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsciicastHeader {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<serde_json::Value>,
}

/// Finalized recording descriptor returned by [`SessionRecorder::stop`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecording {
    pub id: String,
    pub session_id: String,
    pub file_path: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub width: u16,
    pub height: u16,
}

/// Appends terminal output to an asciicast v2 file with monotonic
/// timestamps. Every chunk published on the bus is also fed here while the
/// recording is live.
pub struct SessionRecorder {
    pub id: String,
    session_id: String,
    file_path: String,
    start: Instant,
    started_at: DateTime<Utc>,
    width: u16,
    height: u16,
    writer: Arc<Mutex<File>>,
    active: Arc<RwLock<bool>>,
}

impl SessionRecorder {
    pub async fn create(
        session_id: String,
        file_path: String,
        width: u16,
        height: u16,
        title: Option<String>,
    ) -> SessionResult<Self> {
        let file = File::create(&file_path).await.map_err(|e| {
            SessionError::SpawnFailed(format!("failed to create recording file: {}", e))
        })?;

        let recorder = Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            file_path,
            start: Instant::now(),
            started_at: Utc::now(),
            width,
            height,
            writer: Arc::new(Mutex::new(file)),
            active: Arc::new(RwLock::new(true)),
        };

        let header = AsciicastHeader {
            version: 2,
            width,
            height,
            timestamp: Some(recorder.started_at.timestamp()),
            title,
            env: Some(serde_json::json!({
                "TERM": "xterm-256color",
                "SHELL": std::env::var("SHELL").unwrap_or_default(),
            })),
        };

        let mut line = serde_json::to_string(&header)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        line.push('\n');

        let mut writer = recorder.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        drop(writer);

        Ok(recorder)
    }

    /// Append one output event: `[elapsed_seconds, "o", data]`.
    pub async fn record_output(&self, data: &[u8]) -> SessionResult<()> {
        if !*self.active.read().await {
            return Ok(());
        }

        let elapsed = self.start.elapsed().as_secs_f64();
        let text = String::from_utf8_lossy(data);
        let event = serde_json::json!([elapsed, "o", text]);

        let mut line =
            serde_json::to_string(&event).map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Finalize the file and return the descriptor.
    pub async fn stop(&self) -> SessionResult<SessionRecording> {
        *self.active.write().await = false;

        let mut writer = self.writer.lock().await;
        writer.flush().await?;

        Ok(SessionRecording {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            file_path: self.file_path.clone(),
            started_at: self.started_at,
            duration_ms: self.start.elapsed().as_millis() as i64,
            width: self.width,
            height: self.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn asciicast_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.cast");

        let recorder = SessionRecorder::create(
            "t1".into(),
            path.to_string_lossy().to_string(),
            80,
            24,
            Some("demo".into()),
        )
        .await
        .unwrap();

        recorder.record_output(b"hello ").await.unwrap();
        recorder.record_output(b"world\r\n").await.unwrap();
        let recording = recorder.stop().await.unwrap();
        assert_eq!(recording.width, 80);

        // Output after stop is ignored.
        recorder.record_output(b"late").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["version"], 2);
        assert_eq!(header["width"], 80);
        assert_eq!(header["height"], 24);

        let event: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(event[1], "o");
        assert_eq!(event[2], "hello ");

        // Timestamps are monotonic.
        let first: f64 = serde_json::from_value(event[0].clone()).unwrap();
        let second_event: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        let second: f64 = serde_json::from_value(second_event[0].clone()).unwrap();
        assert!(second >= first);
    }
}
