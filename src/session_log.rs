//! Per-session append-only structured log.
//!
//! Every session accumulates a causal trail (acquisition progress, segment
//! transitions, cancellation reasons) that outlives the terse `result`
//! field. Cleanup removes a session's log when its history entry is retired.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::SessionId;
use crate::store::StoreResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Warn => f.write_str("warn"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// One appended log record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionLogRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub level: LogLevel,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl SessionLogRecord {
    pub fn new(session_id: SessionId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            level,
            message: message.into(),
            time: Utc::now(),
        }
    }
}

/// Append-only sink for session log records.
#[async_trait]
pub trait SessionLogSink: Send + Sync {
    async fn append(&self, record: SessionLogRecord) -> StoreResult<()>;

    async fn read(&self, session_id: &SessionId) -> StoreResult<Vec<SessionLogRecord>>;

    /// Drop a session's log, typically during history retirement.
    async fn remove(&self, session_id: &SessionId) -> StoreResult<()>;
}

/// Log sink that keeps records in memory.
#[derive(Clone, Default)]
pub struct MemorySessionLog {
    records: Arc<Mutex<HashMap<SessionId, Vec<SessionLogRecord>>>>,
}

impl MemorySessionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionLogSink for MemorySessionLog {
    async fn append(&self, record: SessionLogRecord) -> StoreResult<()> {
        let mut guard = self.records.lock().expect("session log poisoned");
        guard
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn read(&self, session_id: &SessionId) -> StoreResult<Vec<SessionLogRecord>> {
        let guard = self.records.lock().expect("session log poisoned");
        Ok(guard.get(session_id).cloned().unwrap_or_default())
    }

    async fn remove(&self, session_id: &SessionId) -> StoreResult<()> {
        let mut guard = self.records.lock().expect("session log poisoned");
        guard.remove(session_id);
        Ok(())
    }
}

/// Log sink that writes one JSON-lines file per session under a directory.
#[derive(Clone)]
pub struct FileSessionLog {
    dir: PathBuf,
}

impl FileSessionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("{session_id}.log"))
    }
}

#[async_trait]
impl SessionLogSink for FileSessionLog {
    async fn append(&self, record: SessionLogRecord) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&record.session_id))?;
        let line = serde_json::to_string(&record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    async fn read(&self, session_id: &SessionId) -> StoreResult<Vec<SessionLogRecord>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(path)?;
        let mut records = Vec::new();
        for line in contents.lines().filter(|line| !line.is_empty()) {
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    async fn remove(&self, session_id: &SessionId) -> StoreResult<()> {
        let path = self.path_for(session_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
