//! Audit event types
//!
//! Every lifecycle stage appends one or more events keyed by `request_id`.
//! The log is append-only and insertion-ordered per record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "info",
            AuditLevel::Warn => "warn",
            AuditLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<AuditLevel> {
        match value {
            "info" => Some(AuditLevel::Info),
            "warn" => Some(AuditLevel::Warn),
            "error" => Some(AuditLevel::Error),
            _ => None,
        }
    }
}

/// Lifecycle stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Receive,
    Validate,
    Translate,
    Policy,
    Execute,
    Callback,
}

impl AuditStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStage::Receive => "receive",
            AuditStage::Validate => "validate",
            AuditStage::Translate => "translate",
            AuditStage::Policy => "policy",
            AuditStage::Execute => "execute",
            AuditStage::Callback => "callback",
        }
    }

    pub fn parse(value: &str) -> Option<AuditStage> {
        match value {
            "receive" => Some(AuditStage::Receive),
            "validate" => Some(AuditStage::Validate),
            "translate" => Some(AuditStage::Translate),
            "policy" => Some(AuditStage::Policy),
            "execute" => Some(AuditStage::Execute),
            "callback" => Some(AuditStage::Callback),
            _ => None,
        }
    }
}

/// One audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub stage: AuditStage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl AuditEvent {
    pub fn info(
        request_id: impl Into<String>,
        stage: AuditStage,
        message: impl Into<String>,
    ) -> Self {
        Self::new(request_id, AuditLevel::Info, stage, message)
    }

    pub fn warn(
        request_id: impl Into<String>,
        stage: AuditStage,
        message: impl Into<String>,
    ) -> Self {
        Self::new(request_id, AuditLevel::Warn, stage, message)
    }

    pub fn error(
        request_id: impl Into<String>,
        stage: AuditStage,
        message: impl Into<String>,
    ) -> Self {
        Self::new(request_id, AuditLevel::Error, stage, message)
    }

    fn new(
        request_id: impl Into<String>,
        level: AuditLevel,
        stage: AuditStage,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: Utc::now(),
            level,
            stage,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
