//! JSON body stored inside each event file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of an event file. Which fields are set depends on the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Actor named by monitor and taken events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl EventPayload {
    pub fn new(timestamp: DateTime<Utc>, author: Option<String>) -> Self {
        Self {
            timestamp,
            author,
            tagline: None,
            status: None,
            text: None,
            actor: None,
        }
    }

    pub fn with_tagline(mut self, tagline: impl Into<String>) -> Self {
        self.tagline = Some(tagline.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Whether the caller of an incremental update already holds the event body.
///
/// `Unknown` arises after a remote pull, where only filenames are known; the
/// aggregate cache must then rebuild from disk.
#[derive(Debug, Clone)]
pub enum PayloadState {
    Known(EventPayload),
    Unknown,
}

impl From<EventPayload> for PayloadState {
    fn from(payload: EventPayload) -> Self {
        PayloadState::Known(payload)
    }
}
