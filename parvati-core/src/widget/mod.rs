//! Voice-agent widget embedding.
//!
//! The call screen hosts a third-party voice agent in a sandboxed frame.
//! This module owns what the host must say to it: the embed attributes, the
//! single post-load handshake, and a coarse tag for messages coming back.

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_WIDGET_URL: &str = "https://widget.synthflow.ai/widget/v2/1734118370620x218015710862244480/1734118370309x121081012185592080";

const DEFAULT_GRANTS: &[&str] = &[
    "microphone *",
    "camera *",
    "clipboard-write",
    "display-capture *",
    "autoplay *",
    "speaker *",
];

const DEFAULT_SANDBOX: &[&str] = &[
    "allow-same-origin",
    "allow-scripts",
    "allow-forms",
    "allow-popups",
    "allow-downloads",
    "allow-modals",
    "allow-presentation",
];

/// Source and permissions for the embedded widget frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedPolicy {
    pub src: String,
    /// Capability grants, one `allow` directive each.
    pub grants: Vec<String>,
    pub sandbox: Vec<String>,
}

impl EmbedPolicy {
    pub fn with_src(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            ..Self::default()
        }
    }

    /// Value of the frame's `allow` attribute.
    pub fn allow_attr(&self) -> String {
        self.grants.join("; ")
    }

    /// Value of the frame's `sandbox` attribute.
    pub fn sandbox_attr(&self) -> String {
        self.sandbox.join(" ")
    }
}

impl Default for EmbedPolicy {
    fn default() -> Self {
        Self {
            src: DEFAULT_WIDGET_URL.to_string(),
            grants: DEFAULT_GRANTS.iter().map(|g| g.to_string()).collect(),
            sandbox: DEFAULT_SANDBOX.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Messages the host posts into the widget frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WidgetMessage {
    Unmute,
}

/// The one message sent once the frame has loaded.
pub fn handshake() -> WidgetMessage {
    WidgetMessage::Unmute
}

/// Coarse tag for string messages from the widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundKind {
    AudioRelated,
    General,
}

pub fn classify_inbound(text: &str) -> InboundKind {
    let lower = text.to_ascii_lowercase();
    let kind = if lower.contains("audio") || lower.contains("sound") {
        InboundKind::AudioRelated
    } else {
        InboundKind::General
    };
    debug!(?kind, "widget message: {text}");
    kind
}
