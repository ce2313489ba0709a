//! Chat message rendering
//!
//! Turns a normalized inbound frame plus the sender's identity and a
//! timestamp into the payload every member receives. Rendering runs on the
//! sender's receive path, once per message, so the send loops only ever copy
//! finished bytes to their sockets.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::RenderFormat;
use crate::hub::Payload;
use crate::server::{ChatSubmission, ProtocolError, ServerMessage};

/// Errors that abandon a single message
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for render operations
pub type RenderResult<T> = Result<T, RenderError>;

/// Pure conversion from (sender, frame text, time) to an outbound payload
pub trait MessageRenderer: Send + Sync {
    fn render(&self, sender: &str, frame: &str, sent_at: DateTime<Utc>) -> RenderResult<Payload>;
}

/// Build the renderer selected in the configuration
pub fn renderer_for(format: RenderFormat) -> Arc<dyn MessageRenderer> {
    match format {
        RenderFormat::Json => Arc::new(JsonRenderer),
        RenderFormat::Html => Arc::new(HtmlRenderer),
    }
}

/// Emits a `chat_message` JSON event
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRenderer;

impl MessageRenderer for JsonRenderer {
    fn render(&self, sender: &str, frame: &str, sent_at: DateTime<Utc>) -> RenderResult<Payload> {
        let submission = ChatSubmission::from_json(frame)?;
        let json = ServerMessage::chat(sender, submission.chat_message, sent_at).to_json()?;
        Ok(Payload::from(json))
    }
}

/// Emits an out-of-band HTML fragment appended to the `#messages` element
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlRenderer;

impl MessageRenderer for HtmlRenderer {
    fn render(&self, sender: &str, frame: &str, sent_at: DateTime<Utc>) -> RenderResult<Payload> {
        let submission = ChatSubmission::from_json(frame)?;
        let html = format!(
            concat!(
                r#"<div id="messages" hx-swap-oob="beforeend">"#,
                r#"<div class="chat-message">"#,
                r#"<span class="sender">{}</span> "#,
                r#"<time datetime="{}">{}</time> "#,
                r#"<p>{}</p>"#,
                r#"</div></div>"#
            ),
            html_escape::encode_text(sender),
            sent_at.to_rfc3339(),
            sent_at.format("%H:%M"),
            html_escape::encode_text(&submission.chat_message),
        );
        Ok(Payload::from(html))
    }
}
