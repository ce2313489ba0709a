//! Hub membership types
//!
//! A member is the hub's view of one connection: its handle id, the identity
//! resolved at upgrade time, and the sending side of its bounded outbox.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Handle identity of one connection adapter
///
/// Minted once per adapter and never reused, so two adapters never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An already-rendered outbound message
///
/// The hub never looks inside; cloning only bumps a reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Arc<[u8]>);

#[allow(clippy::len_without_is_empty)]
impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(text.into_bytes().into())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().into())
    }
}

/// Sending side of a connection's outbox
pub type OutboxSender = mpsc::Sender<Payload>;

/// Receiving side of a connection's outbox, drained by the send loop
pub type OutboxReceiver = mpsc::Receiver<Payload>;

/// Create a bounded outbox
pub fn outbox(capacity: usize) -> (OutboxSender, OutboxReceiver) {
    mpsc::channel(capacity)
}

/// A live connection as registered with the hub
#[derive(Debug)]
pub struct Member {
    pub id: ClientId,
    /// Display identity resolved before the upgrade
    pub identity: String,
    pub outbox: OutboxSender,
}

impl Member {
    pub fn new(id: ClientId, identity: impl Into<String>, outbox: OutboxSender) -> Self {
        Self {
            id,
            identity: identity.into(),
            outbox,
        }
    }
}
