//! Connection state and the typed events a connection emits to its owner.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::KfError;
use crate::types::{Exchange, StreamUpdate};

/// Lifecycle of one stream connection.
///
/// ```text
/// disconnected ──► connecting ──► connected
///                      ▲              │ loss
///                      │              ▼
///                      └──────── reconnecting ──► failed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A typed event emitted by a stream connection.
#[derive(Debug)]
pub enum StreamEvent {
    /// Handshake (and subscription, if any) completed.
    Connected,

    /// The socket went away; a reconnect follows unless the budget is spent.
    Disconnected {
        /// Human-readable reason.
        reason: String,
    },

    /// A parsed kline update.
    CandleUpdate(StreamUpdate),

    /// A non-fatal error (failed connect attempt, send failure).
    Error(KfError),

    /// Reconnect budget exhausted. No further events follow.
    Failed,
}

/// A [`StreamEvent`] tagged with the connection that produced it.
#[derive(Debug)]
pub struct ConnEvent {
    pub conn_id: usize,
    pub exchange: Exchange,
    pub event: StreamEvent,
}

/// Sender half of the connection event channel.
pub type ConnEventSender = mpsc::Sender<ConnEvent>;

/// Receiver half of the connection event channel.
pub type ConnEventReceiver = mpsc::Receiver<ConnEvent>;
