//! Side effects the routers ask the embedding UI to perform.

use shared::domain::{ChannelId, ServerId};
use tokio::sync::broadcast;
use tracing::info;

pub const SERVER_DELETED_NOTICE: &str = "The server you were in has been deleted.";
pub const KICKED_NOTICE: &str = "You have been kicked from the server.";
pub const LEFT_NOTICE: &str = "You have left the server.";
pub const WELCOME_NOTICE: &str = "You have been added to the server!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationTarget {
    Root,
    Server(ServerId),
    Channel {
        server_id: ServerId,
        channel_id: ChannelId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSignal {
    Navigate(NavigationTarget),
    Notice { level: NoticeLevel, text: String },
    /// The signed-in user was added to a server.
    Welcome { server_id: ServerId },
}

impl SyncSignal {
    pub fn error(text: &str) -> Self {
        Self::Notice {
            level: NoticeLevel::Error,
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<SyncSignal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncSignal> {
        self.tx.subscribe()
    }

    /// Publishes `signal`; having no listener is fine.
    pub fn emit(&self, signal: SyncSignal) {
        info!(?signal, "sync signal");
        let _ = self.tx.send(signal);
    }
}
