//! Client-side real-time sync for the chat backend: five hub connections,
//! an in-memory replica of servers, channels, members and conversations,
//! and the routers that fold hub events into it.

pub mod api;
pub mod connector;
pub mod error;
pub mod groups;
pub mod history;
pub mod merge;
pub mod orchestrator;
pub mod permissions;
pub mod polling;
pub mod routers;
pub mod settings;
pub mod signals;
pub mod store;
pub mod transport;

pub use api::{ApiClient, ChatApi};
pub use connector::{CredentialProvider, HubConnector, StaticCredential, WebSocketConnector};
pub use error::{ApiFailure, ReadyError, TransportError};
pub use orchestrator::{Hubs, MountOutcome, SyncOrchestrator};
pub use settings::{SettingsError, SyncSettings};
pub use signals::{NavigationTarget, NoticeLevel, SignalBus, SyncSignal};
pub use store::{Replica, ReplicaStore, StoreAction, StoreChange};
pub use transport::{ChannelOptions, ChannelState, TransportChannel};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
