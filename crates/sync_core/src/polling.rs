//! Fallback refresh while the hubs are down: the newest page of whatever
//! the user is looking at is re-fetched on a fixed interval.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{history::HistoryLoader, store::ReplicaStore};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct DegradedPoller {
    history: Arc<HistoryLoader>,
    store: Arc<ReplicaStore>,
    interval: Duration,
}

impl DegradedPoller {
    pub fn new(history: Arc<HistoryLoader>, store: Arc<ReplicaStore>, interval: Duration) -> Self {
        Self {
            history,
            store,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "degraded polling started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
        info!("degraded polling stopped");
    }

    /// One refresh of the active channel and conversation; a no-op while
    /// the hubs are live.
    pub async fn poll_once(&self) {
        let (live, channel, conversation) = self
            .store
            .read(|replica| {
                (
                    replica.is_live(),
                    replica.active_channel_location(),
                    replica.active_conversation(),
                )
            })
            .await;
        if live {
            return;
        }

        if let Some((server_id, channel_id)) = channel {
            match self.history.refresh_channel(server_id, channel_id).await {
                Ok(()) => debug!(%channel_id, "polled channel"),
                Err(err) => warn!(%channel_id, "channel poll failed: {err:#}"),
            }
        }
        if let Some(conversation_id) = conversation {
            match self.history.refresh_conversation(conversation_id).await {
                Ok(()) => debug!(%conversation_id, "polled conversation"),
                Err(err) => warn!(%conversation_id, "conversation poll failed: {err:#}"),
            }
        }
    }
}
