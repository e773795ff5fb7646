use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use shared::events::{ChannelDeleted, ChannelHubEvent};
use tracing::info;

use super::{Router, RouterContext};
use crate::{
    signals::{NavigationTarget, SyncSignal},
    store::StoreAction,
    transport::TransportChannel,
};

pub struct ChannelRouter {
    ctx: RouterContext,
    channel: TransportChannel<ChannelHubEvent>,
    listening: AtomicBool,
}

impl ChannelRouter {
    pub fn new(ctx: RouterContext, channel: TransportChannel<ChannelHubEvent>) -> Self {
        Self {
            ctx,
            channel,
            listening: AtomicBool::new(false),
        }
    }

    /// Removes the channel; a viewer looking at it is sent to the server's
    /// "general" channel, or to the server itself when there is none.
    async fn channel_deleted(&self, payload: ChannelDeleted) {
        let ChannelDeleted {
            server_id,
            deleted_channel_id,
        } = payload;
        let store = &self.ctx.store;
        store
            .apply(StoreAction::ChannelRemoved {
                server_id,
                channel_id: deleted_channel_id,
            })
            .await;

        let (viewing, general) = store
            .read(|replica| {
                (
                    replica.active_channel() == Some(deleted_channel_id),
                    replica
                        .server(server_id)
                        .and_then(|server| server.general_channel())
                        .map(|channel| channel.id),
                )
            })
            .await;
        if !viewing {
            return;
        }

        info!(%server_id, channel_id = %deleted_channel_id, "viewed channel was deleted");
        store.apply(StoreAction::ActiveChannelSet(general)).await;
        let target = match general {
            Some(channel_id) => NavigationTarget::Channel {
                server_id,
                channel_id,
            },
            None => NavigationTarget::Server(server_id),
        };
        self.ctx.signals.emit(SyncSignal::Navigate(target));
    }
}

#[async_trait]
impl Router for ChannelRouter {
    type Event = ChannelHubEvent;

    fn domain(&self) -> &'static str {
        "channel"
    }

    fn channel(&self) -> &TransportChannel<ChannelHubEvent> {
        &self.channel
    }

    fn listening(&self) -> &AtomicBool {
        &self.listening
    }

    async fn route(&self, event: ChannelHubEvent) -> anyhow::Result<()> {
        match event {
            ChannelHubEvent::ChannelAdded(added) => {
                self.ctx
                    .store
                    .apply(StoreAction::ChannelUpserted {
                        server_id: added.server_id,
                        channel: added.added_channel,
                    })
                    .await;
            }
            ChannelHubEvent::ChannelUpdated(updated) => {
                self.ctx
                    .store
                    .apply(StoreAction::ChannelUpserted {
                        server_id: updated.server_id,
                        channel: updated.updated_channel,
                    })
                    .await;
            }
            ChannelHubEvent::ChannelDeleted(deleted) => self.channel_deleted(deleted).await,
        }
        Ok(())
    }
}
