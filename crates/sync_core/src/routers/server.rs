use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use shared::{domain::ServerId, events::ServerHubEvent};
use tracing::info;

use super::{Router, RouterContext};
use crate::{
    signals::{NavigationTarget, SyncSignal, SERVER_DELETED_NOTICE},
    store::StoreAction,
    transport::TransportChannel,
};

pub struct ServerRouter {
    ctx: RouterContext,
    channel: TransportChannel<ServerHubEvent>,
    listening: AtomicBool,
}

impl ServerRouter {
    pub fn new(ctx: RouterContext, channel: TransportChannel<ServerHubEvent>) -> Self {
        Self {
            ctx,
            channel,
            listening: AtomicBool::new(false),
        }
    }

    async fn server_deleted(&self, server_id: ServerId) {
        let (was_member, viewing) = self
            .ctx
            .store
            .read(|replica| {
                (
                    replica.server(server_id).is_some(),
                    replica
                        .active_channel_location()
                        .is_some_and(|(owner, _)| owner == server_id),
                )
            })
            .await;

        self.ctx
            .store
            .apply(StoreAction::ServerRemoved(server_id))
            .await;
        if viewing {
            self.ctx
                .store
                .apply(StoreAction::ActiveChannelSet(None))
                .await;
        }

        if was_member {
            info!(%server_id, "joined server was deleted");
            self.ctx.signals.emit(SyncSignal::error(SERVER_DELETED_NOTICE));
            self.ctx
                .signals
                .emit(SyncSignal::Navigate(NavigationTarget::Root));
        }
    }
}

#[async_trait]
impl Router for ServerRouter {
    type Event = ServerHubEvent;

    fn domain(&self) -> &'static str {
        "server"
    }

    fn channel(&self) -> &TransportChannel<ServerHubEvent> {
        &self.channel
    }

    fn listening(&self) -> &AtomicBool {
        &self.listening
    }

    async fn route(&self, event: ServerHubEvent) -> anyhow::Result<()> {
        match event {
            ServerHubEvent::ServerDeleted(server_id) => self.server_deleted(server_id).await,
        }
        Ok(())
    }
}
