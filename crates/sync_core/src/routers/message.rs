use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use shared::events::MessageHubEvent;

use super::{Router, RouterContext};
use crate::{store::StoreAction, transport::TransportChannel};

pub struct MessageRouter {
    ctx: RouterContext,
    channel: TransportChannel<MessageHubEvent>,
    listening: AtomicBool,
}

impl MessageRouter {
    pub fn new(ctx: RouterContext, channel: TransportChannel<MessageHubEvent>) -> Self {
        Self {
            ctx,
            channel,
            listening: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Router for MessageRouter {
    type Event = MessageHubEvent;

    fn domain(&self) -> &'static str {
        "message"
    }

    fn channel(&self) -> &TransportChannel<MessageHubEvent> {
        &self.channel
    }

    fn listening(&self) -> &AtomicBool {
        &self.listening
    }

    async fn route(&self, event: MessageHubEvent) -> anyhow::Result<()> {
        let action = match event {
            MessageHubEvent::MessageAdded(added) => StoreAction::MessageReceived {
                server_id: added.server_id,
                channel_id: added.channel_id,
                message: added.message,
            },
            MessageHubEvent::MessageUpdated(updated) => StoreAction::MessageEdited {
                server_id: updated.server_id,
                channel_id: updated.channel_id,
                message: updated.message,
            },
            MessageHubEvent::MessageDeleted(removed) => StoreAction::MessageRemoved {
                server_id: removed.server_id,
                channel_id: removed.channel_id,
                message_id: removed.message_id,
            },
            MessageHubEvent::MessageSoftDeleted(removed) => StoreAction::MessageSoftDeleted {
                server_id: removed.server_id,
                channel_id: removed.channel_id,
                message_id: removed.message_id,
            },
        };
        self.ctx.store.apply(action).await;
        Ok(())
    }
}
