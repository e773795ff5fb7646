use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use shared::events::DirectMessageHubEvent;

use super::{Router, RouterContext};
use crate::{store::StoreAction, transport::TransportChannel};

pub struct DirectMessageRouter {
    ctx: RouterContext,
    channel: TransportChannel<DirectMessageHubEvent>,
    listening: AtomicBool,
}

impl DirectMessageRouter {
    pub fn new(ctx: RouterContext, channel: TransportChannel<DirectMessageHubEvent>) -> Self {
        Self {
            ctx,
            channel,
            listening: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Router for DirectMessageRouter {
    type Event = DirectMessageHubEvent;

    fn domain(&self) -> &'static str {
        "direct_message"
    }

    fn channel(&self) -> &TransportChannel<DirectMessageHubEvent> {
        &self.channel
    }

    fn listening(&self) -> &AtomicBool {
        &self.listening
    }

    async fn route(&self, event: DirectMessageHubEvent) -> anyhow::Result<()> {
        let action = match event {
            DirectMessageHubEvent::DirectMessageAdded(added) => {
                StoreAction::DirectMessageReceived {
                    conversation_id: added.conversation_id,
                    message: added.message,
                }
            }
            DirectMessageHubEvent::DirectMessageUpdated(updated) => {
                StoreAction::DirectMessageEdited {
                    conversation_id: updated.conversation_id,
                    message: updated.updated_message,
                }
            }
            DirectMessageHubEvent::DirectMessageDeleted(removed) => {
                StoreAction::DirectMessageRemoved {
                    conversation_id: removed.conversation_id,
                    message_id: removed.message_id,
                }
            }
            DirectMessageHubEvent::DirectMessageSoftDeleted(removed) => {
                StoreAction::DirectMessageSoftDeleted {
                    conversation_id: removed.conversation_id,
                    message_id: removed.message_id,
                }
            }
        };
        self.ctx.store.apply(action).await;
        Ok(())
    }
}
