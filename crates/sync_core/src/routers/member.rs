use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use shared::events::{MemberAdded, MemberHubEvent, MemberSoftDeleted};
use tracing::info;

use super::{Router, RouterContext};
use crate::{
    signals::{NavigationTarget, SyncSignal, KICKED_NOTICE, LEFT_NOTICE},
    store::StoreAction,
    transport::TransportChannel,
};

pub struct MemberRouter {
    ctx: RouterContext,
    channel: TransportChannel<MemberHubEvent>,
    listening: AtomicBool,
}

impl MemberRouter {
    pub fn new(ctx: RouterContext, channel: TransportChannel<MemberHubEvent>) -> Self {
        Self {
            ctx,
            channel,
            listening: AtomicBool::new(false),
        }
    }

    async fn member_added(&self, payload: MemberAdded) {
        let MemberAdded {
            server_id,
            added_member,
        } = payload;
        // The viewer's own membership arrives with the server fetch that
        // follows the welcome.
        if added_member.profile_id == self.ctx.viewer {
            info!(%server_id, "added to server");
            self.ctx.signals.emit(SyncSignal::Welcome { server_id });
            return;
        }
        self.ctx
            .store
            .apply(StoreAction::MemberUpserted {
                server_id,
                member: added_member,
            })
            .await;
    }

    async fn member_soft_deleted(&self, payload: MemberSoftDeleted) {
        let MemberSoftDeleted {
            server_id,
            soft_deleted_member,
            is_kicked,
            ..
        } = payload;
        self.ctx
            .store
            .apply(StoreAction::MemberSoftDeleted {
                server_id,
                member_id: soft_deleted_member.id,
            })
            .await;

        if soft_deleted_member.profile_id != self.ctx.viewer {
            return;
        }
        info!(%server_id, is_kicked, "removed from server");
        let notice = if is_kicked { KICKED_NOTICE } else { LEFT_NOTICE };
        self.ctx.signals.emit(SyncSignal::error(notice));
        self.ctx
            .signals
            .emit(SyncSignal::Navigate(NavigationTarget::Root));
    }
}

#[async_trait]
impl Router for MemberRouter {
    type Event = MemberHubEvent;

    fn domain(&self) -> &'static str {
        "member"
    }

    fn channel(&self) -> &TransportChannel<MemberHubEvent> {
        &self.channel
    }

    fn listening(&self) -> &AtomicBool {
        &self.listening
    }

    async fn route(&self, event: MemberHubEvent) -> anyhow::Result<()> {
        match event {
            MemberHubEvent::MemberAdded(added) => self.member_added(added).await,
            MemberHubEvent::MemberSoftDeleted(removed) => self.member_soft_deleted(removed).await,
            MemberHubEvent::RoleUpdated(updated) => {
                self.ctx
                    .store
                    .apply(StoreAction::MemberUpserted {
                        server_id: updated.server_id,
                        member: updated.updated_member,
                    })
                    .await;
            }
        }
        Ok(())
    }
}
