//! Per-hub routers: each turns its hub's events into replica actions and
//! owns the policy side effects of its domain.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use shared::{domain::ProfileId, events::HubEvent};
use tracing::{debug, warn};

use crate::{
    error::TransportError,
    signals::SignalBus,
    store::ReplicaStore,
    transport::{handler_fn, TransportChannel},
};

mod channel;
mod direct_message;
mod member;
mod message;
mod server;

pub use channel::ChannelRouter;
pub use direct_message::DirectMessageRouter;
pub use member::MemberRouter;
pub use message::MessageRouter;
pub use server::ServerRouter;

/// What every router gets injected with.
#[derive(Clone)]
pub struct RouterContext {
    pub store: Arc<ReplicaStore>,
    pub signals: SignalBus,
    /// Profile of the signed-in user.
    pub viewer: ProfileId,
}

#[async_trait]
pub trait Router: Send + Sync + 'static {
    type Event: HubEvent;

    fn domain(&self) -> &'static str;

    fn channel(&self) -> &TransportChannel<Self::Event>;

    fn listening(&self) -> &AtomicBool;

    async fn route(&self, event: Self::Event) -> anyhow::Result<()>;

    /// Registers one handler per event kind. Calling it again while already
    /// listening does nothing.
    fn setup_listeners(self: &Arc<Self>) -> Result<(), TransportError>
    where
        Self: Sized,
    {
        if self.listening().swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for kind in <Self::Event as HubEvent>::kinds() {
            let router = Arc::downgrade(self);
            let handler = handler_fn(move |event: Self::Event| {
                let router = router.clone();
                async move {
                    let Some(router) = router.upgrade() else {
                        return Ok(());
                    };
                    if let Err(err) = router.route(event).await {
                        warn!(domain = router.domain(), "event handling failed: {err:#}");
                    }
                    Ok(())
                }
            });
            if let Err(err) = self.channel().on(*kind, handler) {
                self.cleanup();
                return Err(err);
            }
        }
        debug!(domain = self.domain(), "listeners registered");
        Ok(())
    }

    fn cleanup(&self) {
        if !self.listening().swap(false, Ordering::SeqCst) {
            return;
        }
        for kind in <Self::Event as HubEvent>::kinds() {
            self.channel().off(*kind);
        }
        debug!(domain = self.domain(), "listeners removed");
    }
}

#[cfg(test)]
#[path = "../tests/router_tests.rs"]
mod tests;
