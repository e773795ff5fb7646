//! Brings the five hubs up for the signed-in user, wires the routers and
//! tears it all down again when membership changes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use futures::future::{join_all, select_all};
use shared::{
    domain::{ChannelId, ConversationId, MemberId, ProfileId, ServerId},
    events::{
        ChannelHubEvent, DirectMessageHubEvent, HubEvent, MemberHubEvent, MessageHubEvent,
        ServerHubEvent,
    },
    protocol::GroupId,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    connector::{CredentialProvider, HubConnector},
    history::HistoryLoader,
    polling::DegradedPoller,
    routers::{
        ChannelRouter, DirectMessageRouter, MemberRouter, MessageRouter, Router, RouterContext,
        ServerRouter,
    },
    settings::SyncSettings,
    signals::SignalBus,
    store::{ReplicaStore, StoreAction},
    transport::{ChannelOptions, ChannelState, TransportChannel},
};

/// One channel per hub, all sharing the connector and credentials.
#[derive(Clone)]
pub struct Hubs {
    pub server: TransportChannel<ServerHubEvent>,
    pub channel: TransportChannel<ChannelHubEvent>,
    pub member: TransportChannel<MemberHubEvent>,
    pub message: TransportChannel<MessageHubEvent>,
    pub direct_message: TransportChannel<DirectMessageHubEvent>,
}

impl Hubs {
    pub fn new(
        connector: Arc<dyn HubConnector>,
        credentials: Arc<dyn CredentialProvider>,
        options: ChannelOptions,
    ) -> Self {
        Self {
            server: TransportChannel::new(connector.clone(), credentials.clone(), options.clone()),
            channel: TransportChannel::new(connector.clone(), credentials.clone(), options.clone()),
            member: TransportChannel::new(connector.clone(), credentials.clone(), options.clone()),
            message: TransportChannel::new(connector.clone(), credentials.clone(), options.clone()),
            direct_message: TransportChannel::new(connector, credentials, options),
        }
    }

    pub fn all_connected(&self) -> bool {
        self.server.is_connected()
            && self.channel.is_connected()
            && self.member.is_connected()
            && self.message.is_connected()
            && self.direct_message.is_connected()
    }

    fn watch_states(&self) -> Vec<watch::Receiver<ChannelState>> {
        vec![
            self.server.watch_state(),
            self.channel.watch_state(),
            self.member.watch_state(),
            self.message.watch_state(),
            self.direct_message.watch_state(),
        ]
    }

    fn leave_all_detached(&self) {
        self.server.leave_all_detached();
        self.channel.leave_all_detached();
        self.member.leave_all_detached();
        self.message.leave_all_detached();
        self.direct_message.leave_all_detached();
    }
}

struct Routers {
    server: Arc<ServerRouter>,
    channel: Arc<ChannelRouter>,
    member: Arc<MemberRouter>,
    message: Arc<MessageRouter>,
    direct_message: Arc<DirectMessageRouter>,
}

impl Routers {
    fn new(ctx: RouterContext, hubs: &Hubs) -> Self {
        Self {
            server: Arc::new(ServerRouter::new(ctx.clone(), hubs.server.clone())),
            channel: Arc::new(ChannelRouter::new(ctx.clone(), hubs.channel.clone())),
            member: Arc::new(MemberRouter::new(ctx.clone(), hubs.member.clone())),
            message: Arc::new(MessageRouter::new(ctx.clone(), hubs.message.clone())),
            direct_message: Arc::new(DirectMessageRouter::new(ctx, hubs.direct_message.clone())),
        }
    }

    fn setup_listeners(&self) {
        let results = [
            self.server.setup_listeners(),
            self.channel.setup_listeners(),
            self.member.setup_listeners(),
            self.message.setup_listeners(),
            self.direct_message.setup_listeners(),
        ];
        for err in results.into_iter().filter_map(Result::err) {
            warn!("router wiring failed: {err}");
        }
    }

    fn cleanup(&self) {
        self.server.cleanup();
        self.channel.cleanup();
        self.member.cleanup();
        self.message.cleanup();
        self.direct_message.cleanup();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// Every hub connected and the routers are wired.
    Live,
    /// At least one hub failed to connect; polling keeps the active views
    /// fresh until a later remount succeeds.
    Degraded,
    /// No server memberships, nothing was started.
    Skipped,
}

struct Session {
    server_ids: Vec<ServerId>,
    cancel: CancellationToken,
}

pub struct SyncOrchestrator {
    settings: SyncSettings,
    hubs: Hubs,
    routers: Routers,
    store: Arc<ReplicaStore>,
    signals: SignalBus,
    api: Arc<dyn ChatApi>,
    history: Arc<HistoryLoader>,
    lifetime: CancellationToken,
    session: Mutex<Option<Session>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn connect_hub<E: HubEvent>(
    channel: &TransportChannel<E>,
    settings: &SyncSettings,
) -> Result<()> {
    let endpoint = settings
        .hub_url(E::HUB)
        .with_context(|| format!("invalid endpoint for {}", E::HUB))?;
    channel
        .connect(endpoint)
        .await
        .with_context(|| format!("failed to connect {}", E::HUB))
}

async fn join_logged<E: HubEvent>(channel: &TransportChannel<E>, group: GroupId) {
    if let Err(err) = channel.join_group(&group).await {
        warn!(hub = E::HUB, %group, "group join failed: {err}");
    }
}

async fn leave_logged<E: HubEvent>(channel: &TransportChannel<E>, group: GroupId) {
    if let Err(err) = channel.leave_group(&group).await {
        warn!(hub = E::HUB, %group, "group leave failed: {err}");
    }
}

/// Joins the message group of the viewed channel and the group of the
/// active conversation. Groups already joined are skipped.
async fn join_active_views(hubs: &Hubs, store: &ReplicaStore, cancel: &CancellationToken) {
    let (active_channel, active_conversation) = store
        .read(|replica| {
            (
                replica.active_channel_location(),
                replica.active_conversation(),
            )
        })
        .await;
    if cancel.is_cancelled() {
        return;
    }
    let channel = async {
        if let Some((server_id, channel_id)) = active_channel {
            join_logged(&hubs.message, GroupId::channel(server_id, channel_id)).await;
        }
    };
    let conversation = async {
        if let Some(conversation_id) = active_conversation {
            join_logged(&hubs.direct_message, GroupId::conversation(conversation_id)).await;
        }
    };
    tokio::join!(channel, conversation);
}

/// Keeps the replica's live flag equal to "every hub is connected". When the
/// hubs come back, views whose join was given up while they were down are
/// joined again.
async fn watch_liveness(hubs: Hubs, store: Arc<ReplicaStore>, cancel: CancellationToken) {
    let mut states = hubs.watch_states();
    let mut was_live = None;
    loop {
        let live = states
            .iter()
            .all(|state| *state.borrow() == ChannelState::Connected);
        if store.apply(StoreAction::LiveChanged(live)).await {
            info!(live, "hub liveness changed");
        }
        if live && was_live == Some(false) {
            join_active_views(&hubs, &store, &cancel).await;
        }
        was_live = Some(live);
        let changes = states.iter_mut().map(|state| Box::pin(state.changed()));
        tokio::select! {
            _ = cancel.cancelled() => return,
            (changed, _, _) = select_all(changes) => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

impl SyncOrchestrator {
    pub fn new(
        settings: SyncSettings,
        viewer: ProfileId,
        connector: Arc<dyn HubConnector>,
        credentials: Arc<dyn CredentialProvider>,
        api: Arc<dyn ChatApi>,
    ) -> Self {
        let store = Arc::new(ReplicaStore::new());
        let signals = SignalBus::default();
        let hubs = Hubs::new(
            connector,
            credentials,
            ChannelOptions {
                reconnect_delays: settings.reconnect_delays.clone(),
                invoke_timeout: settings.invoke_timeout,
            },
        );
        let routers = Routers::new(
            RouterContext {
                store: Arc::clone(&store),
                signals: signals.clone(),
                viewer,
            },
            &hubs,
        );
        let history = Arc::new(HistoryLoader::new(
            Arc::clone(&api),
            Arc::clone(&store),
            settings.page_size,
        ));
        Self {
            settings,
            hubs,
            routers,
            store,
            signals,
            api,
            history,
            lifetime: CancellationToken::new(),
            session: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    pub fn hubs(&self) -> &Hubs {
        &self.hubs
    }

    pub fn api(&self) -> &Arc<dyn ChatApi> {
        &self.api
    }

    pub fn is_mounted(&self) -> bool {
        lock(&self.session).is_some()
    }

    pub fn mounted_servers(&self) -> Vec<ServerId> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.server_ids.clone())
            .unwrap_or_default()
    }

    /// Token of the current mount, or of the orchestrator when unmounted.
    fn scope(&self) -> CancellationToken {
        lock(&self.session)
            .as_ref()
            .map_or_else(|| self.lifetime.clone(), |session| session.cancel.clone())
    }

    /// Connects all five hubs for `server_ids`, joins their groups and wires
    /// the routers. A connect failure leaves the replica in degraded mode;
    /// retrying is up to the caller.
    pub async fn mount(&self, server_ids: Vec<ServerId>) -> Result<MountOutcome> {
        if server_ids.is_empty() {
            debug!("no server memberships, skipping mount");
            return Ok(MountOutcome::Skipped);
        }
        if self.is_mounted() {
            self.unmount();
        }

        let cancel = self.lifetime.child_token();
        *lock(&self.session) = Some(Session {
            server_ids: server_ids.clone(),
            cancel: cancel.clone(),
        });
        DegradedPoller::new(
            Arc::clone(&self.history),
            Arc::clone(&self.store),
            self.settings.poll_interval,
        )
        .spawn(cancel.clone());

        info!(servers = server_ids.len(), "mounting hubs");
        let (server, channel, member, message, direct_message) = tokio::join!(
            connect_hub(&self.hubs.server, &self.settings),
            connect_hub(&self.hubs.channel, &self.settings),
            connect_hub(&self.hubs.member, &self.settings),
            connect_hub(&self.hubs.message, &self.settings),
            connect_hub(&self.hubs.direct_message, &self.settings),
        );
        let failures: Vec<anyhow::Error> = [server, channel, member, message, direct_message]
            .into_iter()
            .filter_map(Result::err)
            .collect();
        tokio::spawn(watch_liveness(
            self.hubs.clone(),
            Arc::clone(&self.store),
            cancel.clone(),
        ));
        if !failures.is_empty() {
            for err in &failures {
                warn!("{err:#}");
            }
            self.store.apply(StoreAction::LiveChanged(false)).await;
            return Ok(MountOutcome::Degraded);
        }
        self.store.apply(StoreAction::LiveChanged(true)).await;

        // Handlers go in before the joins so no event of a fresh group is
        // dropped for lack of a listener.
        self.routers.setup_listeners();

        let servers = join_all(
            server_ids
                .iter()
                .map(|id| join_logged(&self.hubs.server, GroupId::server(*id))),
        );
        let members = join_all(
            server_ids
                .iter()
                .map(|id| join_logged(&self.hubs.member, GroupId::server(*id))),
        );
        let channels = join_all(
            server_ids
                .iter()
                .map(|id| join_logged(&self.hubs.channel, GroupId::server(*id))),
        );
        let viewed = join_active_views(&self.hubs, &self.store, &cancel);
        tokio::join!(servers, members, channels, viewed);

        info!("hubs mounted");
        Ok(MountOutcome::Live)
    }

    /// Detaches every router and leaves every group without waiting for the
    /// hubs. Connections stay open for the next mount.
    pub fn unmount(&self) {
        let Some(session) = lock(&self.session).take() else {
            return;
        };
        session.cancel.cancel();
        self.routers.cleanup();
        self.hubs.leave_all_detached();
        info!(servers = session.server_ids.len(), "hubs unmounted");
    }

    /// Membership changed: tear down and mount again for the new set.
    pub async fn remount(&self, server_ids: Vec<ServerId>) -> Result<MountOutcome> {
        self.unmount();
        self.mount(server_ids).await
    }

    /// Switches the direct-message group to `conversation_id`. While the hub
    /// is down the join waits for readiness instead of being dropped; asking
    /// again for the same conversation retries a join that did not land.
    pub async fn set_active_conversation(
        &self,
        conversation_id: Option<ConversationId>,
        scope: &CancellationToken,
    ) -> Result<()> {
        let previous = self.store.read(|replica| replica.active_conversation()).await;
        if previous != conversation_id {
            self.store
                .apply(StoreAction::ActiveConversationSet(conversation_id))
                .await;
            if let Some(previous) = previous {
                leave_logged(&self.hubs.direct_message, GroupId::conversation(previous)).await;
            }
        }
        let Some(conversation_id) = conversation_id else {
            return Ok(());
        };
        let group = GroupId::conversation(conversation_id);
        if self.hubs.direct_message.is_joined(&group) {
            return Ok(());
        }

        let cancel = self.scoped(scope);
        let _linked = cancel.clone().drop_guard();
        self.hubs
            .direct_message
            .join_group_when_ready(
                &group,
                self.settings.ready_timeout,
                &cancel,
            )
            .await
            .with_context(|| format!("failed to join conversation {conversation_id}"))
    }

    /// Gets or creates the conversation between two members, merges it and
    /// makes it the active one.
    pub async fn open_conversation(
        &self,
        member_one_id: MemberId,
        member_two_id: MemberId,
        scope: &CancellationToken,
    ) -> Result<ConversationId> {
        let conversation = self
            .api
            .conversation_by_members(member_one_id, member_two_id, self.settings.page_size)
            .await
            .context("failed to open conversation")?;
        let conversation_id = conversation.id;
        self.store
            .apply(StoreAction::ConversationOpened(conversation))
            .await;
        self.set_active_conversation(Some(conversation_id), scope)
            .await?;
        Ok(conversation_id)
    }

    /// Makes `channel_id` the viewed channel: loads its newest page when
    /// nothing is cached and joins its message group once the hub is ready.
    pub async fn open_channel(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        scope: &CancellationToken,
    ) -> Result<()> {
        self.store
            .apply(StoreAction::ServerSelected(Some(server_id)))
            .await;
        self.store
            .apply(StoreAction::ActiveChannelSet(Some(channel_id)))
            .await;

        let empty = self
            .store
            .read(|replica| replica.channel_messages(server_id, channel_id).is_empty())
            .await;
        if empty {
            if let Err(err) = self.history.load_older_channel(server_id, channel_id).await {
                warn!(%channel_id, "initial history load failed: {err:#}");
            }
        }

        let cancel = self.scoped(scope);
        let _linked = cancel.clone().drop_guard();
        self.hubs
            .message
            .join_group_when_ready(
                &GroupId::channel(server_id, channel_id),
                self.settings.ready_timeout,
                &cancel,
            )
            .await
            .with_context(|| format!("failed to join channel {channel_id}"))
    }

    pub async fn close_channel(&self, server_id: ServerId, channel_id: ChannelId) {
        let viewing = self
            .store
            .read(|replica| replica.active_channel() == Some(channel_id))
            .await;
        if viewing {
            self.store.apply(StoreAction::ActiveChannelSet(None)).await;
        }
        leave_logged(&self.hubs.message, GroupId::channel(server_id, channel_id)).await;
    }

    pub async fn load_older_channel(&self, server_id: ServerId, channel_id: ChannelId) -> Result<usize> {
        self.history.load_older_channel(server_id, channel_id).await
    }

    pub async fn load_older_conversation(&self, conversation_id: ConversationId) -> Result<usize> {
        self.history.load_older_conversation(conversation_id).await
    }

    pub async fn channel_has_more(&self, channel_id: ChannelId) -> bool {
        self.history.channel_has_more(channel_id).await
    }

    pub async fn conversation_has_more(&self, conversation_id: ConversationId) -> bool {
        self.history.conversation_has_more(conversation_id).await
    }

    /// Unmounts, leaves every group and closes all five connections.
    pub async fn shutdown(&self) {
        self.unmount();
        self.lifetime.cancel();
        tokio::join!(
            self.hubs.server.disconnect(),
            self.hubs.channel.disconnect(),
            self.hubs.member.disconnect(),
            self.hubs.message.disconnect(),
            self.hubs.direct_message.disconnect(),
        );
        self.store.apply(StoreAction::LiveChanged(false)).await;
        info!("sync shut down");
    }

    // Fires when either the caller's scope or the current mount ends.
    fn scoped(&self, scope: &CancellationToken) -> CancellationToken {
        let combined = scope.child_token();
        let mount = self.scope();
        let linked = combined.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = mount.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        combined
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
