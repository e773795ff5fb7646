use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{future::join_all, FutureExt};
use serde_json::Value;
use shared::{
    events::HubEvent,
    protocol::{GroupId, HubMessage, JOIN_GROUP, LEAVE_GROUP},
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    connector::{CredentialProvider, HubConnector, HubLink},
    error::{ReadyError, TransportError},
    groups::GroupTracker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[async_trait]
pub trait EventHandler<E>: Send + Sync + 'static {
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct HandlerFn<F, E> {
    f: F,
    _event: PhantomData<fn(E)>,
}

pub fn handler_fn<E, F, Fut>(f: F) -> Arc<dyn EventHandler<E>>
where
    E: Send + 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn {
        f,
        _event: PhantomData,
    })
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for HandlerFn<F, E>
where
    E: Send + 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: E) -> anyhow::Result<()> {
        (self.f)(event).await
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub reconnect_delays: Vec<Duration>,
    pub invoke_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reconnect_delays: [0, 2, 10, 30].map(Duration::from_secs).to_vec(),
            invoke_timeout: Duration::from_secs(30),
        }
    }
}

type InvokeResult = Result<Option<Value>, TransportError>;
type Completion = oneshot::Sender<InvokeResult>;

struct Inner<E: HubEvent> {
    endpoint: Option<Url>,
    created: bool,
    /// Bumped on every connect and stop; tasks of an older session never
    /// touch state again.
    generation: u64,
    session: Option<CancellationToken>,
    outbound: Option<mpsc::UnboundedSender<HubMessage>>,
    pending: HashMap<String, (String, Completion)>,
    handlers: HashMap<E::Kind, Arc<dyn EventHandler<E>>>,
    groups: GroupTracker,
}

struct Shared<E: HubEvent> {
    connector: Arc<dyn HubConnector>,
    credentials: Arc<dyn CredentialProvider>,
    options: ChannelOptions,
    state: watch::Sender<ChannelState>,
    next_invocation: AtomicU64,
    inner: Mutex<Inner<E>>,
}

enum PumpExit {
    Cancelled,
    Lost,
    Closed { allow_reconnect: bool },
}

/// One logical hub connection with group bookkeeping and automatic
/// reconnection. Cheap to clone; clones share the connection.
pub struct TransportChannel<E: HubEvent> {
    shared: Arc<Shared<E>>,
}

impl<E: HubEvent> Clone for TransportChannel<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: HubEvent> TransportChannel<E> {
    pub fn new(
        connector: Arc<dyn HubConnector>,
        credentials: Arc<dyn CredentialProvider>,
        options: ChannelOptions,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                credentials,
                options,
                state,
                next_invocation: AtomicU64::new(1),
                inner: Mutex::new(Inner {
                    endpoint: None,
                    created: false,
                    generation: 0,
                    session: None,
                    outbound: None,
                    pending: HashMap::new(),
                    handlers: HashMap::new(),
                    groups: GroupTracker::default(),
                }),
            }),
        }
    }

    pub fn hub(&self) -> &'static str {
        E::HUB
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn joined_groups(&self) -> Vec<GroupId> {
        lock(&self.shared.inner).groups.snapshot()
    }

    pub async fn connect(&self, endpoint: Url) -> Result<(), TransportError> {
        match self.state() {
            ChannelState::Connected => return Ok(()),
            ChannelState::Connecting | ChannelState::Reconnecting => self.stop(),
            ChannelState::Disconnected => {}
        }

        let generation = {
            let mut inner = lock(&self.shared.inner);
            inner.generation += 1;
            inner.endpoint = Some(endpoint.clone());
            inner.created = true;
            self.shared.state.send_replace(ChannelState::Connecting);
            inner.generation
        };
        info!(hub = E::HUB, %endpoint, "connecting");

        let token = self.shared.credentials.bearer_token().await;
        let link = match self
            .shared
            .connector
            .open(&endpoint, token.as_deref())
            .await
        {
            Ok(link) => link,
            Err(err) => {
                warn!(hub = E::HUB, %endpoint, "connect failed: {err}");
                self.set_state_if_current(generation, ChannelState::Disconnected);
                return Err(err);
            }
        };

        let HubLink { outbound, inbound } = link;
        let cancel = CancellationToken::new();
        let tracked = {
            let mut inner = lock(&self.shared.inner);
            if inner.generation != generation {
                return Err(TransportError::Stopped);
            }
            inner.outbound = Some(outbound);
            inner.session = Some(cancel.clone());
            self.shared.state.send_replace(ChannelState::Connected);
            inner.groups.snapshot()
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().dispatch_events(events_rx));
        tokio::spawn(self.clone().supervise(generation, inbound, cancel, events_tx));
        if !tracked.is_empty() {
            tokio::spawn(self.clone().rejoin(tracked));
        }
        info!(hub = E::HUB, %endpoint, "connected");
        Ok(())
    }

    /// Registers the handler for `kind`, replacing any previous one.
    pub fn on(
        &self,
        kind: E::Kind,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Result<(), TransportError> {
        let mut inner = lock(&self.shared.inner);
        if !inner.created {
            return Err(TransportError::NotConnected);
        }
        if inner.handlers.insert(kind, handler).is_some() {
            debug!(hub = E::HUB, event = E::target(kind), "handler replaced");
        }
        Ok(())
    }

    pub fn off(&self, kind: E::Kind) {
        lock(&self.shared.inner).handlers.remove(&kind);
    }

    pub fn has_handler(&self, kind: E::Kind) -> bool {
        lock(&self.shared.inner).handlers.contains_key(&kind)
    }

    pub async fn invoke(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>, TransportError> {
        let (invocation_id, completion) = self.send_invocation(method, arguments)?;
        self.await_completion(method, invocation_id, completion)
            .await
    }

    /// Queues the invocation frame; frames leave in the order they are queued.
    fn send_invocation(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<(String, oneshot::Receiver<InvokeResult>), TransportError> {
        let mut inner = lock(&self.shared.inner);
        if *self.shared.state.borrow() != ChannelState::Connected {
            return Err(TransportError::NotConnected);
        }
        let outbound = inner
            .outbound
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let invocation_id = self
            .shared
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (tx, rx) = oneshot::channel();
        inner
            .pending
            .insert(invocation_id.clone(), (method.to_string(), tx));
        if outbound
            .send(HubMessage::invocation(&invocation_id, method, arguments))
            .is_err()
        {
            inner.pending.remove(&invocation_id);
            return Err(TransportError::ConnectionLost {
                method: method.to_string(),
            });
        }
        Ok((invocation_id, rx))
    }

    async fn await_completion(
        &self,
        method: &str,
        invocation_id: String,
        completion: oneshot::Receiver<InvokeResult>,
    ) -> InvokeResult {
        let timeout = self.shared.options.invoke_timeout;
        match tokio::time::timeout(timeout, completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost {
                method: method.to_string(),
            }),
            Err(_) => {
                lock(&self.shared.inner).pending.remove(&invocation_id);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Joins `group` unless already joined. The group is tracked only once
    /// the hub acknowledged the join, and only if no leave arrived while the
    /// join was in flight; such a join is undone on the hub.
    pub async fn join_group(&self, group: &GroupId) -> Result<(), TransportError> {
        if !lock(&self.shared.inner).groups.begin_join(group) {
            return Ok(());
        }
        let joined = self
            .invoke(JOIN_GROUP, vec![Value::from(group.as_str())])
            .await;
        let tracked = lock(&self.shared.inner)
            .groups
            .finish_join(group, joined.is_ok());
        joined?;
        if !tracked {
            debug!(hub = E::HUB, %group, "group left while joining");
            self.invoke(LEAVE_GROUP, vec![Value::from(group.as_str())])
                .await?;
            return Ok(());
        }
        debug!(hub = E::HUB, %group, "joined group");
        Ok(())
    }

    pub fn is_joined(&self, group: &GroupId) -> bool {
        lock(&self.shared.inner).groups.contains(group)
    }

    /// Stops tracking `group` immediately, then asks the hub to drop it.
    pub async fn leave_group(&self, group: &GroupId) -> Result<(), TransportError> {
        if !lock(&self.shared.inner).groups.record_leave(group) {
            return Ok(());
        }
        self.invoke(LEAVE_GROUP, vec![Value::from(group.as_str())])
            .await?;
        debug!(hub = E::HUB, %group, "left group");
        Ok(())
    }

    /// Resolves once the channel is connected, or fails after `within` or
    /// when `cancel` fires.
    pub async fn ready(
        &self,
        within: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ReadyError> {
        let mut state = self.shared.state.subscribe();
        let connected = async {
            state
                .wait_for(|state| *state == ChannelState::Connected)
                .await
                .map(|_| ())
                .map_err(|_| ReadyError::Closed)
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(ReadyError::Cancelled),
            waited = tokio::time::timeout(within, connected) => {
                waited.unwrap_or(Err(ReadyError::TimedOut(within)))
            }
        }
    }

    pub async fn join_group_when_ready(
        &self,
        group: &GroupId,
        within: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.ready(within, cancel).await?;
        self.join_group(group).await
    }

    /// Leaves every tracked group (failures are logged), stops the
    /// connection and forgets the groups.
    pub async fn disconnect(&self) {
        let groups = lock(&self.shared.inner).groups.snapshot();
        if self.is_connected() {
            let leaves = groups.iter().map(|group| async move {
                if let Err(err) = self
                    .invoke(LEAVE_GROUP, vec![Value::from(group.as_str())])
                    .await
                {
                    warn!(hub = E::HUB, %group, "leave on disconnect failed: {err}");
                }
            });
            join_all(leaves).await;
        }
        lock(&self.shared.inner).groups.drain();
        self.stop();
        info!(hub = E::HUB, "disconnected");
    }

    /// Forgets every tracked group at once and queues their `LeaveGroup`
    /// calls without waiting for the hub; failures are only logged.
    pub fn leave_all_detached(&self) {
        let groups = lock(&self.shared.inner).groups.drain();
        let mut sent = Vec::with_capacity(groups.len());
        for group in groups {
            match self.send_invocation(LEAVE_GROUP, vec![Value::from(group.as_str())]) {
                Ok(invocation) => sent.push((group, invocation)),
                Err(err) => debug!(hub = E::HUB, %group, "leave skipped: {err}"),
            }
        }
        if sent.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = self.clone();
        runtime.spawn(async move {
            for (group, (invocation_id, completion)) in sent {
                if let Err(err) = channel
                    .await_completion(LEAVE_GROUP, invocation_id, completion)
                    .await
                {
                    warn!(hub = E::HUB, %group, "detached leave failed: {err}");
                }
            }
        });
    }

    /// Tears down the current session without leaving groups. Tracked groups
    /// are kept and joined again by the next successful connect.
    pub fn stop(&self) {
        let session = {
            let mut inner = lock(&self.shared.inner);
            inner.generation += 1;
            inner.outbound = None;
            fail_pending(&mut inner.pending);
            self.shared.state.send_replace(ChannelState::Disconnected);
            inner.session.take()
        };
        if let Some(cancel) = session {
            cancel.cancel();
        }
    }

    fn set_state_if_current(&self, generation: u64, state: ChannelState) -> bool {
        let inner = lock(&self.shared.inner);
        if inner.generation != generation {
            return false;
        }
        self.shared.state.send_replace(state);
        true
    }

    async fn supervise(
        self,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<HubMessage>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<E>,
    ) {
        loop {
            let exit = self.pump(&mut inbound, &cancel, &events).await;
            {
                let mut inner = lock(&self.shared.inner);
                if inner.generation != generation {
                    return;
                }
                inner.outbound = None;
                fail_pending(&mut inner.pending);
            }

            match exit {
                PumpExit::Cancelled => return,
                PumpExit::Closed {
                    allow_reconnect: false,
                } => {
                    info!(hub = E::HUB, "hub closed the connection");
                    self.end_session(generation);
                    return;
                }
                PumpExit::Closed {
                    allow_reconnect: true,
                }
                | PumpExit::Lost => {}
            }

            if !self.set_state_if_current(generation, ChannelState::Reconnecting) {
                return;
            }
            warn!(hub = E::HUB, "connection lost, reconnecting");

            let Some(link) = self.reconnect(&cancel).await else {
                if !cancel.is_cancelled() {
                    warn!(hub = E::HUB, "reconnect attempts exhausted");
                    self.end_session(generation);
                }
                return;
            };

            let groups = {
                let mut inner = lock(&self.shared.inner);
                if inner.generation != generation {
                    return;
                }
                inner.outbound = Some(link.outbound);
                self.shared.state.send_replace(ChannelState::Connected);
                info!(
                    hub = E::HUB,
                    handlers = inner.handlers.len(),
                    "reconnected, handlers re-bound"
                );
                inner.groups.snapshot()
            };
            inbound = link.inbound;
            tokio::spawn(self.clone().rejoin(groups));
        }
    }

    fn end_session(&self, generation: u64) {
        let mut inner = lock(&self.shared.inner);
        if inner.generation != generation {
            return;
        }
        inner.session = None;
        self.shared.state.send_replace(ChannelState::Disconnected);
    }

    async fn pump(
        &self,
        inbound: &mut mpsc::UnboundedReceiver<HubMessage>,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<E>,
    ) -> PumpExit {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return PumpExit::Cancelled,
                frame = inbound.recv() => frame,
            };
            match frame {
                None => return PumpExit::Lost,
                Some(HubMessage::Invocation {
                    target, arguments, ..
                }) => self.route_event(&target, arguments, events),
                Some(HubMessage::Completion {
                    invocation_id,
                    result,
                    error,
                }) => self.complete(&invocation_id, result, error),
                Some(HubMessage::Ping) => {}
                Some(HubMessage::Close {
                    error,
                    allow_reconnect,
                }) => {
                    if let Some(error) = error {
                        warn!(hub = E::HUB, "hub closed with error: {error}");
                    }
                    return PumpExit::Closed { allow_reconnect };
                }
                Some(HubMessage::Unsupported(kind)) => {
                    debug!(hub = E::HUB, kind, "ignoring unsupported frame");
                }
            }
        }
    }

    fn route_event(&self, target: &str, arguments: Vec<Value>, events: &mpsc::UnboundedSender<E>) {
        let Some(kind) = E::kind_of(target) else {
            debug!(hub = E::HUB, target, "no event named {target}");
            return;
        };
        if !self.has_handler(kind) {
            debug!(hub = E::HUB, target, "no handler registered");
            return;
        }
        match E::decode(kind, arguments) {
            Ok(event) => {
                let _ = events.send(event);
            }
            Err(err) => warn!(hub = E::HUB, target, "dropping event: {err}"),
        }
    }

    fn complete(&self, invocation_id: &str, result: Option<Value>, error: Option<String>) {
        let Some((method, completion)) = lock(&self.shared.inner).pending.remove(invocation_id)
        else {
            debug!(hub = E::HUB, invocation_id, "completion for unknown invocation");
            return;
        };
        let outcome = match error {
            Some(message) => Err(TransportError::Remote { method, message }),
            None => Ok(result),
        };
        let _ = completion.send(outcome);
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Option<HubLink> {
        for (attempt, delay) in self.shared.options.reconnect_delays.iter().enumerate() {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(*delay) => {}
            }
            let endpoint = lock(&self.shared.inner).endpoint.clone()?;
            let token = self.shared.credentials.bearer_token().await;
            let opened = tokio::select! {
                _ = cancel.cancelled() => return None,
                opened = self.shared.connector.open(&endpoint, token.as_deref()) => opened,
            };
            match opened {
                Ok(link) => return Some(link),
                Err(err) => {
                    warn!(hub = E::HUB, attempt = attempt + 1, "reconnect attempt failed: {err}")
                }
            }
        }
        None
    }

    /// One `JoinGroup` per tracked group, concurrently; a failed rejoin is
    /// logged and the group stays tracked for the next reconnect.
    async fn rejoin(self, groups: Vec<GroupId>) {
        let attempts = groups.into_iter().map(|group| {
            let channel = self.clone();
            async move {
                match channel
                    .invoke(JOIN_GROUP, vec![Value::from(group.as_str())])
                    .await
                {
                    Ok(_) => debug!(hub = E::HUB, %group, "rejoined group"),
                    Err(err) => warn!(hub = E::HUB, %group, "rejoin failed: {err}"),
                }
            }
        });
        join_all(attempts).await;
    }

    async fn dispatch_events(self, mut events: mpsc::UnboundedReceiver<E>) {
        while let Some(event) = events.recv().await {
            let kind = event.kind();
            let handler = lock(&self.shared.inner).handlers.get(&kind).cloned();
            let Some(handler) = handler else {
                continue;
            };
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(hub = E::HUB, event = E::target(kind), "handler failed: {err:#}")
                }
                Err(_) => error!(hub = E::HUB, event = E::target(kind), "handler panicked"),
            }
        }
    }
}

fn fail_pending(pending: &mut HashMap<String, (String, Completion)>) {
    for (_, (method, completion)) in pending.drain() {
        let _ = completion.send(Err(TransportError::ConnectionLost { method }));
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
