//! In-memory hub peer shared by the transport, router and orchestrator tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use shared::{
    domain::{
        Channel, ChannelId, ChannelType, Conversation, ConversationId, DirectMessage, Member,
        MemberId, MemberRole, Message, MessageId, ProfileId, Server, ServerId,
    },
    error::ApiException,
    protocol::{DirectMessagePage, HubMessage, MessagePage},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    api::ChatApi,
    connector::{HubConnector, HubLink},
    error::{ApiFailure, TransportError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubCall {
    pub endpoint: String,
    pub method: String,
    pub group: String,
}

#[derive(Default)]
struct FakeHubState {
    offline: AtomicBool,
    refuse_next: AtomicUsize,
    silent: AtomicBool,
    opens: AtomicUsize,
    failing_groups: Mutex<HashSet<String>>,
    calls: Mutex<Vec<HubCall>>,
    links: Mutex<Vec<(String, mpsc::UnboundedSender<HubMessage>, CancellationToken)>>,
}

/// Scripted hub peer: acknowledges `JoinGroup`/`LeaveGroup`, records every
/// call, lets tests push events and sever links.
#[derive(Clone, Default)]
pub struct FakeHub {
    state: Arc<FakeHubState>,
}

impl FakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    pub fn refuse_next(&self, count: usize) {
        self.state.refuse_next.store(count, Ordering::SeqCst);
    }

    /// Stop answering invocations.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn fail_group(&self, group: impl Into<String>) {
        self.state
            .failing_groups
            .lock()
            .expect("lock")
            .insert(group.into());
    }

    pub fn allow_group(&self, group: &str) {
        self.state
            .failing_groups
            .lock()
            .expect("lock")
            .remove(group);
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<HubCall> {
        self.state.calls.lock().expect("lock").clone()
    }

    pub fn clear_calls(&self) {
        self.state.calls.lock().expect("lock").clear();
    }

    pub fn calls_to(&self, hub: &str, method: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.endpoint.ends_with(hub) && call.method == method)
            .map(|call| call.group)
            .collect()
    }

    /// Pushes a server event on every live link whose endpoint ends in `hub`.
    pub fn push(&self, hub: &str, target: &str, payload: Value) {
        for (endpoint, peer, _) in self.state.links.lock().expect("lock").iter() {
            if endpoint.ends_with(hub) {
                let _ = peer.send(HubMessage::event(target, vec![payload.clone()]));
            }
        }
    }

    pub fn send_frame(&self, hub: &str, frame: HubMessage) {
        for (endpoint, peer, _) in self.state.links.lock().expect("lock").iter() {
            if endpoint.ends_with(hub) {
                let _ = peer.send(frame.clone());
            }
        }
    }

    /// Drops every live link, as a network failure would.
    pub fn sever_all(&self) {
        let links = std::mem::take(&mut *self.state.links.lock().expect("lock"));
        for (_, _, kill) in links {
            kill.cancel();
        }
    }
}

#[async_trait]
impl HubConnector for FakeHub {
    async fn open(&self, endpoint: &Url, _token: Option<&str>) -> Result<HubLink, TransportError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if self.state.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{endpoint}: offline")));
        }
        if self
            .state
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Connect(format!("{endpoint}: refused")));
        }

        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<HubMessage>();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel::<HubMessage>();
        let kill = CancellationToken::new();
        let endpoint = endpoint.to_string();
        self.state
            .links
            .lock()
            .expect("lock")
            .push((endpoint.clone(), peer_tx.clone(), kill.clone()));

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = kill.cancelled() => break,
                    frame = client_rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                let HubMessage::Invocation {
                    invocation_id: Some(invocation_id),
                    target,
                    arguments,
                } = frame
                else {
                    continue;
                };
                let group = arguments
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                state.calls.lock().expect("lock").push(HubCall {
                    endpoint: endpoint.clone(),
                    method: target.clone(),
                    group: group.clone(),
                });
                if state.silent.load(Ordering::SeqCst) {
                    continue;
                }
                let error = state
                    .failing_groups
                    .lock()
                    .expect("lock")
                    .contains(&group)
                    .then(|| format!("{target} rejected for {group}"));
                let _ = peer_tx.send(HubMessage::Completion {
                    invocation_id,
                    result: None,
                    error,
                });
            }
        });

        Ok(HubLink {
            outbound: client_tx,
            inbound: peer_rx,
        })
    }
}

/// In-memory backend: pages are served newest first, like the real API.
#[derive(Default)]
pub struct FakeApi {
    failing: AtomicBool,
    channel_messages: Mutex<HashMap<ChannelId, Vec<Message>>>,
    conversation_messages: Mutex<HashMap<ConversationId, Vec<DirectMessage>>>,
    conversations: Mutex<Vec<Conversation>>,
    servers: Mutex<Vec<Server>>,
    channel_fetches: Mutex<Vec<(ChannelId, u32)>>,
    conversation_fetches: Mutex<Vec<(ConversationId, u32)>>,
}

fn newest_page<T: Clone>(mut items: Vec<T>, page: u32, page_size: u32) -> Vec<T> {
    items.reverse();
    items
        .into_iter()
        .skip((page.saturating_sub(1) * page_size) as usize)
        .take(page_size as usize)
        .collect()
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_channel_messages(&self, channel_id: ChannelId, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| (m.created_at, m.id));
        self.channel_messages
            .lock()
            .expect("lock")
            .insert(channel_id, messages);
    }

    pub fn set_conversation_messages(
        &self,
        conversation_id: ConversationId,
        mut messages: Vec<DirectMessage>,
    ) {
        messages.sort_by_key(|m| (m.created_at, m.id));
        self.conversation_messages
            .lock()
            .expect("lock")
            .insert(conversation_id, messages);
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.conversations.lock().expect("lock").push(conversation);
    }

    pub fn set_servers(&self, servers: Vec<Server>) {
        *self.servers.lock().expect("lock") = servers;
    }

    pub fn channel_fetches(&self) -> Vec<(ChannelId, u32)> {
        self.channel_fetches.lock().expect("lock").clone()
    }

    pub fn conversation_fetches(&self) -> Vec<(ConversationId, u32)> {
        self.conversation_fetches.lock().expect("lock").clone()
    }

    fn check(&self) -> Result<(), ApiFailure> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiException::new(500, "backend unavailable").into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn channel_messages(
        &self,
        channel_id: ChannelId,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, ApiFailure> {
        self.channel_fetches
            .lock()
            .expect("lock")
            .push((channel_id, page));
        self.check()?;
        let all = self
            .channel_messages
            .lock()
            .expect("lock")
            .get(&channel_id)
            .cloned()
            .unwrap_or_default();
        let total_count = all.len() as u64;
        Ok(MessagePage {
            messages: newest_page(all, page, page_size),
            page,
            page_size,
            total_count,
        })
    }

    async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<DirectMessagePage, ApiFailure> {
        self.conversation_fetches
            .lock()
            .expect("lock")
            .push((conversation_id, page));
        self.check()?;
        let all = self
            .conversation_messages
            .lock()
            .expect("lock")
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        let total_count = all.len() as u64;
        Ok(DirectMessagePage {
            messages: newest_page(all, page, page_size),
            page,
            page_size,
            total_count,
        })
    }

    async fn conversation_by_members(
        &self,
        member_one_id: MemberId,
        member_two_id: MemberId,
        _direct_message_limit: u32,
    ) -> Result<Conversation, ApiFailure> {
        self.check()?;
        let mut conversations = self.conversations.lock().expect("lock");
        if let Some(existing) = conversations
            .iter()
            .find(|c| c.is_between(member_one_id, member_two_id))
        {
            return Ok(existing.clone());
        }
        let created = conversation(member_one_id, member_two_id);
        conversations.push(created.clone());
        Ok(created)
    }

    async fn servers_for_profile(&self, profile_id: ProfileId) -> Result<Vec<Server>, ApiFailure> {
        self.check()?;
        Ok(self
            .servers
            .lock()
            .expect("lock")
            .iter()
            .filter(|s| s.member_for_profile(profile_id).is_some())
            .cloned()
            .collect())
    }

    async fn server_details(&self, server_id: ServerId) -> Result<Server, ApiFailure> {
        self.check()?;
        self.servers
            .lock()
            .expect("lock")
            .iter()
            .find(|s| s.id == server_id)
            .cloned()
            .ok_or_else(|| ApiException::new(404, "Server not found").into())
    }
}

pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0)
        .single()
        .expect("valid timestamp")
}

pub fn server(owner: ProfileId) -> Server {
    let id = ServerId::random();
    Server {
        id,
        name: "Rustaceans".into(),
        image_url: None,
        invite_code: "invite".into(),
        profile_id: owner,
        profile_user_name: "owner".into(),
        channels: vec![channel(id, "general", owner)],
        members: vec![member(id, owner, MemberRole::Admin)],
        created_at: at(0),
        updated_at: at(0),
    }
}

pub fn channel(server_id: ServerId, name: &str, creator: ProfileId) -> Channel {
    Channel {
        id: ChannelId::random(),
        server_id,
        name: name.into(),
        kind: ChannelType::Text,
        profile_id: creator,
        profile_name: "creator".into(),
        server_name: "Rustaceans".into(),
        messages: Vec::new(),
        created_at: at(0),
        updated_at: at(0),
    }
}

pub fn member(server_id: ServerId, profile_id: ProfileId, role: MemberRole) -> Member {
    Member {
        id: MemberId::random(),
        server_id,
        profile_id,
        role,
        deleted: false,
        profile_name: "someone".into(),
        profile_image_url: None,
        profile_email: "someone@example.com".into(),
        server_name: "Rustaceans".into(),
        created_at: at(0),
        updated_at: at(0),
    }
}

pub fn message(channel_id: ChannelId, minute: u32, content: &str) -> Message {
    Message {
        id: MessageId::random(),
        channel_id,
        member_id: MemberId::random(),
        content: content.into(),
        file_url: None,
        member_profile_name: "someone".into(),
        channel_name: "general".into(),
        deleted: false,
        created_at: at(minute),
        updated_at: at(minute),
    }
}

pub fn conversation(member_one_id: MemberId, member_two_id: MemberId) -> Conversation {
    Conversation {
        id: ConversationId::random(),
        member_one_id,
        member_two_id,
        created_at: at(0),
        direct_messages: Vec::new(),
    }
}

pub fn direct_message(conversation_id: ConversationId, minute: u32) -> DirectMessage {
    DirectMessage {
        id: MessageId::random(),
        conversation_id,
        sender_member_id: MemberId::random(),
        receiver_member_id: MemberId::random(),
        content: format!("dm at {minute}"),
        file_url: None,
        sender_member_profile_name: "sender".into(),
        receiver_member_profile_name: "receiver".into(),
        sender_member_profile_image_url: None,
        receiver_member_profile_image_url: None,
        deleted: false,
        created_at: at(minute),
        updated_at: at(minute),
    }
}
