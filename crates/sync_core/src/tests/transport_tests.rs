use super::*;
use crate::test_support::{eventually, FakeHub};
use serde_json::json;
use shared::{domain::ServerId, events::ServerHubEvent, events::ServerHubEventKind};

fn endpoint() -> Url {
    Url::parse("http://hub.test/hubs/serverHub").expect("url")
}

fn channel_with(hub: &FakeHub, options: ChannelOptions) -> TransportChannel<ServerHubEvent> {
    TransportChannel::new(
        Arc::new(hub.clone()),
        Arc::new(crate::connector::StaticCredential::new("token")),
        options,
    )
}

fn fast_options() -> ChannelOptions {
    ChannelOptions {
        reconnect_delays: vec![Duration::ZERO, Duration::from_millis(10), Duration::from_millis(10)],
        invoke_timeout: Duration::from_millis(500),
    }
}

fn recorder() -> (
    Arc<Mutex<Vec<ServerId>>>,
    Arc<dyn EventHandler<ServerHubEvent>>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = handler_fn(move |event: ServerHubEvent| {
        let sink = Arc::clone(&sink);
        async move {
            let ServerHubEvent::ServerDeleted(id) = event;
            sink.lock().expect("lock").push(id);
            Ok(())
        }
    });
    (seen, handler)
}

#[tokio::test]
async fn connect_twice_opens_one_link() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());

    channel.connect(endpoint()).await.expect("connect");
    channel.connect(endpoint()).await.expect("second connect");

    assert_eq!(hub.opens(), 1);
    assert!(channel.is_connected());
}

#[tokio::test]
async fn registering_before_any_connection_is_an_error_not_a_panic() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    let (_, handler) = recorder();

    let err = channel
        .on(ServerHubEventKind::ServerDeleted, handler)
        .expect_err("no connection yet");
    assert!(matches!(err, TransportError::NotConnected));
    channel.off(ServerHubEventKind::ServerDeleted);
}

#[tokio::test]
async fn invoke_requires_a_connection() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    let err = channel
        .invoke(JOIN_GROUP, vec![json!("g")])
        .await
        .expect_err("disconnected");
    assert!(matches!(err, TransportError::NotConnected));
}

#[tokio::test]
async fn failed_connect_reports_and_returns_to_disconnected() {
    let hub = FakeHub::new();
    hub.set_offline(true);
    let channel = channel_with(&hub, fast_options());

    let err = channel.connect(endpoint()).await.expect_err("offline");
    assert!(matches!(err, TransportError::Connect(_)));
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn repeated_joins_and_leaves_track_the_net_set() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");

    let a = GroupId::new("a");
    let b = GroupId::new("b");
    channel.join_group(&a).await.expect("join a");
    channel.join_group(&a).await.expect("join a again");
    channel.join_group(&b).await.expect("join b");
    channel.leave_group(&b).await.expect("leave b");
    channel.leave_group(&b).await.expect("leave b again");

    assert_eq!(channel.joined_groups(), vec![a]);
    assert_eq!(hub.calls_to("serverHub", JOIN_GROUP), vec!["a", "b"]);
    assert_eq!(hub.calls_to("serverHub", LEAVE_GROUP), vec!["b"]);
}

#[tokio::test]
async fn rejected_join_is_returned_and_not_tracked() {
    let hub = FakeHub::new();
    hub.fail_group("forbidden");
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");

    let err = channel
        .join_group(&GroupId::new("forbidden"))
        .await
        .expect_err("rejected");
    assert!(matches!(err, TransportError::Remote { .. }));
    assert!(channel.joined_groups().is_empty());
}

#[tokio::test]
async fn unanswered_invoke_times_out() {
    let hub = FakeHub::new();
    hub.set_silent(true);
    let channel = channel_with(
        &hub,
        ChannelOptions {
            invoke_timeout: Duration::from_millis(50),
            ..fast_options()
        },
    );
    channel.connect(endpoint()).await.expect("connect");

    let err = channel
        .join_group(&GroupId::new("slow"))
        .await
        .expect_err("timeout");
    assert!(matches!(err, TransportError::Timeout { .. }));
    assert!(channel.joined_groups().is_empty());
}

#[tokio::test]
async fn reconnect_rejoins_every_group_once_even_when_one_fails() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");
    for name in ["g1", "g2", "g3"] {
        channel.join_group(&GroupId::new(name)).await.expect("join");
    }

    hub.fail_group("g2");
    hub.clear_calls();
    hub.sever_all();

    eventually("second link", || hub.opens() == 2 && channel.is_connected()).await;
    eventually("three rejoin attempts", || {
        hub.calls_to("serverHub", JOIN_GROUP).len() == 3
    })
    .await;

    let mut rejoined = hub.calls_to("serverHub", JOIN_GROUP);
    rejoined.sort();
    assert_eq!(rejoined, vec!["g1", "g2", "g3"]);
    assert_eq!(channel.joined_groups().len(), 3);
}

#[tokio::test]
async fn reconnect_gives_up_after_the_last_delay() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");

    hub.set_offline(true);
    hub.sever_all();

    let mut state = channel.watch_state();
    state
        .wait_for(|state| *state == ChannelState::Disconnected)
        .await
        .expect("gave up");
    assert_eq!(hub.opens(), 1 + fast_options().reconnect_delays.len());
}

#[tokio::test]
async fn server_close_without_reconnect_ends_the_session() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");

    let mut state = channel.watch_state();
    hub.send_frame(
        "serverHub",
        HubMessage::Close {
            error: Some("server shutting down".into()),
            allow_reconnect: false,
        },
    );
    state
        .wait_for(|state| *state == ChannelState::Disconnected)
        .await
        .expect("closed");
    assert_eq!(hub.opens(), 1);
}

#[tokio::test]
async fn join_waits_for_readiness_instead_of_dropping() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    let cancel = CancellationToken::new();
    let group = GroupId::new("later");

    let waiting = {
        let channel = channel.clone();
        let cancel = cancel.clone();
        let group = group.clone();
        tokio::spawn(async move {
            channel
                .join_group_when_ready(&group, Duration::from_secs(2), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(hub.calls().is_empty());

    channel.connect(endpoint()).await.expect("connect");
    waiting.await.expect("task").expect("joined after connect");
    assert_eq!(channel.joined_groups(), vec![group]);
}

#[tokio::test]
async fn readiness_wait_times_out_or_is_cancelled() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    let cancel = CancellationToken::new();

    let err = channel
        .join_group_when_ready(&GroupId::new("g"), Duration::from_millis(20), &cancel)
        .await
        .expect_err("never connected");
    assert!(matches!(
        err,
        TransportError::NotReady(ReadyError::TimedOut(_))
    ));

    cancel.cancel();
    assert_eq!(
        channel.ready(Duration::from_secs(5), &cancel).await,
        Err(ReadyError::Cancelled)
    );
}

#[tokio::test]
async fn events_reach_the_registered_handler_in_order() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");
    let (seen, handler) = recorder();
    channel
        .on(ServerHubEventKind::ServerDeleted, handler)
        .expect("on");

    let ids: Vec<ServerId> = (0..5).map(|_| ServerId::random()).collect();
    for id in &ids {
        hub.push("serverHub", "ReceiveServerDeleted", json!(id.to_string()));
    }
    hub.push("serverHub", "ReceiveServerDeleted", json!({"not": "an id"}));
    hub.push("serverHub", "ReceiveSomethingNew", json!(1));

    eventually("five events", || seen.lock().expect("lock").len() == 5).await;
    assert_eq!(*seen.lock().expect("lock"), ids);

    channel.off(ServerHubEventKind::ServerDeleted);
    hub.push("serverHub", "ReceiveServerDeleted", json!(ServerId::random().to_string()));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(seen.lock().expect("lock").len(), 5);
}

#[tokio::test]
async fn failing_handler_does_not_stop_later_events() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");

    let count = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&count);
    channel
        .on(
            ServerHubEventKind::ServerDeleted,
            handler_fn(move |_event: ServerHubEvent| {
                let sink = Arc::clone(&sink);
                async move {
                    let mut count = sink.lock().expect("lock");
                    *count += 1;
                    if *count == 1 {
                        anyhow::bail!("first event fails");
                    }
                    Ok(())
                }
            }),
        )
        .expect("on");

    hub.push("serverHub", "ReceiveServerDeleted", json!(ServerId::random().to_string()));
    hub.push("serverHub", "ReceiveServerDeleted", json!(ServerId::random().to_string()));
    eventually("both events handled", || *count.lock().expect("lock") == 2).await;
}

#[tokio::test]
async fn disconnect_leaves_groups_and_forgets_them() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");
    channel.join_group(&GroupId::new("x")).await.expect("join");
    channel.join_group(&GroupId::new("y")).await.expect("join");

    channel.disconnect().await;

    let mut left = hub.calls_to("serverHub", LEAVE_GROUP);
    left.sort();
    assert_eq!(left, vec!["x", "y"]);
    assert!(channel.joined_groups().is_empty());
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn detached_leave_forgets_now_and_stays_ahead_of_a_later_join() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");
    let group = GroupId::new("g");
    channel.join_group(&group).await.expect("join");
    hub.clear_calls();

    channel.leave_all_detached();
    assert!(channel.joined_groups().is_empty());
    channel.join_group(&group).await.expect("join again");

    let methods: Vec<String> = hub.calls().into_iter().map(|call| call.method).collect();
    assert_eq!(methods, vec![LEAVE_GROUP.to_string(), JOIN_GROUP.to_string()]);
    assert_eq!(channel.joined_groups(), vec![group]);
}

#[tokio::test]
async fn leave_while_join_is_in_flight_undoes_the_join() {
    let hub = FakeHub::new();
    let channel = channel_with(&hub, fast_options());
    channel.connect(endpoint()).await.expect("connect");
    let group = GroupId::new("conv-a");

    hub.set_silent(true);
    let joining = {
        let channel = channel.clone();
        let group = group.clone();
        tokio::spawn(async move { channel.join_group(&group).await })
    };
    eventually("join sent", || hub.calls_to("serverHub", JOIN_GROUP).len() == 1).await;

    channel.leave_group(&group).await.expect("leave");
    assert!(hub.calls_to("serverHub", LEAVE_GROUP).is_empty());

    hub.set_silent(false);
    hub.send_frame(
        "serverHub",
        HubMessage::Completion {
            invocation_id: "1".into(),
            result: None,
            error: None,
        },
    );
    joining.await.expect("join task").expect("join");

    assert_eq!(hub.calls_to("serverHub", LEAVE_GROUP), vec!["conv-a"]);
    assert!(channel.joined_groups().is_empty());
    assert!(!channel.is_joined(&group));
}
