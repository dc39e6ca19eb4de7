//! Integration tests for units wired over in-memory channels.

use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use unitrun::Call;
use unitrun::ConnectionId;
use unitrun::Error;
use unitrun::Incoming;
use unitrun::Unit;
use unitrun::UnitBuilder;
use unitrun::UnitEvent;
use unitrun::UnitState;
use unitrun::builder;
use unitrun::memory;
use unitrun::memory::MemoryChannel;
use unitrun::pending;
use unitrun::router;
use unitrun::transport::Channel;
use unitwire::Envelope;
use unitwire::Packet;
use unitwire::Role;
use unitwire::Transferable;
use unitwire::actions;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The far end of a unit's link, driven by hand.
struct RawPeer {
    channel: MemoryChannel,
}

impl RawPeer {
    async fn next(&self) -> Envelope {
        let packet = tokio::time::timeout(Duration::from_secs(2), self.channel.recv())
            .await
            .expect("nothing arrived")
            .unwrap()
            .expect("link closed");
        unitwire::open(packet).unwrap()
    }

    async fn reply(&self, to: &Envelope, data: Value, rejected: bool) {
        let mut reply = Envelope::reply_to(to, data, rejected);
        self.channel.send(unitwire::seal(&mut reply).unwrap()).await.unwrap();
    }

    async fn send_call(&self, envelope: &Envelope) {
        let frame = unitwire::encode(envelope).unwrap();
        self.channel.send(Packet { frame, transfer: Vec::new() }).await.unwrap();
    }

    async fn send_raw(&self, value: Value) {
        let frame = serde_json::to_vec(&value).unwrap();
        self.channel.send(Packet { frame, transfer: Vec::new() }).await.unwrap();
    }
}

/// Starts a worker whose parent is a hand-driven peer, and swallows its
/// construction announcement.
async fn worker_with_raw_parent(builder: UnitBuilder) -> (Unit, RawPeer) {
    let (unit_end, peer_end) = MemoryChannel::pair();
    let unit = builder.parent(unit_end).start().await.unwrap();
    let peer = RawPeer { channel: peer_end };

    let constructed = peer.next().await;
    assert_eq!(constructed.action(), Some(actions::CONSTRUCTED));
    (unit, peer)
}

/// Links a main unit and a worker unit to each other.
async fn linked(worker: UnitBuilder) -> (Unit, Unit) {
    let (main_end, worker_end) = MemoryChannel::pair();
    let main = UnitBuilder::new(Role::Main)
        .parent(main_end)
        .parent_role(Role::Worker)
        .start()
        .await
        .unwrap();
    let worker = worker.parent(worker_end).start().await.unwrap();
    (main, worker)
}

async fn wait_for(events: &mut broadcast::Receiver<UnitEvent>, want: impl Fn(&UnitEvent) -> bool) -> UnitEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("event did not arrive")
}

// --- Request / reply ---

#[tokio::test]
async fn test_ping_round_trip_embeds_id() {
    init_tracing();
    let (main, _worker) = linked(UnitBuilder::new(Role::Worker)).await;

    let pending = main.issue(Role::Worker, Call::new(actions::PING)).await.unwrap();
    let id = pending.id().clone();
    let reply = pending.wait().await.unwrap();

    assert_eq!(reply.reply_id(), Some(&id));
    assert_eq!(reply.data()["id"], json!(id.as_str()));
    assert_eq!(reply.data()["action"], json!("ping"));
    assert_eq!(main.pending_count(), 0);
}

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    init_tracing();
    let (worker, peer) = worker_with_raw_parent(UnitBuilder::new(Role::Worker)).await;

    let mut waiting = Vec::new();
    for i in 0..8 {
        let call = Call::new("compute").data(json!(i));
        waiting.push((i, worker.issue(Role::Main, call).await.unwrap()));
    }

    let mut calls = Vec::new();
    for _ in 0..8 {
        calls.push(peer.next().await);
    }
    calls.shuffle(&mut rand::thread_rng());
    for call in &calls {
        let n = call.data().as_i64().unwrap();
        peer.reply(call, json!(n * 10), false).await;
    }

    for (i, pending) in waiting {
        let reply = pending.wait().await.unwrap();
        assert_eq!(reply.data(), &json!(i * 10));
    }
    assert_eq!(worker.pending_count(), 0);
}

#[tokio::test]
async fn test_handler_failure_is_contained() {
    init_tracing();
    let worker = UnitBuilder::new(Role::Worker)
        .handler_fn("explode", |_| async { Err::<Value, _>(anyhow::anyhow!("disk on fire")) });
    let (main, _worker) = linked(worker).await;

    let err = main.request(Role::Worker, Call::new("explode")).await.unwrap_err();
    match err {
        Error::Rejected(reason) => assert!(reason.contains("disk on fire"), "{}", reason),
        other => panic!("expected rejection, got {:?}", other),
    }

    let pong = main.request(Role::Worker, Call::new(actions::PING)).await.unwrap();
    assert_eq!(pong["action"], json!("ping"));
}

#[tokio::test]
async fn test_unregistered_action_is_rejected() {
    init_tracing();
    let (main, _worker) = linked(UnitBuilder::new(Role::Worker)).await;

    let err = main.request(Role::Worker, Call::new("teleport")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Rejected(reason) if reason == "no handler registered for action 'teleport'"
    ));
}

#[tokio::test]
async fn test_message_without_action_gets_rejection() {
    init_tracing();
    let (worker, peer) = worker_with_raw_parent(UnitBuilder::new(Role::Worker)).await;

    peer.send_raw(json!({
        "id": "m-1",
        "source": "main",
        "destination": "worker",
        "data": {},
    }))
    .await;

    let rejection = peer.next().await;
    assert!(rejection.is_rejection());
    assert_eq!(rejection.reply_id().map(|id| id.as_str()), Some("m-1"));

    // The pump survived the bad frame
    let ping = Envelope::call(Role::Main, Role::Worker, actions::PING, json!(null)).unwrap();
    peer.send_call(&ping).await;
    let pong = peer.next().await;
    assert_eq!(pong.reply_id(), Some(ping.id()));
    assert!(!pong.is_rejection());
    assert_eq!(worker.state(), UnitState::Ready);
}

#[tokio::test]
async fn test_request_times_out() {
    init_tracing();
    let builder = UnitBuilder::new(Role::Worker).request_timeout(Duration::from_millis(50));
    let (worker, _peer) = worker_with_raw_parent(builder).await;

    let err = worker.request(Role::Main, Call::new("silence")).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(worker.pending_count(), 0);
}

#[tokio::test]
async fn test_in_flight_limit() {
    init_tracing();
    let builder = UnitBuilder::new(Role::Worker).max_in_flight(1);
    let (worker, peer) = worker_with_raw_parent(builder).await;

    let first = worker.issue(Role::Main, Call::new("slow")).await.unwrap();
    let err = worker.issue(Role::Main, Call::new("slow")).await.err().unwrap();
    assert!(matches!(err, Error::TooManyInFlight(1)));

    let call = peer.next().await;
    peer.reply(&call, json!("ok"), false).await;
    first.wait().await.unwrap();

    let again = worker.issue(Role::Main, Call::new("slow")).await;
    assert!(again.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_limit_under_contention() {
    init_tracing();
    let builder = UnitBuilder::new(Role::Worker).max_in_flight(3);
    let (worker, _peer) = worker_with_raw_parent(builder).await;

    let attempts: Vec<_> = (0..16)
        .map(|i| {
            let worker = worker.clone();
            tokio::spawn(async move { worker.issue(Role::Main, Call::new("slow").data(json!(i))).await })
        })
        .collect();

    let mut held = Vec::new();
    let mut refused = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(reply) => held.push(reply),
            Err(Error::TooManyInFlight(3)) => refused += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(held.len(), 3);
    assert_eq!(refused, 13);
    assert_eq!(worker.pending_count(), 3);
}

#[tokio::test]
async fn test_unawaited_request_expires() {
    init_tracing();
    let builder = UnitBuilder::new(Role::Worker)
        .request_timeout(Duration::from_millis(50))
        .max_in_flight(1);
    let (worker, _peer) = worker_with_raw_parent(builder).await;

    let held = worker.issue(Role::Main, Call::new("silence")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(worker.pending_count(), 0);
    assert!(worker.issue(Role::Main, Call::new("again")).await.is_ok());
    assert_eq!(held.wait().await.unwrap_err(), pending::Error::Timeout);
}

#[tokio::test]
async fn test_fire_and_forget_send() {
    init_tracing();
    let (worker, peer) = worker_with_raw_parent(UnitBuilder::new(Role::Worker)).await;

    let sent = worker
        .send(Role::Main, Call::new("log").data(json!({ "line": "hello" })))
        .await
        .unwrap();
    let received = peer.next().await;

    assert_eq!(received.id(), sent.id());
    assert_eq!(received.data(), &json!({ "line": "hello" }));
    assert_eq!(worker.pending_count(), 0);
}

#[tokio::test]
async fn test_transfer_parts_move_to_receiver() {
    init_tracing();
    let worker = UnitBuilder::new(Role::Worker).handler_fn("upload", |mut incoming: Incoming| async move {
        let parts = incoming.envelope_mut().take_transfer();
        let total: usize = parts.iter().map(|p| p.as_bytes().len()).sum();
        Ok::<_, anyhow::Error>(json!({ "parts": parts.len(), "bytes": total }))
    });
    let (main, _worker) = linked(worker).await;

    let call = Call::new("upload").transfer(vec![Transferable::new(vec![1, 2, 3]), Transferable::new(vec![4])]);
    let reply = main.request(Role::Worker, call).await.unwrap();
    assert_eq!(reply, json!({ "parts": 2, "bytes": 4 }));
}

// --- Built-in actions ---

#[tokio::test]
async fn test_construction_is_announced() {
    init_tracing();
    let (unit_end, peer_end) = MemoryChannel::pair();
    let worker = UnitBuilder::new(Role::Worker).parent(unit_end).start().await.unwrap();
    let peer = RawPeer { channel: peer_end };

    let constructed = peer.next().await;
    assert_eq!(constructed.action(), Some(actions::CONSTRUCTED));
    assert_eq!(constructed.destination(), Role::Main);
    assert_eq!(constructed.data()["role"], json!("worker"));
    assert_eq!(constructed.data()["unitId"], json!(worker.id().0));
}

#[tokio::test]
async fn test_register_config_over_the_wire() {
    init_tracing();
    let (main, worker) = linked(UnitBuilder::new(Role::Worker)).await;

    let call = Call::new(actions::REGISTER_CONFIG).data(json!({ "theme": "dark", "fontSize": 12 }));
    main.request(Role::Worker, call).await.unwrap();
    let call = Call::new(actions::REGISTER_CONFIG).data(json!({ "fontSize": 14 }));
    main.request(Role::Worker, call).await.unwrap();

    assert_eq!(worker.config().get("theme"), Some(json!("dark")));
    assert_eq!(worker.config().get("fontSize"), Some(json!(14)));

    let bad = Call::new(actions::REGISTER_CONFIG).data(json!("dark"));
    let err = main.request(Role::Worker, bad).await.unwrap_err();
    assert!(matches!(err, Error::Rejected(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipelined_register_config_last_write_wins() {
    init_tracing();
    let (main, worker) = linked(UnitBuilder::new(Role::Worker)).await;

    let mut waiting = Vec::new();
    for i in 0..20 {
        let call = Call::new(actions::REGISTER_CONFIG).data(json!({ "k": i }));
        waiting.push(main.issue(Role::Worker, call).await.unwrap());
    }
    for reply in waiting {
        reply.wait().await.unwrap();
    }

    assert_eq!(worker.config().get("k"), Some(json!(19)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handlers_start_in_arrival_order() {
    init_tracing();
    let (log_tx, mut log_rx) = mpsc::unbounded_channel();
    let worker = UnitBuilder::new(Role::Worker).handler_fn("record", move |incoming: Incoming| {
        let log_tx = log_tx.clone();
        async move {
            let n = incoming.data().as_u64().unwrap_or(0);
            log_tx.send(n).unwrap();
            // Uneven work so a concurrent runner would finish out of order
            tokio::time::sleep(Duration::from_millis((n % 3) * 7)).await;
            Ok::<_, anyhow::Error>(json!(n))
        }
    });
    let (main, _worker) = linked(worker).await;

    let mut waiting = Vec::new();
    for n in 0..12u64 {
        waiting.push(main.issue(Role::Worker, Call::new("record").data(json!(n))).await.unwrap());
    }
    for (n, reply) in waiting.into_iter().enumerate() {
        assert_eq!(reply.wait().await.unwrap().data(), &json!(n));
    }

    let mut started = Vec::new();
    while let Ok(n) = log_rx.try_recv() {
        started.push(n);
    }
    assert_eq!(started, (0..12u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_notifications_are_acknowledged() {
    init_tracing();
    let (_worker, peer) = worker_with_raw_parent(UnitBuilder::new(Role::Worker)).await;

    for action in [actions::CONSTRUCTED, actions::PEER_CONNECTED, actions::CONNECTION_READY] {
        let notice = Envelope::call(Role::Main, Role::Worker, action, json!({ "from": "main" })).unwrap();
        peer.send_call(&notice).await;

        let reply = peer.next().await;
        assert_eq!(reply.reply_id(), Some(notice.id()));
        assert!(!reply.is_rejection());
        assert_eq!(reply.data(), &Value::Null);
    }
}

// --- Hub topology ---

#[tokio::test]
async fn test_hub_without_connections_cannot_route() {
    init_tracing();
    let (listener, _connector) = memory::listener();
    let hub = UnitBuilder::new(Role::Shared).acceptor(listener).start().await.unwrap();

    let err = hub.request(Role::Renderer, Call::new("anyone")).await.unwrap_err();
    assert!(matches!(err, Error::Routing(router::Error::NoConnections)));

    let err = hub
        .request(Role::Renderer, Call::new("anyone").application("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Routing(router::Error::UnknownApplication(name)) if name == "ghost"));
}

#[tokio::test]
async fn test_hub_handshake_binds_and_tells_peers() {
    init_tracing();
    let (listener, connector) = memory::listener();
    let hub = UnitBuilder::new(Role::Shared).acceptor(listener).start().await.unwrap();
    let mut events = hub.subscribe();

    let (peers_tx, mut peers_rx) = mpsc::unbounded_channel();
    let editor = UnitBuilder::new(Role::Renderer)
        .parent(connector.connect().unwrap())
        .parent_role(Role::Shared)
        .application("editor")
        .handler_fn(actions::PEER_CONNECTED, move |incoming| {
            let peers_tx = peers_tx.clone();
            async move {
                let _ = peers_tx.send(incoming.data().clone());
                Ok::<_, anyhow::Error>(Value::Null)
            }
        })
        .start()
        .await
        .unwrap();

    let ready = wait_for(&mut events, |e| matches!(e, UnitEvent::ConnectionReady { .. })).await;
    assert_eq!(
        ready,
        UnitEvent::ConnectionReady { connection: ConnectionId(1), application: Some("editor".into()) }
    );
    assert_eq!(editor.assigned_connection(), Some(ConnectionId(1)));

    let _viewer = UnitBuilder::new(Role::Renderer)
        .parent(connector.connect().unwrap())
        .parent_role(Role::Shared)
        .application("viewer")
        .handler_fn("whoami", |_| async { Ok::<_, anyhow::Error>(json!("viewer")) })
        .start()
        .await
        .unwrap();

    let ready = wait_for(&mut events, |e| matches!(e, UnitEvent::ConnectionReady { .. })).await;
    assert_eq!(
        ready,
        UnitEvent::ConnectionReady { connection: ConnectionId(2), application: Some("viewer".into()) }
    );

    let note = tokio::time::timeout(Duration::from_secs(2), peers_rx.recv()).await.unwrap();
    assert_eq!(note, Some(json!({ "application": "viewer" })));

    let answer = hub
        .request(Role::Renderer, Call::new("whoami").application("viewer"))
        .await
        .unwrap();
    assert_eq!(answer, json!("viewer"));
    assert_eq!(hub.registry().lookup("editor"), Some(ConnectionId(1)));
}

#[tokio::test]
async fn test_register_application_action_binds_sender() {
    init_tracing();
    let (listener, connector) = memory::listener();
    let hub = UnitBuilder::new(Role::Shared).acceptor(listener).start().await.unwrap();
    let mut events = hub.subscribe();

    let client = UnitBuilder::new(Role::Renderer)
        .parent(connector.connect().unwrap())
        .parent_role(Role::Shared)
        .start()
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, UnitEvent::ConnectionReady { application: None, .. })).await;

    let call = Call::new(actions::REGISTER_APPLICATION).data(json!({ "application": "console" }));
    let answer = client.request(Role::Shared, call).await.unwrap();

    assert_eq!(answer, json!({ "connectionId": "conn-1" }));
    assert_eq!(hub.registry().lookup("console"), Some(ConnectionId(1)));
}

#[tokio::test]
async fn test_closed_connection_fails_its_requests() {
    init_tracing();
    let (listener, connector) = memory::listener();
    let hub = UnitBuilder::new(Role::Shared).acceptor(listener).start().await.unwrap();
    let mut events = hub.subscribe();

    let peer = RawPeer { channel: connector.connect().unwrap() };
    let handshake = peer.next().await;
    assert_eq!(handshake.action(), Some(actions::HANDSHAKE));
    assert_eq!(handshake.data()["connectionId"], json!("conn-1"));
    peer.reply(&handshake, json!({ "application": "scratch" }), false).await;
    wait_for(&mut events, |e| matches!(e, UnitEvent::ConnectionReady { .. })).await;

    let pending = hub
        .issue(Role::Renderer, Call::new("slow").connection(ConnectionId(1)))
        .await
        .unwrap();
    let _call = peer.next().await;
    drop(peer);

    let err = pending.wait().await.unwrap_err();
    assert_eq!(err, unitrun::pending::Error::ChannelClosed);

    let closed = wait_for(&mut events, |e| matches!(e, UnitEvent::ConnectionClosed(_))).await;
    assert_eq!(closed, UnitEvent::ConnectionClosed(ConnectionId(1)));
    assert!(hub.registry().is_empty());
    assert_eq!(hub.pending_count(), 0);
}

#[tokio::test]
async fn test_first_unbound_registration() {
    init_tracing();
    let (listener, connector) = memory::listener();
    let hub = UnitBuilder::new(Role::Shared).acceptor(listener).start().await.unwrap();
    let mut events = hub.subscribe();

    let first = RawPeer { channel: connector.connect().unwrap() };
    let _second = RawPeer { channel: connector.connect().unwrap() };
    wait_for(&mut events, |e| *e == UnitEvent::Connected(ConnectionId(2))).await;
    let handshake = first.next().await;
    assert_eq!(handshake.action(), Some(actions::HANDSHAKE));

    assert_eq!(hub.register_application("alpha").await, Some(ConnectionId(1)));
    assert_eq!(hub.register_application("beta").await, Some(ConnectionId(2)));
    assert_eq!(hub.register_application("gamma").await, None);

    let note = first.next().await;
    assert_eq!(note.action(), Some(actions::PEER_CONNECTED));
    assert_eq!(note.data(), &json!({ "application": "beta" }));
}

// --- Lifecycle ---

#[tokio::test]
async fn test_shutdown_fails_pending_and_refuses_new_work() {
    init_tracing();
    let (worker, _peer) = worker_with_raw_parent(UnitBuilder::new(Role::Worker)).await;

    let pending = worker.issue(Role::Main, Call::new("slow")).await.unwrap();
    worker.shutdown();

    assert_eq!(pending.wait().await.unwrap_err(), unitrun::pending::Error::ChannelClosed);
    assert_eq!(worker.state(), UnitState::Stopped);
    let err = worker.request(Role::Main, Call::new("late")).await.unwrap_err();
    assert!(matches!(err, Error::Stopped));
}

#[tokio::test]
async fn test_parent_close_is_reported() {
    init_tracing();
    let (worker, peer) = worker_with_raw_parent(UnitBuilder::new(Role::Worker)).await;
    let mut events = worker.subscribe();

    let pending = worker.issue(Role::Main, Call::new("slow")).await.unwrap();
    drop(peer);

    assert_eq!(pending.wait().await.unwrap_err(), unitrun::pending::Error::ChannelClosed);
    wait_for(&mut events, |e| *e == UnitEvent::ParentClosed).await;
}

#[tokio::test]
async fn test_builder_validation() {
    init_tracing();
    let err = UnitBuilder::new(Role::Worker).start().await.err().unwrap();
    assert!(matches!(err, builder::Error::MissingParent));

    let err = UnitBuilder::new(Role::Shared).hub(true).start().await.err().unwrap();
    assert!(matches!(err, builder::Error::MissingAcceptor));

    let (a, _b) = MemoryChannel::pair();
    let err = UnitBuilder::new(Role::Main).parent(a).start().await.err().unwrap();
    assert!(matches!(err, builder::Error::ParentIsSelf(Role::Main)));
}
