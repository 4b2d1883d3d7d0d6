use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use futures::{FutureExt as _, future::BoxFuture};
use network_client::{
    Session, SessionError, SessionStatus, TrajectoryError,
    state::{LockState, Pose, PoseCodec, ResourceEvent, SharedResource, ValueCodec},
};
use network_shared::{
    ClientSyncConfig, ControlMessage, FrameUpdate, InboundStream, MessageSink, StateUpdate,
    Transport, TransportError, TransportResult, Value,
    prelude::keys::{self, commands},
    protocol::ClientMessage,
    transport::{LoopbackServer, LoopbackTransport},
};
use pretty_assertions::assert_eq;
use tokio::runtime::Handle;

fn fast_config() -> ClientSyncConfig {
    let mut config = ClientSyncConfig::default();
    config.state.publish_interval_ms = 5;
    config.state.keepalive_interval_ms = 20;
    config.reaper.sweep_interval_ms = 10;
    config
}

fn session(config: ClientSyncConfig) -> Session {
    Session::new(config, Handle::current())
}

/// Loopback connection that can refuse the state topic or never finish a flush.
struct FlakyTransport {
    inner: LoopbackTransport,
    refuse_state: bool,
    stall_flush: bool,
    sent: AtomicUsize,
    closed: AtomicBool,
}

impl FlakyTransport {
    fn new(server: &LoopbackServer) -> Self {
        Self {
            inner: server.connect(),
            refuse_state: false,
            stall_flush: false,
            sent: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

impl MessageSink for FlakyTransport {
    fn send(&self, message: ClientMessage) -> TransportResult<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.inner.send(message)
    }
}

impl Transport for FlakyTransport {
    fn subscribe_frames(&self) -> TransportResult<InboundStream<FrameUpdate>> {
        self.inner.subscribe_frames()
    }

    fn subscribe_state(&self) -> TransportResult<InboundStream<StateUpdate>> {
        if self.refuse_state {
            return Err(TransportError::Other("state topic unavailable".into()));
        }
        self.inner.subscribe_state()
    }

    fn subscribe_control(&self) -> TransportResult<InboundStream<ControlMessage>> {
        self.inner.subscribe_control()
    }

    fn flush(&self) -> BoxFuture<'_, TransportResult<()>> {
        if self.stall_flush {
            return futures::future::pending().boxed();
        }
        self.inner.flush()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.close();
    }
}

/// Polls `step` every couple of milliseconds until it reports success.
async fn eventually(mut step: impl FnMut() -> bool) -> bool {
    for _ in 0..1_000 {
        if step() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    false
}

#[test_log::test(tokio::test)]
async fn local_writes_reach_every_peer_after_echo() {
    let server = LoopbackServer::new();
    let mut a = session(fast_config());
    let mut b = session(fast_config());
    a.open(Arc::new(server.connect()), Instant::now()).unwrap();
    b.open(Arc::new(server.connect()), Instant::now()).unwrap();

    a.store_mut().set_local("color", "red");
    assert_eq!(a.store().get("color"), None);

    assert!(
        eventually(|| {
            a.tick(Instant::now()).unwrap();
            b.tick(Instant::now()).unwrap();
            a.store().get("color").is_some() && b.store().get("color").is_some()
        })
        .await
    );
    assert_eq!(b.store().get("color"), Some(&Value::from("red")));
    assert_eq!(server.value("color"), Some(Value::from("red")));

    assert!(
        eventually(|| {
            a.tick(Instant::now()).unwrap();
            a.store().last_rtt().is_some()
        })
        .await
    );
    let health = a.health_at(Instant::now());
    assert!(health.rtt_ms() >= 0);
    assert!(health.state > 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn second_lock_holder_is_rejected_without_writing() {
    let server = LoopbackServer::new();
    let mut a = session(fast_config());
    let mut b = session(fast_config());
    let token_a = a.open(Arc::new(server.connect()), Instant::now()).unwrap();
    b.open(Arc::new(server.connect()), Instant::now()).unwrap();

    let mut scene_a = SharedResource::new(keys::SIMULATION_POSE, PoseCodec);
    let moved = Pose {
        position: [1.0, 2.0, 3.0],
        ..Pose::IDENTITY
    };
    scene_a.update_value_with_lock(a.store_mut(), moved).unwrap();

    let mut granted = None;
    assert!(
        eventually(|| {
            a.tick(Instant::now()).unwrap();
            if let Some(event) = scene_a.poll_lock(a.store_mut()) {
                granted = Some(event);
            }
            server.value(keys::SIMULATION_POSE).is_some()
        })
        .await
    );
    assert_eq!(granted, Some(ResourceEvent::LockGranted));
    assert_eq!(server.lock_holder(keys::SIMULATION_POSE), Some(token_a));

    let mut scene_b = SharedResource::new(keys::SIMULATION_POSE, PoseCodec);
    scene_b
        .update_value_with_lock(b.store_mut(), Pose::IDENTITY)
        .unwrap();
    let mut outcome = None;
    assert!(
        eventually(|| {
            b.tick(Instant::now()).unwrap();
            outcome = scene_b.poll_lock(b.store_mut());
            outcome.is_some()
        })
        .await
    );
    assert_eq!(outcome, Some(ResourceEvent::LockRejected));
    assert_eq!(scene_b.lock_state(), LockState::Rejected);
    assert!(!b.store().pending_values().contains_key(keys::SIMULATION_POSE));
    assert_eq!(
        server.value(keys::SIMULATION_POSE),
        Some(PoseCodec.encode(&moved))
    );

    a.close().await.unwrap();
    assert_eq!(server.lock_holder(keys::SIMULATION_POSE), None);
    b.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn frames_and_command_replies_arrive_on_tick() {
    let server = LoopbackServer::new();
    server.register_command(commands::PLAY, |_| {
        BTreeMap::from([("playing".to_owned(), Value::from(true))])
    });
    let mut client = session(fast_config());
    client
        .open(Arc::new(server.connect()), Instant::now())
        .unwrap();

    server.publish_frame(FrameUpdate::new(0).with_value("particle.count", 3));
    server.publish_frame(FrameUpdate::new(1).with_value("custom", "x"));
    let mut play = client.trajectory().play().unwrap();

    let mut reply = None;
    assert!(
        eventually(|| {
            client.tick(Instant::now()).unwrap();
            if reply.is_none() {
                reply = play.try_result();
            }
            reply.is_some()
                && client
                    .trajectory()
                    .current_frame()
                    .is_some_and(|frame| frame.contains("custom"))
        })
        .await
    );

    let frame = client.trajectory().current_frame().unwrap();
    assert_eq!(frame.particle_count(), Some(3));
    assert!(frame.contains("custom"));
    let result = reply.unwrap().unwrap();
    assert_eq!(result["playing"], Value::from(true));

    let mut unknown = client.trajectory().list_commands().unwrap();
    let mut answer = None;
    eventually(|| {
        client.tick(Instant::now()).unwrap();
        answer = unknown.try_result();
        answer.is_some()
    })
    .await;
    assert!(answer.unwrap().unwrap().contains_key("error"));

    client.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn severed_connection_is_reported_once() {
    let server = LoopbackServer::new();
    let transport = Arc::new(server.connect());
    let id = transport.connection_id();
    let mut client = session(fast_config());
    client.open(transport.clone(), Instant::now()).unwrap();

    assert!(server.sever(id));
    let mut failure = None;
    assert!(
        eventually(|| match client.tick(Instant::now()) {
            Ok(_) => false,
            Err(err) => {
                failure = Some(err);
                true
            }
        })
        .await
    );
    assert!(matches!(failure, Some(SessionError::Receiver { .. })));
    assert_eq!(client.status(), SessionStatus::Disconnected);
    assert_eq!(client.tick(Instant::now()).unwrap(), Default::default());

    client.close().await.unwrap();
    assert_eq!(client.status(), SessionStatus::Closed);
    assert!(matches!(
        client.tick(Instant::now()),
        Err(SessionError::NotOpen)
    ));
}

#[test_log::test(tokio::test)]
async fn closing_removes_own_keys_for_peers() {
    let server = LoopbackServer::new();
    let mut leaving = session(fast_config());
    let mut staying = session(fast_config());
    let token = leaving
        .open(Arc::new(server.connect()), Instant::now())
        .unwrap();
    staying
        .open(Arc::new(server.connect()), Instant::now())
        .unwrap();

    let avatar = keys::avatar(&token);
    leaving.store_mut().set_local(avatar.clone(), "hands");
    assert!(
        eventually(|| {
            leaving.tick(Instant::now()).unwrap();
            staying.tick(Instant::now()).unwrap();
            staying.store().contains(&avatar)
        })
        .await
    );

    leaving.close().await.unwrap();
    assert!(leaving.store().replica().is_empty());
    assert!(
        eventually(|| {
            staying.tick(Instant::now()).unwrap();
            !staying.store().contains(&avatar)
        })
        .await
    );
    assert_eq!(server.value(&keys::update_index(&token)), None);
    assert_eq!(server.connection_count(), 1);

    staying.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn silent_peer_is_reaped() {
    let server = LoopbackServer::new();
    server.set_value("update.index.ghost", 4u64);
    server.set_value("avatar.ghost", "hands");
    server.set_value("playarea.ghost", Value::number_list([0.0f32; 4]));

    let mut config = fast_config();
    config.reaper.timeout_ms = 50;
    let mut client = session(config);
    client
        .open(Arc::new(server.connect()), Instant::now())
        .unwrap();

    let mut reaped = Vec::new();
    assert!(
        eventually(|| {
            let report = client.tick(Instant::now()).unwrap();
            reaped.extend(report.reaped);
            server.value("avatar.ghost").is_none()
        })
        .await
    );
    assert_eq!(reaped, vec!["ghost".to_owned()]);
    assert_eq!(server.value("update.index.ghost"), None);
    assert_eq!(server.value("playarea.ghost"), None);

    client.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn health_is_reported_when_suggested() {
    let server = LoopbackServer::new();
    server.set_value(keys::SUGGEST_HEALTH_REPORT, true);
    let mut client = session(fast_config());
    let token = client
        .open(Arc::new(server.connect()), Instant::now())
        .unwrap();
    let report_key = keys::health_report(&token);

    assert!(
        eventually(|| {
            client.tick(Instant::now()).unwrap();
            server.value(&report_key).is_some()
        })
        .await
    );
    assert!(client.health_reporting());
    let report = server.value(&report_key).unwrap();
    let fields = report.as_map().unwrap();
    assert!(fields.contains_key("frame"));
    assert!(fields.contains_key("state"));
    assert!(fields.contains_key("rtt"));

    client.close().await.unwrap();
    assert_eq!(server.value(&report_key), None);
}

#[test_log::test(tokio::test)]
async fn failed_open_leaves_nothing_running() {
    let server = LoopbackServer::new();
    let mut refusing = FlakyTransport::new(&server);
    refusing.refuse_state = true;
    let refusing = Arc::new(refusing);
    let mut client = session(fast_config());

    let result = client.open(refusing.clone(), Instant::now());
    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert_eq!(client.status(), SessionStatus::Closed);
    assert!(!client.trajectory().is_open());
    assert!(matches!(
        client.trajectory().play(),
        Err(TrajectoryError::NotOpen)
    ));
    assert_eq!(refusing.sent.load(Ordering::SeqCst), 0);

    client
        .open(Arc::new(server.connect()), Instant::now())
        .unwrap();
    assert_eq!(client.status(), SessionStatus::Open);
    client.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn close_gives_up_on_a_stalled_flush() {
    let server = LoopbackServer::new();
    let mut stalling = FlakyTransport::new(&server);
    stalling.stall_flush = true;
    let stalling = Arc::new(stalling);

    let mut config = fast_config();
    config.state.close_flush_timeout_ms = 50;
    let mut client = session(config);
    client.open(stalling.clone(), Instant::now()).unwrap();
    client.store_mut().set_local("color", "red");

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(5), client.close())
        .await
        .expect("close must not wait for the stalled flush")
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2));
    assert!(stalling.closed.load(Ordering::SeqCst));
    assert_eq!(client.status(), SessionStatus::Closed);
    assert_eq!(server.connection_count(), 0);
}
