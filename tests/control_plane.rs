mod common;

use async_trait::async_trait;
use common::{eventually, init_tracing, put_limits, shared};
use sluice::{
    send_command, CommandRegistry, Config, ControlCommand, ControlMessage, ControlTask,
    LimitRecord, ListenerState, MemoryStore, Node, ReloadMode, Request, SharedStore, TimeUnit,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn start(store: &MemoryStore, config: Config, seed: u64) -> Node {
    init_tracing();
    let mut node = Node::builder(shared(store), config).seed(seed).start().await.unwrap();
    if let ControlTask::Local(listener) = node.control_mut() {
        listener.wait_for(ListenerState::Subscribed).await;
    }
    node
}

fn named(name: &str) -> Config {
    let mut config = Config::default();
    config.control.node_name = Some(name.to_string());
    config
}

#[tokio::test]
async fn every_node_answers_a_ping() {
    let store = MemoryStore::new();
    let a = start(&store, named("node-a"), 1).await;
    let b = start(&store, named("node-b"), 2).await;

    let mut replies = store.subscribe("replies", None).await.unwrap();
    let ping = ControlMessage::parse("ping:replies:T123").unwrap();
    assert_eq!(send_command(&store, "control", &ping).await.unwrap(), 2);

    let mut got = vec![replies.next().await.unwrap(), replies.next().await.unwrap()];
    got.sort();
    assert_eq!(got, vec!["pong:node-a:T123", "pong:node-b:T123"]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn spread_reload_lands_within_the_window() {
    let store = MemoryStore::new();
    put_limits(&store, &[LimitRecord::new("/a", 100, TimeUnit::SECOND)]).await;
    let nodes = [
        start(&store, Config::default(), 11).await,
        start(&store, Config::default(), 22).await,
        start(&store, Config::default(), 33).await,
    ];
    for node in &nodes {
        assert_eq!(node.engine().snapshot_cell().load().len(), 1);
    }

    put_limits(
        &store,
        &[LimitRecord::new("/a", 100, TimeUnit::SECOND), LimitRecord::new("/b", 1, TimeUnit::SECOND)],
    )
    .await;
    send_command(&store, "control", &ControlMessage::Reload(ReloadMode::Spread(Duration::from_secs(10))))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    for node in &nodes {
        let snapshot = node.engine().snapshot_cell().load();
        assert_eq!(snapshot.version(), 2);
        assert_eq!(snapshot.len(), 2);
        assert!(!node.coordinator().has_pending());
    }
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn immediate_reload_is_idempotent_on_content() {
    let store = MemoryStore::new();
    put_limits(&store, &[LimitRecord::new("/a", 1, TimeUnit::MINUTE).with_uuid("a")]).await;
    let node = start(&store, Config::default(), 5).await;
    let before = node.engine().snapshot_cell().load();

    let reload = ControlMessage::Reload(ReloadMode::Immediate);
    send_command(&store, "control", &reload).await.unwrap();
    let cell = node.engine().snapshot_cell().clone();
    assert!(eventually(|| cell.load().version() == 2).await);

    let after = cell.load();
    assert_eq!(before.records(), after.records());
    assert_eq!(before.checksum(), after.checksum());
    node.shutdown().await;
}

#[tokio::test]
async fn bad_entries_are_reported_and_skipped() {
    let store = MemoryStore::new();
    let mut entries = sluice::encode_entries(&[LimitRecord::new("/ok", 1, TimeUnit::MINUTE)]).unwrap();
    entries.push(b"\xc1 not msgpack".to_vec());
    store.put_limits("limits", entries).await.unwrap();

    let node = start(&store, named("n1"), 1).await;
    assert_eq!(node.engine().snapshot_cell().load().len(), 1);
    let errors = store.set_members("errors");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Failed to load limit entry 1"));
    assert!(errors[0].contains("\"node\":\"n1\""));

    // the good entry still limits
    let req = Request::new("GET", "/ok");
    assert!(node.engine().admit(&req).await.is_admitted());
    assert!(!node.engine().admit(&req).await.is_admitted());
    node.shutdown().await;
}

#[derive(Default)]
struct Drain(AtomicUsize);

#[async_trait]
impl ControlCommand for Drain {
    async fn run(&self, _args: &[String]) -> Result<(), String> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn host_commands_run_and_unknown_ones_are_reported() {
    let store = MemoryStore::new();
    let drain = Arc::new(Drain::default());
    let mut commands = CommandRegistry::new();
    commands.register("drain", drain.clone());
    commands.register("_internal", drain.clone());

    let mut node = Node::builder(shared(&store), named("n1")).commands(commands).start().await.unwrap();
    if let ControlTask::Local(listener) = node.control_mut() {
        listener.wait_for(ListenerState::Subscribed).await;
    }

    store.publish("control", "drain:now").await.unwrap();
    store.publish("control", "_internal").await.unwrap();
    store.publish("control", "frobnicate").await.unwrap();

    assert!(eventually(|| store.set_members("errors").len() == 2).await);
    assert_eq!(drain.0.load(Ordering::SeqCst), 1);
    let errors = store.set_members("errors").join("\n");
    assert!(errors.contains("Cannot understand command \\\"frobnicate\\\""));
    assert!(errors.contains("_internal"));
    node.shutdown().await;
}

#[tokio::test]
async fn listener_resubscribes_after_the_stream_drops() {
    let store = MemoryStore::new();
    let node = start(&store, named("n1"), 1).await;

    store.disconnect_subscribers();
    assert_eq!(store.subscriber_count("control"), 0);
    assert!(eventually(|| store.subscriber_count("control") == 1).await);

    let mut replies = store.subscribe("replies", None).await.unwrap();
    store.publish("control", "ping:replies").await.unwrap();
    assert_eq!(replies.next().await.as_deref(), Some("pong:n1"));
    node.shutdown().await;
}
