//! Control plane: the pub/sub protocol that keeps a fleet's limit sets in step.
//!
//! Messages are plain text on a shared channel:
//!
//! | message | effect |
//! |---|---|
//! | `ping[:channel[:data]]` | publish `pong[:node_name][:data]` on `channel` |
//! | `reload` | reload after the configured default spread |
//! | `reload:immediate` | reload now |
//! | `reload:spread:<seconds>` | reload after a random delay in `[0, seconds)` |
//! | `<name>[:args...]` | run a host-registered command |
//!
//! A [`ControlListener`] owns the subscription and hands each parsed message to a
//! [`ControlHandler`]; [`NodeControl`] is the handler that acts on the local node. Anything that
//! goes wrong is written to the errors key and channel by an [`ErrorReporter`], and the
//! listener keeps going.

/// Remote control bridge for multi-process deployments.
pub mod bridge;

use crate::backoff::Backoff;
use crate::error::{ControlError, StoreError};
use crate::jitter::Jitter;
use crate::reload::{ReloadCoordinator, ReloadMode};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{bounded, SharedStore};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A parsed control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// `ping[:channel[:data]]`; the pong goes to `channel`.
    Ping { channel: Option<String>, data: Option<String> },
    /// `reload`, `reload:immediate` or `reload:spread:<secs>`.
    Reload(ReloadMode),
    /// Any other command name, with its `:`-separated arguments.
    Custom { name: String, args: Vec<String> },
}

impl ControlMessage {
    /// Parse the text form. Only empty text is a parse error; unknown names come back as
    /// [`ControlMessage::Custom`] and are judged by the handler.
    ///
    /// `reload:spread:0` reloads immediately. Any other `reload:spread:` argument that is
    /// not a positive number a [`Duration`] can hold falls back to the default spread.
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let text = text.trim();
        let mut parts = text.split(':');
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(ControlError::Parse(text.to_string()));
        }

        match name {
            "ping" => {
                let mut rest = text.splitn(3, ':').skip(1);
                let channel = rest.next().filter(|c| !c.is_empty()).map(str::to_string);
                let data = rest.next().map(str::to_string);
                Ok(ControlMessage::Ping { channel, data })
            }
            "reload" => {
                let mode = match (parts.next(), parts.next()) {
                    (Some("immediate"), _) => ReloadMode::Immediate,
                    (Some("spread"), Some(secs)) => match secs.parse::<f64>() {
                        Ok(s) if s == 0.0 => ReloadMode::Immediate,
                        Ok(s) if s > 0.0 => Duration::try_from_secs_f64(s)
                            .map_or(ReloadMode::Default, ReloadMode::Spread),
                        _ => ReloadMode::Default,
                    },
                    _ => ReloadMode::Default,
                };
                Ok(ControlMessage::Reload(mode))
            }
            _ => Ok(ControlMessage::Custom {
                name: name.to_string(),
                args: parts.map(str::to_string).collect(),
            }),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Ping { channel, data } => {
                f.write_str("ping")?;
                if channel.is_some() || data.is_some() {
                    write!(f, ":{}", channel.as_deref().unwrap_or_default())?;
                }
                if let Some(data) = data {
                    write!(f, ":{}", data)?;
                }
                Ok(())
            }
            ControlMessage::Reload(ReloadMode::Default) => f.write_str("reload"),
            ControlMessage::Reload(ReloadMode::Immediate) => f.write_str("reload:immediate"),
            ControlMessage::Reload(ReloadMode::Spread(window)) => {
                write!(f, "reload:spread:{}", window.as_secs_f64())
            }
            ControlMessage::Custom { name, args } => {
                f.write_str(name)?;
                for arg in args {
                    write!(f, ":{}", arg)?;
                }
                Ok(())
            }
        }
    }
}

/// Reply to a ping: `pong`, then the node name (possibly empty) if either part is set,
/// then the data.
pub fn pong(node_name: Option<&str>, data: Option<&str>) -> String {
    let mut reply = String::from("pong");
    if node_name.is_some() || data.is_some() {
        reply.push(':');
        reply.push_str(node_name.unwrap_or_default());
    }
    if let Some(data) = data {
        reply.push(':');
        reply.push_str(data);
    }
    reply
}

/// Publish `message` on the control `channel`; returns how many listeners received it.
pub async fn send_command(
    store: &dyn SharedStore,
    channel: &str,
    message: &ControlMessage,
) -> Result<usize, StoreError> {
    store.publish(channel, &message.to_string()).await
}

/// Writes error records to the shared errors set and channel.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    store: Arc<dyn SharedStore>,
    errors_key: String,
    errors_channel: String,
    node_name: Option<String>,
    timeout: Duration,
}

impl ErrorReporter {
    pub fn new(
        store: Arc<dyn SharedStore>,
        errors_key: impl Into<String>,
        errors_channel: impl Into<String>,
        node_name: Option<String>,
    ) -> Self {
        Self {
            store,
            errors_key: errors_key.into(),
            errors_channel: errors_channel.into(),
            node_name,
            timeout: Duration::from_secs(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    /// The JSON record stored for `message`.
    pub fn record(&self, message: &str) -> String {
        serde_json::json!({
            "message": message,
            "node": self.node_name,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
        .to_string()
    }

    /// Store and broadcast `message`. Failures are logged, never returned.
    pub async fn report(&self, message: &str) {
        let record = self.record(message);
        if let Err(e) = bounded(self.timeout, self.store.add_to_set(&self.errors_key, &record)).await
        {
            warn!(target: "sluice::control", error = %e, report = message, "could not store error record");
        }
        if let Err(e) =
            bounded(self.timeout, self.store.publish(&self.errors_channel, &record)).await
        {
            warn!(target: "sluice::control", error = %e, report = message, "could not publish error record");
        }
    }
}

/// Something that acts on control messages.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, message: ControlMessage) -> Result<(), ControlError>;
}

/// A host-defined control command.
#[async_trait]
pub trait ControlCommand: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<(), String>;
}

/// Named [`ControlCommand`]s.
///
/// Names starting with `_` are internal: they can be registered but never invoked from
/// the control channel.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn ControlCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `command` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, command: Arc<dyn ControlCommand>) {
        self.commands.insert(name.into(), command);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `name` with `args` on behalf of a control message.
    pub async fn dispatch(&self, name: &str, args: &[String]) -> Result<(), ControlError> {
        if name.starts_with('_') {
            return Err(ControlError::InternalCommand(name.to_string()));
        }
        let command =
            self.commands.get(name).ok_or_else(|| ControlError::UnknownCommand(name.to_string()))?;
        command.run(args).await.map_err(|reason| ControlError::Command {
            command: name.to_string(),
            reason,
        })
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry").field("commands", &self.names()).finish()
    }
}

/// The handler that applies control messages to this node.
#[derive(Debug, Clone)]
pub struct NodeControl {
    store: Arc<dyn SharedStore>,
    coordinator: ReloadCoordinator,
    node_name: Option<String>,
    commands: CommandRegistry,
    timeout: Duration,
}

impl NodeControl {
    pub fn new(
        store: Arc<dyn SharedStore>,
        coordinator: ReloadCoordinator,
        node_name: Option<String>,
    ) -> Self {
        Self {
            store,
            coordinator,
            node_name,
            commands: CommandRegistry::new(),
            timeout: Duration::from_secs(1),
        }
    }

    pub fn with_commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ControlHandler for NodeControl {
    async fn handle(&self, message: ControlMessage) -> Result<(), ControlError> {
        match message {
            ControlMessage::Ping { channel: None, .. } => {
                debug!(target: "sluice::control", "ping without a reply channel ignored");
                Ok(())
            }
            ControlMessage::Ping { channel: Some(channel), data } => {
                let reply = pong(self.node_name.as_deref(), data.as_deref());
                bounded(self.timeout, self.store.publish(&channel, &reply)).await?;
                Ok(())
            }
            ControlMessage::Reload(mode) => {
                self.coordinator.schedule_reload(mode).await;
                Ok(())
            }
            ControlMessage::Custom { name, args } => self.commands.dispatch(&name, &args).await,
        }
    }
}

/// Lifecycle of a [`ControlListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Subscribed,
    Dispatching,
    Stopped,
}

/// Long-lived task reading the control channel.
pub struct ControlListener {
    store: Arc<dyn SharedStore>,
    channel: String,
    shard_hint: Option<String>,
    handler: Arc<dyn ControlHandler>,
    reporter: ErrorReporter,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    timeout: Duration,
}

impl fmt::Debug for ControlListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlListener")
            .field("channel", &self.channel)
            .field("shard_hint", &self.shard_hint)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl ControlListener {
    pub fn new(
        store: Arc<dyn SharedStore>,
        channel: impl Into<String>,
        handler: Arc<dyn ControlHandler>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            store,
            channel: channel.into(),
            shard_hint: None,
            handler,
            reporter,
            backoff: Backoff::default(),
            jitter: Jitter::Full,
            sleeper: Arc::new(TokioSleeper),
            timeout: Duration::from_secs(1),
        }
    }

    /// Passed through to [`SharedStore::subscribe`].
    pub fn with_shard_hint(mut self, hint: Option<String>) -> Self {
        self.shard_hint = hint;
        self
    }

    /// Delay between resubscribe attempts.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run on a background task.
    pub fn spawn(self) -> ListenerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ListenerState::Idle);
        let task = tokio::spawn(self.run(stop_rx, state_tx));
        ListenerHandle { stop: stop_tx, state: state_rx, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>, state: watch::Sender<ListenerState>) {
        let mut failures = 0usize;
        'outer: loop {
            if *stop.borrow() {
                break;
            }
            let subscribed = bounded(
                self.timeout,
                self.store.subscribe(&self.channel, self.shard_hint.as_deref()),
            )
            .await;
            let mut subscription = match subscribed {
                Ok(sub) => sub,
                Err(e) => {
                    failures += 1;
                    let delay = self.jitter.apply(self.backoff.delay(failures));
                    warn!(
                        target: "sluice::control",
                        channel = %self.channel,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "control subscription failed"
                    );
                    tokio::select! {
                        _ = stop.changed() => break 'outer,
                        _ = self.sleeper.sleep(delay) => continue 'outer,
                    }
                }
            };

            failures = 0;
            let _ = state.send(ListenerState::Subscribed);
            info!(target: "sluice::control", channel = %self.channel, "listening for control messages");

            loop {
                tokio::select! {
                    _ = stop.changed() => break 'outer,
                    next = subscription.next() => match next {
                        Some(text) => {
                            let _ = state.send(ListenerState::Dispatching);
                            self.dispatch(&text).await;
                            let _ = state.send(ListenerState::Subscribed);
                        }
                        None => {
                            warn!(target: "sluice::control", channel = %self.channel, "control subscription closed; resubscribing");
                            let _ = state.send(ListenerState::Idle);
                            continue 'outer;
                        }
                    },
                }
            }
        }
        let _ = state.send(ListenerState::Stopped);
        info!(target: "sluice::control", channel = %self.channel, "control listener stopped");
    }

    async fn dispatch(&self, text: &str) {
        let result = match ControlMessage::parse(text) {
            Ok(message) => {
                debug!(target: "sluice::control", %text, "control message");
                self.handler.handle(message).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(target: "sluice::control", %text, error = %e, "control message failed");
            let report = match e {
                ControlError::Parse(_) | ControlError::UnknownCommand(_) => {
                    format!("Cannot understand command {:?}", text)
                }
                other => format!("Failed to handle command {:?}: {}", text, other),
            };
            self.reporter.report(&report).await;
        }
    }
}

/// Handle to a spawned [`ControlListener`]. Dropping it also stops the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<ListenerState>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Wait until the listener reaches `target`.
    pub async fn wait_for(&mut self, target: ListenerState) {
        let _ = self.state.wait_for(|s| *s == target).await;
    }

    /// Stop the listener and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(target: "sluice::control", error = %e, "control listener task failed");
        }
    }
}
