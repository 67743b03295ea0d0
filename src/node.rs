//! One node of the fleet, fully wired.
//!
//! [`Node::builder`] takes a store and a [`Config`] and produces an [`Engine`] whose
//! snapshot is kept fresh by control messages. Those arrive either from a direct
//! subscription (local mode) or through a bridge (when `control.remote` is set).

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::control::bridge::{BridgeClient, BridgeClientHandle};
use crate::control::{
    CommandRegistry, ControlHandler, ControlListener, ErrorReporter, ListenerHandle, NodeControl,
};
use crate::engine::Engine;
use crate::error::ConfigError;
use crate::limit::ClassRegistry;
use crate::reload::ReloadCoordinator;
use crate::snapshot::SnapshotCell;
use crate::store::SharedStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for [`Node`].
#[derive(Debug)]
pub struct NodeBuilder {
    store: Arc<dyn SharedStore>,
    config: Config,
    classes: ClassRegistry,
    commands: CommandRegistry,
    clock: Arc<dyn Clock>,
    seed: Option<u64>,
}

impl NodeBuilder {
    /// Limit classes available to stored entries.
    pub fn classes(mut self, classes: ClassRegistry) -> Self {
        self.classes = classes;
        self
    }

    /// Extra control commands this node answers to.
    pub fn commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = commands;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed for reload spreading.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate the config, load the first snapshot and start listening for control messages.
    ///
    /// A store failure during the first load is reported and the node starts with no limits;
    /// the next `reload` fills them in.
    pub async fn start(self) -> Result<Node, ConfigError> {
        self.config.validate()?;
        let Self { store, config, classes, commands, clock, seed } = self;
        let control = &config.control;
        let timeout = config.store.timeout();

        let reporter = ErrorReporter::new(
            store.clone(),
            control.errors_key.clone(),
            control.errors_channel.clone(),
            control.node_name.clone(),
        )
        .with_timeout(timeout);

        let cell = SnapshotCell::new();
        let mut coordinator = ReloadCoordinator::builder(store.clone(), cell.clone(), reporter.clone())
            .classes(classes)
            .limits_key(control.limits_key.clone())
            .timeout(timeout)
            .default_spread(control.reload_spread());
        if let Some(seed) = seed {
            coordinator = coordinator.seed(seed);
        }
        let coordinator = coordinator.build();

        match coordinator.reload().await {
            Ok(snapshot) => {
                info!(target: "sluice::reload", version = snapshot.version(), limits = snapshot.len(), "initial limits loaded")
            }
            Err(e) => {
                warn!(target: "sluice::reload", error = %e, "initial limit load failed; starting without limits");
                reporter.report(&format!("Failed to load limits: {}", e)).await;
            }
        }

        let handler: Arc<dyn ControlHandler> = Arc::new(
            NodeControl::new(store.clone(), coordinator.clone(), control.node_name.clone())
                .with_commands(commands)
                .with_timeout(timeout),
        );
        let task = match &control.remote {
            Some(remote) => {
                info!(target: "sluice::control", addr = %remote.address(), "control via bridge");
                ControlTask::Remote(
                    BridgeClient::new(remote.address(), remote.authkey.clone(), handler)
                        .with_reporter(reporter)
                        .spawn(),
                )
            }
            None => ControlTask::Local(
                ControlListener::new(store.clone(), control.channel.clone(), handler, reporter)
                    .with_shard_hint(control.shard_hint.clone())
                    .with_timeout(timeout)
                    .spawn(),
            ),
        };

        let engine = Engine::new(cell, config.bucket_store(store))
            .with_clock(clock)
            .with_status(config.status.clone())
            .with_failure_status(config.failure_status.clone())
            .with_failure_policy(config.failure_policy);

        Ok(Node { engine, coordinator, task })
    }
}

/// Background task delivering control messages to this node.
#[derive(Debug)]
pub enum ControlTask {
    Local(ListenerHandle),
    Remote(BridgeClientHandle),
}

/// A running node: its engine plus the tasks keeping it current.
#[derive(Debug)]
pub struct Node {
    engine: Engine,
    coordinator: ReloadCoordinator,
    task: ControlTask,
}

impl Node {
    pub fn builder(store: Arc<dyn SharedStore>, config: Config) -> NodeBuilder {
        NodeBuilder {
            store,
            config,
            classes: ClassRegistry::new(),
            commands: CommandRegistry::new(),
            clock: Arc::new(SystemClock),
            seed: None,
        }
    }

    /// The admission engine; clone it into request handlers.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn coordinator(&self) -> &ReloadCoordinator {
        &self.coordinator
    }

    pub fn control(&self) -> &ControlTask {
        &self.task
    }

    pub fn control_mut(&mut self) -> &mut ControlTask {
        &mut self.task
    }

    /// Stop the control task. Engines already handed out keep their last snapshot.
    pub async fn shutdown(self) {
        match self.task {
            ControlTask::Local(listener) => listener.stop().await,
            ControlTask::Remote(client) => client.stop().await,
        }
    }
}
