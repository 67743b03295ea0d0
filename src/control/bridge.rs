//! Remote control bridge.
//!
//! Some deployments run several worker processes per host that cannot share one pub/sub
//! subscription. There, a single bridge process runs the [`ControlListener`] with a
//! [`BridgeRelay`] as its handler, and every worker keeps a [`BridgeClient`] connected to it.
//!
//! Wire format: one JSON [`Frame`] per line over TCP.
//!
//! ```text
//! worker                         bridge
//!   | -- {"type":"auth",...} -->   |
//!   | <-- {"type":"welcome"} ---   |   (or "rejected", then close)
//!   | <-- {"type":"control",...}   |   repeated
//!   | -- {"type":"ack","seq":n} -> |
//! ```
//!
//! A rejected secret disables the client for good; any other failure reconnects with
//! backoff.
//!
//! [`ControlListener`]: super::ControlListener

use super::{ControlHandler, ControlMessage, ErrorReporter};
use crate::backoff::Backoff;
use crate::error::{BridgeError, ControlError};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One line on the bridge connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Auth { secret: String },
    Welcome,
    Rejected { reason: String },
    /// A control message in its text form.
    Control { seq: u64, message: String },
    Ack { seq: u64 },
}

async fn write_frame<W: AsyncWrite + Unpin>(out: &mut W, frame: &Frame) -> Result<(), BridgeError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncBufRead + Unpin>(lines: &mut Lines<R>) -> Result<Frame, BridgeError> {
    match lines.next_line().await? {
        Some(line) => Ok(serde_json::from_str(&line)?),
        None => Err(BridgeError::Closed),
    }
}

/// Fans control messages out to every connected worker.
///
/// Cheap to clone; install it as the [`ControlHandler`] of the bridge's listener.
#[derive(Debug, Clone)]
pub struct BridgeRelay {
    tx: broadcast::Sender<(u64, String)>,
    seq: Arc<AtomicU64>,
}

impl BridgeRelay {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, seq: Arc::new(AtomicU64::new(0)) }
    }

    /// Number of authenticated workers currently connected.
    pub fn workers(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl ControlHandler for BridgeRelay {
    async fn handle(&self, message: ControlMessage) -> Result<(), ControlError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        match self.tx.send((seq, message.to_string())) {
            Ok(n) => debug!(target: "sluice::bridge", seq, workers = n, "relayed control message"),
            Err(_) => debug!(target: "sluice::bridge", seq, "no workers connected; message dropped"),
        }
        Ok(())
    }
}

/// Accepts worker connections and streams relayed messages to them.
#[derive(Debug)]
pub struct BridgeServer {
    listener: TcpListener,
    authkey: Arc<String>,
    relay: BridgeRelay,
    handshake_timeout: Duration,
}

impl BridgeServer {
    /// Listen on `addr`; workers must present `authkey`.
    pub async fn bind(addr: impl ToSocketAddrs, authkey: impl Into<String>) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            authkey: Arc::new(authkey.into()),
            relay: BridgeRelay::new(1024),
            handshake_timeout: Duration::from_secs(5),
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// The handler feeding this server.
    pub fn relay(&self) -> BridgeRelay {
        self.relay.clone()
    }

    /// Accept connections on a background task until stopped.
    pub fn spawn(self) -> BridgeServerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let relay = self.relay.clone();
        let task = tokio::spawn(self.accept_loop(stop_rx));
        BridgeServerHandle { stop: stop_tx, relay, task }
    }

    async fn accept_loop(self, mut stop: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(target: "sluice::bridge", %addr, "bridge listening");
        }
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let worker = Worker {
                            authkey: Arc::clone(&self.authkey),
                            tx: self.relay.tx.clone(),
                            handshake_timeout: self.handshake_timeout,
                            peer,
                        };
                        tokio::spawn(worker.serve(stream, stop.clone()));
                    }
                    Err(e) => warn!(target: "sluice::bridge", error = %e, "accept failed"),
                },
            }
        }
        info!(target: "sluice::bridge", "bridge stopped");
    }
}

struct Worker {
    authkey: Arc<String>,
    tx: broadcast::Sender<(u64, String)>,
    handshake_timeout: Duration,
    peer: SocketAddr,
}

impl Worker {
    async fn serve(self, stream: TcpStream, stop: watch::Receiver<bool>) {
        let peer = self.peer;
        match self.session(stream, stop).await {
            Ok(()) | Err(BridgeError::Closed) => {
                info!(target: "sluice::bridge", %peer, "worker disconnected")
            }
            Err(BridgeError::Auth(reason)) => {
                warn!(target: "sluice::bridge", %peer, %reason, "worker failed authentication")
            }
            Err(e) => warn!(target: "sluice::bridge", %peer, error = %e, "worker connection failed"),
        }
    }

    async fn session(
        self,
        stream: TcpStream,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let hello = tokio::time::timeout(self.handshake_timeout, read_frame(&mut lines))
            .await
            .map_err(|_| BridgeError::Protocol("handshake timed out".into()))??;
        let secret = match hello {
            Frame::Auth { secret } => secret,
            other => return Err(BridgeError::Protocol(format!("expected auth, got {:?}", other))),
        };
        if !bool::from(secret.as_bytes().ct_eq(self.authkey.as_bytes())) {
            let reason = "invalid authentication key".to_string();
            write_frame(&mut write, &Frame::Rejected { reason: reason.clone() }).await?;
            return Err(BridgeError::Auth(reason));
        }
        // subscribe before the welcome so nothing relayed after it is missed
        let mut rx = self.tx.subscribe();
        write_frame(&mut write, &Frame::Welcome).await?;
        info!(target: "sluice::bridge", peer = %self.peer, "worker connected");

        loop {
            tokio::select! {
                _ = stop.changed() => return Ok(()),
                relayed = rx.recv() => match relayed {
                    Ok((seq, message)) => write_frame(&mut write, &Frame::Control { seq, message }).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "sluice::bridge", peer = %self.peer, skipped, "worker fell behind; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                frame = read_frame(&mut lines) => match frame? {
                    Frame::Ack { seq } => debug!(target: "sluice::bridge", peer = %self.peer, seq, "ack"),
                    other => debug!(target: "sluice::bridge", peer = %self.peer, frame = ?other, "unexpected frame ignored"),
                },
            }
        }
    }
}

/// Handle to a spawned [`BridgeServer`].
#[derive(Debug)]
pub struct BridgeServerHandle {
    stop: watch::Sender<bool>,
    relay: BridgeRelay,
    task: JoinHandle<()>,
}

impl BridgeServerHandle {
    pub fn relay(&self) -> BridgeRelay {
        self.relay.clone()
    }

    /// Stop accepting and disconnect every worker.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(target: "sluice::bridge", error = %e, "bridge task failed");
        }
    }
}

/// Connection state of a [`BridgeClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    /// The bridge rejected our secret; remote control is off for this worker.
    Disabled,
    Stopped,
}

/// Worker side of the bridge.
pub struct BridgeClient {
    addr: String,
    authkey: String,
    handler: Arc<dyn ControlHandler>,
    reporter: Option<ErrorReporter>,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("addr", &self.addr)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl BridgeClient {
    /// A client for the bridge at `addr` (`host:port`).
    pub fn new(
        addr: impl Into<String>,
        authkey: impl Into<String>,
        handler: Arc<dyn ControlHandler>,
    ) -> Self {
        Self {
            addr: addr.into(),
            authkey: authkey.into(),
            handler,
            reporter: None,
            backoff: Backoff::default(),
            jitter: Jitter::Full,
            sleeper: Arc::new(TokioSleeper),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Report messages that fail to parse or apply.
    pub fn with_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

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

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn spawn(self) -> BridgeClientHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ClientState::Connecting);
        let task = tokio::spawn(self.run(stop_rx, state_tx));
        BridgeClientHandle { stop: stop_tx, state: state_rx, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>, state: watch::Sender<ClientState>) {
        let mut failures = 0usize;
        loop {
            if *stop.borrow() {
                break;
            }
            let _ = state.send(ClientState::Connecting);
            match self.session(&mut stop, &state, &mut failures).await {
                Ok(()) => break,
                Err(BridgeError::Auth(reason)) => {
                    error!(target: "sluice::bridge", addr = %self.addr, %reason, "bridge rejected credentials; remote control disabled");
                    if let Some(reporter) = &self.reporter {
                        reporter.report(&format!("Bridge at {} rejected authentication: {}", self.addr, reason)).await;
                    }
                    let _ = state.send(ClientState::Disabled);
                    return;
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.jitter.apply(self.backoff.delay(failures));
                    warn!(
                        target: "sluice::bridge",
                        addr = %self.addr,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "bridge connection lost"
                    );
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
            }
        }
        let _ = state.send(ClientState::Stopped);
    }

    /// One connection; `Ok` only when asked to stop.
    async fn session(
        &self,
        stop: &mut watch::Receiver<bool>,
        state: &watch::Sender<ClientState>,
        failures: &mut usize,
    ) -> Result<(), BridgeError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| BridgeError::Protocol("connect timed out".into()))??;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write_frame(&mut write, &Frame::Auth { secret: self.authkey.clone() }).await?;
        let reply = tokio::time::timeout(self.connect_timeout, read_frame(&mut lines))
            .await
            .map_err(|_| BridgeError::Protocol("handshake timed out".into()))??;
        match reply {
            Frame::Welcome => {}
            Frame::Rejected { reason } => return Err(BridgeError::Auth(reason)),
            other => return Err(BridgeError::Protocol(format!("expected welcome, got {:?}", other))),
        }

        *failures = 0;
        let _ = state.send(ClientState::Connected);
        info!(target: "sluice::bridge", addr = %self.addr, "connected to control bridge");

        loop {
            tokio::select! {
                _ = stop.changed() => return Ok(()),
                frame = read_frame(&mut lines) => match frame? {
                    Frame::Control { seq, message } => {
                        self.apply(&message).await;
                        write_frame(&mut write, &Frame::Ack { seq }).await?;
                    }
                    other => debug!(target: "sluice::bridge", frame = ?other, "unexpected frame ignored"),
                },
            }
        }
    }

    async fn apply(&self, text: &str) {
        let result = match ControlMessage::parse(text) {
            Ok(message) => self.handler.handle(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(target: "sluice::bridge", %text, error = %e, "relayed control message failed");
            if let Some(reporter) = &self.reporter {
                reporter.report(&format!("Failed to handle command {:?}: {}", text, e)).await;
            }
        }
    }
}

/// Handle to a spawned [`BridgeClient`].
#[derive(Debug)]
pub struct BridgeClientHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<ClientState>,
    task: JoinHandle<()>,
}

impl BridgeClientHandle {
    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    /// Wait until the client reaches `target`.
    pub async fn wait_for(&mut self, target: ClientState) {
        let _ = self.state.wait_for(|s| *s == target).await;
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(target: "sluice::bridge", error = %e, "bridge client task failed");
        }
    }
}
