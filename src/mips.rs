//! Pub/sub RPC clients for the cloud broker and for hub gateways.
//!
//! Both clients share one connection core running on its own worker thread:
//! reconnect with exponential backoff, batched topic subscription, request
//! correlation by message id and wildcard dispatch of broadcasts. The broker
//! itself sits behind the [`Broker`] trait; [`MqttBroker`] speaks MQTT through
//! `rumqttc`, [`MemoryBroker`] routes messages in process.

use crate::config::{BrokerKind, MipsConfig};
use crate::error::{MiotError, Result};
use crate::lan::check_code;
use crate::matcher::TopicMatcher;
use crate::protocol::Envelope;
use crate::runtime::{MainLoop, Worker};
use crate::types::{EventHandler, EventMessage, PropertyHandler, PropertyMessage, StateHandler};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::RngCore;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, SubscribeFilter, Transport,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue::Key};

const SUB_FIRST_FLUSH: Duration = Duration::from_millis(10);
const PROP_QUEUE_TICK: Duration = Duration::from_millis(100);
const MIPS_FROM_LOCAL: &str = "local";
const TIMEOUT_REPLY: &str = r#"{"error":{"code":-10006,"message":"timeout"}}"#;

/// What a broker session reports back to the connection core.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected,
    Disconnected(String),
    Message { topic: String, payload: Vec<u8> },
}

/// One live broker connection.
pub trait BrokerSession: Send {
    fn subscribe(&self, topics: &[String]) -> Result<()>;
    fn unsubscribe(&self, topic: &str) -> Result<()>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    fn close(&self);
}

/// Opens broker sessions. `connect` is called from inside the client's worker
/// loop, so implementations may spawn tasks on the current runtime.
pub trait Broker: Send + Sync + 'static {
    fn connect(&self, config: &MipsConfig) -> Result<(Box<dyn BrokerSession>, mpsc::UnboundedReceiver<BrokerEvent>)>;
}

/// Broadcast callback, receives the (possibly prefix-stripped) topic and the payload.
pub type BroadcastHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type MipsStateHandler = Arc<dyn Fn(bool) + Send + Sync>;
pub type DevListHandler = Arc<dyn Fn(Vec<String>) + Send + Sync>;

pub fn backoff(failures: u32, min: Duration, max: Duration) -> Duration {
    min.saturating_mul(1u32 << failures.min(6)).min(max)
}

// -------------------------------------------------------------------------
// MQTT broker
// -------------------------------------------------------------------------

/// MQTT 3.1.1 broker reached over TCP or TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttBroker;

fn build_transport(config: &MipsConfig) -> Result<Transport> {
    if !config.use_tls {
        return Ok(Transport::tcp());
    }
    let Some(ca) = &config.ca_pem else {
        return Ok(Transport::tls_with_default_config());
    };
    let client_auth = match (&config.client_cert_pem, &config.client_key_pem) {
        (Some(cert), Some(key)) => Some((cert.clone().into_bytes(), key.clone().into_bytes())),
        (None, None) => None,
        _ => {
            return Err(MiotError::InvalidParams(
                "client certificate and key must be given together".to_string(),
            ));
        }
    };
    Ok(Transport::tls(ca.clone().into_bytes(), client_auth, None))
}

impl Broker for MqttBroker {
    fn connect(&self, config: &MipsConfig) -> Result<(Box<dyn BrokerSession>, mpsc::UnboundedReceiver<BrokerEvent>)> {
        let client_id = if config.client_id.is_empty() {
            format!("miot.{:016x}", rand::rng().next_u64())
        } else {
            config.client_id.clone()
        };
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let Some(user) = &config.username {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }
        options.set_transport(build_transport(config)?);

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let host = config.host.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            if ack.code == ConnectReturnCode::Success {
                                let _ = tx.send(BrokerEvent::Connected);
                            } else {
                                let _ = tx.send(BrokerEvent::Disconnected(format!("refused: {:?}", ack.code)));
                                break;
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let _ = tx.send(BrokerEvent::Message {
                                topic: publish.topic,
                                payload: publish.payload.to_vec(),
                            });
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!("MQTT event loop for {} ended: {}", host, e);
                            let _ = tx.send(BrokerEvent::Disconnected(e.to_string()));
                            break;
                        }
                    },
                }
            }
        });

        Ok((Box::new(MqttSession { client, cancel }), rx))
    }
}

struct MqttSession {
    client: AsyncClient,
    cancel: CancellationToken,
}

fn client_err(e: rumqttc::ClientError) -> MiotError {
    MiotError::TransportUnreachable(e.to_string())
}

impl BrokerSession for MqttSession {
    fn subscribe(&self, topics: &[String]) -> Result<()> {
        let filters = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), QoS::ExactlyOnce));
        self.client.try_subscribe_many(filters).map_err(client_err)
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.try_unsubscribe(topic).map_err(client_err)
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::ExactlyOnce, false, payload)
            .map_err(client_err)
    }

    fn close(&self) {
        let _ = self.client.try_disconnect();
        self.cancel.cancel();
    }
}

// -------------------------------------------------------------------------
// In-process broker
// -------------------------------------------------------------------------

struct MemoryPeer {
    tx: mpsc::UnboundedSender<BrokerEvent>,
    filters: TopicMatcher<()>,
}

struct MemoryState {
    online: bool,
    next_id: u64,
    connect_attempts: u32,
    subscribe_log: Vec<String>,
    failing_subscribes: u32,
    peers: HashMap<u64, MemoryPeer>,
}

/// Broker that routes messages between sessions in the same process, with
/// MQTT wildcard semantics. Used by simulators and tests.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                online: true,
                next_id: 1,
                connect_attempts: 0,
                subscribe_log: Vec::new(),
                failing_subscribes: 0,
                peers: HashMap::new(),
            })),
        }
    }

    /// Taking the broker offline drops every session and refuses new ones.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        state.online = online;
        if !online {
            for (_, peer) in state.peers.drain() {
                let _ = peer.tx.send(BrokerEvent::Disconnected("broker offline".to_string()));
            }
        }
    }

    /// Reject the next `count` subscribe calls.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.state.lock().failing_subscribes = count;
    }

    /// Connect calls seen so far, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Every topic passed to an accepted subscribe call, in order.
    pub fn subscribe_log(&self) -> Vec<String> {
        self.state.lock().subscribe_log.clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Filters currently held by all sessions.
    pub fn subscriptions(&self) -> HashSet<String> {
        let state = self.state.lock();
        state
            .peers
            .values()
            .flat_map(|p| p.filters.iter_all().into_iter().map(|(topic, _)| topic))
            .collect()
    }

    /// Publish as an outside party.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) {
        let state = self.state.lock();
        for peer in state.peers.values() {
            if !peer.filters.matches(topic).is_empty() {
                let _ = peer.tx.send(BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

impl Broker for MemoryBroker {
    fn connect(&self, _config: &MipsConfig) -> Result<(Box<dyn BrokerSession>, mpsc::UnboundedReceiver<BrokerEvent>)> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if !state.online {
            return Err(MiotError::TransportUnreachable("broker offline".to_string()));
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(BrokerEvent::Connected);
        state.peers.insert(
            id,
            MemoryPeer {
                tx,
                filters: TopicMatcher::new(),
            },
        );
        Ok((
            Box::new(MemorySession {
                id,
                broker: self.clone(),
            }),
            rx,
        ))
    }
}

struct MemorySession {
    id: u64,
    broker: MemoryBroker,
}

impl BrokerSession for MemorySession {
    fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut state = self.broker.state.lock();
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(MiotError::SubscriptionFailed("rejected by broker".to_string()));
        }
        let peer = state
            .peers
            .get_mut(&self.id)
            .ok_or_else(|| MiotError::TransportUnreachable("session closed".to_string()))?;
        for topic in topics {
            peer.filters.insert(topic, ());
        }
        state.subscribe_log.extend(topics.iter().cloned());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        if let Some(peer) = self.broker.state.lock().peers.get_mut(&self.id) {
            peer.filters.remove(topic);
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.broker.state.lock().peers.contains_key(&self.id) {
            return Err(MiotError::TransportUnreachable("session closed".to_string()));
        }
        self.broker.publish(topic, payload);
        Ok(())
    }

    fn close(&self) {
        self.broker.state.lock().peers.remove(&self.id);
    }
}

// -------------------------------------------------------------------------
// Connection core
// -------------------------------------------------------------------------

enum Framing {
    /// Payloads are plain text
    Raw,
    /// Payloads are wrapped in an [`Envelope`]; replies come back on `reply_topic`
    Envelope { reply_topic: String },
}

struct CoreOptions {
    name: String,
    framing: Framing,
    /// Subscribed on every connect in addition to broadcast topics
    base_topics: Vec<String>,
    /// Device list change notices, handled outside the broadcast table
    dev_list_topic: Option<String>,
}

enum MipsCommand {
    SubBroadcast {
        pattern: String,
        sub_topic: String,
        handler: BroadcastHandler,
    },
    UnsubBroadcast {
        pattern: String,
    },
    Request {
        topic: String,
        payload: String,
        timeout: Duration,
        resp_tx: oneshot::Sender<String>,
    },
    SubState {
        key: String,
        handler: MipsStateHandler,
    },
    UnsubState {
        key: String,
    },
    OnDevListChanged {
        handler: DevListHandler,
    },
    UpdateCredentials {
        username: Option<String>,
        password: Option<String>,
    },
}

struct CoreShared {
    name: String,
    connected: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
    request_timeout: Duration,
}

impl Drop for CoreShared {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown();
        }
    }
}

#[derive(Clone)]
struct MipsCore {
    tx: mpsc::UnboundedSender<MipsCommand>,
    shared: Arc<CoreShared>,
}

impl MipsCore {
    fn start(config: MipsConfig, options: CoreOptions, broker: Arc<dyn Broker>, main: MainLoop) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = options.name.clone();
        let request_timeout = config.request_timeout();
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();

        let worker = Worker::spawn(&name, move |cancel| async move {
            MipsWorker::new(config, options, broker, main, flag)
                .run(rx, cancel)
                .await;
        })?;

        Ok(Self {
            tx,
            shared: Arc::new(CoreShared {
                name,
                connected,
                worker: Mutex::new(Some(worker)),
                request_timeout,
            }),
        })
    }

    fn send(&self, cmd: MipsCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| MiotError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn sub_broadcast(&self, pattern: String, sub_topic: String, handler: BroadcastHandler) -> Result<()> {
        self.send(MipsCommand::SubBroadcast {
            pattern,
            sub_topic,
            handler,
        })
    }

    fn unsub_broadcast(&self, pattern: String) -> Result<()> {
        self.send(MipsCommand::UnsubBroadcast { pattern })
    }

    fn sub_state(&self, key: &str, handler: MipsStateHandler) -> Result<()> {
        self.send(MipsCommand::SubState {
            key: key.to_string(),
            handler,
        })
    }

    fn unsub_state(&self, key: &str) -> Result<()> {
        self.send(MipsCommand::UnsubState { key: key.to_string() })
    }

    /// Publish an enveloped request and wait for the raw reply payload. A
    /// missing reply resolves to the timeout-shaped error object.
    async fn request(&self, topic: &str, payload: String, timeout: Option<Duration>) -> Result<String> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(MipsCommand::Request {
            topic: topic.to_string(),
            payload,
            timeout: timeout.unwrap_or(self.shared.request_timeout),
            resp_tx,
        })?;
        resp_rx.await.map_err(|_| MiotError::Closed)
    }

    async fn shutdown(&self) {
        let worker = self.shared.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.shutdown_async().await;
            self.shared.connected.store(false, Ordering::SeqCst);
            info!("{} stopped", self.shared.name);
        }
    }
}

struct Broadcast {
    sub_topic: String,
    handler: BroadcastHandler,
}

struct PendingReply {
    resp_tx: oneshot::Sender<String>,
    timer: Key,
}

enum MipsTimer {
    Reconnect,
    SubFlush,
    Request(u32),
}

struct MipsWorker {
    config: MipsConfig,
    options: CoreOptions,
    broker: Arc<dyn Broker>,
    main: MainLoop,
    connected_flag: Arc<AtomicBool>,
    session: Option<Box<dyn BrokerSession>>,
    events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
    connected: bool,
    failures: u32,
    broadcasts: TopicMatcher<Broadcast>,
    state_subs: HashMap<String, MipsStateHandler>,
    dev_list_handler: Option<DevListHandler>,
    pending: HashMap<u32, PendingReply>,
    mid: u32,
    sub_queue: VecDeque<(String, u32)>,
    sub_timer: Option<Key>,
    reconnect_timer: Option<Key>,
    timers: DelayQueue<MipsTimer>,
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<BrokerEvent>>) -> BrokerEvent {
    match events {
        Some(rx) => rx
            .recv()
            .await
            .unwrap_or_else(|| BrokerEvent::Disconnected("event stream closed".to_string())),
        None => std::future::pending().await,
    }
}

impl MipsWorker {
    fn new(
        config: MipsConfig,
        options: CoreOptions,
        broker: Arc<dyn Broker>,
        main: MainLoop,
        connected_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            options,
            broker,
            main,
            connected_flag,
            session: None,
            events: None,
            connected: false,
            failures: 0,
            broadcasts: TopicMatcher::new(),
            state_subs: HashMap::new(),
            dev_list_handler: None,
            pending: HashMap::new(),
            mid: rand::rng().next_u32(),
            sub_queue: VecDeque::new(),
            sub_timer: None,
            reconnect_timer: None,
            timers: DelayQueue::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MipsCommand>, cancel: CancellationToken) {
        self.connect();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                event = next_event(&mut self.events) => self.handle_event(event),
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    self.handle_timer(expired.into_inner());
                }
            }
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.connected_flag.store(false, Ordering::SeqCst);
        debug!("{} loop stopped, {} pending requests dropped", self.options.name, self.pending.len());
    }

    fn handle_command(&mut self, cmd: MipsCommand) {
        match cmd {
            MipsCommand::SubBroadcast {
                pattern,
                sub_topic,
                handler,
            } => {
                let fresh = !self.broadcasts.contains(&pattern);
                self.broadcasts.insert(
                    &pattern,
                    Broadcast {
                        sub_topic: sub_topic.clone(),
                        handler,
                    },
                );
                if fresh {
                    self.queue_sub(sub_topic);
                } else {
                    debug!("{} re-registered broadcast {}", self.options.name, pattern);
                }
            }
            MipsCommand::UnsubBroadcast { pattern } => {
                if let Some(Broadcast { sub_topic: topic, .. }) = self.broadcasts.remove(&pattern) {
                    self.sub_queue.retain(|(queued, _)| *queued != topic);
                    if self.connected
                        && let Some(session) = &self.session
                        && let Err(e) = session.unsubscribe(&topic)
                    {
                        warn!("{} unsubscribe {} failed: {}", self.options.name, topic, e);
                    }
                }
            }
            MipsCommand::Request {
                topic,
                payload,
                timeout,
                resp_tx,
            } => self.request(&topic, payload, timeout, resp_tx),
            MipsCommand::SubState { key, handler } => {
                self.state_subs.insert(key, handler);
            }
            MipsCommand::UnsubState { key } => {
                self.state_subs.remove(&key);
            }
            MipsCommand::OnDevListChanged { handler } => {
                self.dev_list_handler = Some(handler);
            }
            MipsCommand::UpdateCredentials { username, password } => {
                self.config.username = username;
                self.config.password = password;
                info!("{} credentials updated, reconnecting", self.options.name);
                self.drop_session("credentials changed");
                if let Some(key) = self.reconnect_timer.take() {
                    self.timers.try_remove(&key);
                }
                self.failures = 0;
                self.connect();
            }
        }
    }

    // ---------------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------------

    fn connect(&mut self) {
        self.reconnect_timer = None;
        debug!("{} connecting to {}:{}", self.options.name, self.config.host, self.config.port);
        match self.broker.connect(&self.config) {
            Ok((session, events)) => {
                self.session = Some(session);
                self.events = Some(events);
            }
            Err(e) => {
                warn!("{} connect failed: {}", self.options.name, e);
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = backoff(self.failures, self.config.reconnect_min(), self.config.reconnect_max());
        self.failures = self.failures.saturating_add(1);
        info!("{} reconnecting in {:?}", self.options.name, delay);
        if let Some(key) = self.reconnect_timer.take() {
            self.timers.try_remove(&key);
        }
        self.reconnect_timer = Some(self.timers.insert(MipsTimer::Reconnect, delay));
    }

    fn drop_session(&mut self, reason: &str) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.events = None;
        self.sub_queue.clear();
        if let Some(key) = self.sub_timer.take() {
            self.timers.try_remove(&key);
        }
        if self.connected {
            self.connected = false;
            self.connected_flag.store(false, Ordering::SeqCst);
            warn!("{} disconnected: {}", self.options.name, reason);
            self.broadcast_state(false);
        }
    }

    fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                info!("{} connected", self.options.name);
                self.connected = true;
                self.failures = 0;
                // the reply topic must be live before the link is reported up
                self.subscribe_base_topics();
                self.connected_flag.store(true, Ordering::SeqCst);

                let base = &self.options.base_topics;
                let mut topics: Vec<String> = Vec::new();
                for (_, bc) in self.broadcasts.iter_all() {
                    if !base.contains(&bc.sub_topic) && !topics.contains(&bc.sub_topic) {
                        topics.push(bc.sub_topic.clone());
                    }
                }
                for topic in topics {
                    self.queue_sub(topic);
                }
                self.broadcast_state(true);
            }
            BrokerEvent::Disconnected(reason) => {
                self.drop_session(&reason);
                self.schedule_reconnect();
            }
            BrokerEvent::Message { topic, payload } => self.dispatch(topic, payload),
        }
    }

    fn broadcast_state(&self, connected: bool) {
        for handler in self.state_subs.values() {
            let handler = handler.clone();
            self.main.call_soon(move || handler(connected));
        }
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    fn subscribe_base_topics(&mut self) {
        let topics = self.options.base_topics.clone();
        if topics.is_empty() {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        match session.subscribe(&topics) {
            Ok(()) => debug!("{} subscribed base topics {:?}", self.options.name, topics),
            Err(e) => {
                warn!("{} base subscribe failed, queued for retry: {}", self.options.name, e);
                for topic in topics {
                    self.queue_sub(topic);
                }
            }
        }
    }

    fn queue_sub(&mut self, topic: String) {
        if !self.connected {
            return;
        }
        self.sub_queue.push_back((topic, 0));
        if self.sub_timer.is_none() {
            self.sub_timer = Some(self.timers.insert(MipsTimer::SubFlush, SUB_FIRST_FLUSH));
        }
    }

    fn flush_subs(&mut self) {
        self.sub_timer = None;
        let Some(session) = &self.session else {
            self.sub_queue.clear();
            return;
        };
        let count = self.sub_queue.len().min(self.config.sub_batch.max(1));
        let batch: Vec<(String, u32)> = self.sub_queue.drain(..count).collect();
        let topics: Vec<String> = batch.iter().map(|(topic, _)| topic.clone()).collect();

        match session.subscribe(&topics) {
            Ok(()) => debug!("{} subscribed {} topics", self.options.name, topics.len()),
            Err(e) => {
                warn!("{} subscribe failed: {}", self.options.name, e);
                for (topic, retries) in batch {
                    if retries >= self.config.sub_max_retries {
                        error!("{} giving up subscribing {}", self.options.name, topic);
                    } else {
                        self.sub_queue.push_back((topic, retries + 1));
                    }
                }
            }
        }
        if !self.sub_queue.is_empty() {
            self.sub_timer = Some(self.timers.insert(MipsTimer::SubFlush, self.config.sub_interval()));
        }
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    fn next_mid(&mut self) -> u32 {
        let mid = self.mid;
        self.mid = ((self.mid as u64 + 1) % u32::MAX as u64) as u32;
        mid
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> bool {
        match (&self.session, self.connected) {
            (Some(session), true) => match session.publish(topic, payload) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{} publish to {} failed: {}", self.options.name, topic, e);
                    false
                }
            },
            _ => {
                debug!("{} not connected, dropping publish to {}", self.options.name, topic);
                false
            }
        }
    }

    fn request(&mut self, topic: &str, payload: String, timeout: Duration, resp_tx: oneshot::Sender<String>) {
        let reply_topic = match &self.options.framing {
            Framing::Envelope { reply_topic } => reply_topic.clone(),
            Framing::Raw => {
                let _ = resp_tx.send(r#"{"error":{"code":-10002,"message":"requests unsupported"}}"#.to_string());
                return;
            }
        };
        let mid = self.next_mid();
        let envelope = Envelope {
            mid,
            from: Some(MIPS_FROM_LOCAL.to_string()),
            ret_topic: Some(reply_topic),
            payload: Some(payload),
        };
        match envelope.pack() {
            Ok(data) => {
                let sent = self.publish(topic, data);
                debug!("{} request {} on {}, sent: {}", self.options.name, mid, topic, sent);
            }
            Err(e) => error!("{} failed to pack request {}: {}", self.options.name, mid, e),
        }
        // unsent requests still resolve through the timeout
        let timer = self.timers.insert(MipsTimer::Request(mid), timeout);
        self.pending.insert(mid, PendingReply { resp_tx, timer });
    }

    fn dispatch(&mut self, topic: String, payload: Vec<u8>) {
        let body = match &self.options.framing {
            Framing::Raw => String::from_utf8_lossy(&payload).into_owned(),
            Framing::Envelope { reply_topic } => {
                let envelope = match Envelope::unpack(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("{} dropping message on {}: {}", self.options.name, topic, e);
                        return;
                    }
                };
                if topic == *reply_topic {
                    match self.pending.remove(&envelope.mid) {
                        Some(reply) => {
                            self.timers.try_remove(&reply.timer);
                            let _ = reply.resp_tx.send(envelope.payload.unwrap_or_else(|| "{}".to_string()));
                        }
                        None => debug!("{} reply for unknown request {}", self.options.name, envelope.mid),
                    }
                    return;
                }
                envelope.payload.unwrap_or_else(|| "{}".to_string())
            }
        };
        if self.options.dev_list_topic.as_deref() == Some(topic.as_str()) {
            self.dev_list_changed(&body);
            return;
        }

        let handlers: Vec<BroadcastHandler> = self
            .broadcasts
            .matches(&topic)
            .into_iter()
            .map(|bc| bc.handler.clone())
            .collect();
        if handlers.is_empty() {
            debug!("{} unhandled message on {}", self.options.name, topic);
            return;
        }
        let handler_topic = match self.options.framing {
            Framing::Raw => topic,
            Framing::Envelope { .. } => topic
                .split_once('/')
                .map(|(_, rest)| rest.to_string())
                .unwrap_or(topic),
        };
        for handler in handlers {
            let topic = handler_topic.clone();
            let body = body.clone();
            self.main.call_soon(move || handler(&topic, &body));
        }
    }

    fn dev_list_changed(&self, body: &str) {
        let dids: Vec<String> = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|msg| {
                msg.get("devList")
                    .and_then(Value::as_array)
                    .map(|list| list.iter().filter_map(|d| d.as_str().map(str::to_string)).collect())
            })
            .unwrap_or_default();
        if dids.is_empty() {
            error!("{} unknown devListChange message, {}", self.options.name, body);
            return;
        }
        match &self.dev_list_handler {
            Some(handler) => {
                let handler = handler.clone();
                self.main.call_soon(move || handler(dids));
            }
            None => debug!("{} device list changed, nobody listening", self.options.name),
        }
    }

    fn handle_timer(&mut self, timer: MipsTimer) {
        match timer {
            MipsTimer::Reconnect => self.connect(),
            MipsTimer::SubFlush => self.flush_subs(),
            MipsTimer::Request(mid) => {
                if let Some(reply) = self.pending.remove(&mid) {
                    warn!("{} request {} timed out", self.options.name, mid);
                    let _ = reply.resp_tx.send(TIMEOUT_REPLY.to_string());
                }
            }
        }
    }
}

// -------------------------------------------------------------------------
// Cloud client
// -------------------------------------------------------------------------

/// Client of the cloud broker: device pushes and device online state.
pub struct MipsCloudClient {
    core: MipsCore,
}

impl MipsCloudClient {
    pub fn start(config: MipsConfig, broker: Arc<dyn Broker>, main: MainLoop) -> Result<Self> {
        if config.kind != BrokerKind::Cloud {
            return Err(MiotError::InvalidParams("cloud client needs a cloud broker config".to_string()));
        }
        let options = CoreOptions {
            name: "mips-cloud".to_string(),
            framing: Framing::Raw,
            base_topics: Vec::new(),
            dev_list_topic: None,
        };
        Ok(Self {
            core: MipsCore::start(config, options, broker, main)?,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn sub_state(&self, key: &str, handler: MipsStateHandler) -> Result<()> {
        self.core.sub_state(key, handler)
    }

    pub fn unsub_state(&self, key: &str) -> Result<()> {
        self.core.unsub_state(key)
    }

    /// Swap the access token and reconnect with it.
    pub fn update_access_token(&self, app_id: &str, token: &str) -> Result<()> {
        self.core.send(MipsCommand::UpdateCredentials {
            username: Some(app_id.to_string()),
            password: Some(token.to_string()),
        })
    }

    fn prop_topic(did: &str, siid: Option<u32>, piid: Option<u32>) -> String {
        match (siid, piid) {
            (Some(s), Some(p)) => format!("device/{}/up/properties_changed/{}/{}", did, s, p),
            _ => format!("device/{}/up/properties_changed/#", did),
        }
    }

    fn event_topic(did: &str, siid: Option<u32>, eiid: Option<u32>) -> String {
        match (siid, eiid) {
            (Some(s), Some(e)) => format!("device/{}/up/event_occured/{}/{}", did, s, e),
            _ => format!("device/{}/up/event_occured/#", did),
        }
    }

    pub fn sub_prop(&self, did: &str, siid: Option<u32>, piid: Option<u32>, handler: PropertyHandler) -> Result<()> {
        let topic = Self::prop_topic(did, siid, piid);
        let did = did.to_string();
        let on_msg: BroadcastHandler = Arc::new(move |topic, payload| {
            let params = serde_json::from_str::<Value>(payload)
                .ok()
                .and_then(|msg| msg.get("params").cloned());
            match params.map(serde_json::from_value::<PropertyMessage>) {
                Some(Ok(mut prop)) => {
                    if prop.did.is_empty() {
                        prop.did = did.clone();
                    }
                    handler(prop);
                }
                _ => error!("Invalid cloud property message, {}, {}", topic, payload),
            }
        });
        self.core.sub_broadcast(topic.clone(), topic, on_msg)
    }

    pub fn unsub_prop(&self, did: &str, siid: Option<u32>, piid: Option<u32>) -> Result<()> {
        self.core.unsub_broadcast(Self::prop_topic(did, siid, piid))
    }

    pub fn sub_event(&self, did: &str, siid: Option<u32>, eiid: Option<u32>, handler: EventHandler) -> Result<()> {
        let topic = Self::event_topic(did, siid, eiid);
        let did = did.to_string();
        let on_msg: BroadcastHandler = Arc::new(move |topic, payload| {
            let params = serde_json::from_str::<Value>(payload)
                .ok()
                .and_then(|msg| msg.get("params").cloned());
            match params.map(serde_json::from_value::<EventMessage>) {
                Some(Ok(mut event)) => {
                    if event.did.is_empty() {
                        event.did = did.clone();
                    }
                    handler(event);
                }
                _ => error!("Invalid cloud event message, {}, {}", topic, payload),
            }
        });
        self.core.sub_broadcast(topic.clone(), topic, on_msg)
    }

    pub fn unsub_event(&self, did: &str, siid: Option<u32>, eiid: Option<u32>) -> Result<()> {
        self.core.unsub_broadcast(Self::event_topic(did, siid, eiid))
    }

    /// Online/offline notifications for one device.
    pub fn sub_device_state(&self, did: &str, handler: StateHandler) -> Result<()> {
        let topic = format!("device/{}/state/#", did);
        let did = did.to_string();
        let on_msg: BroadcastHandler = Arc::new(move |topic, payload| {
            let msg = serde_json::from_str::<Value>(payload).unwrap_or(Value::Null);
            match (
                msg.get("device_id").and_then(Value::as_str),
                msg.get("event").and_then(Value::as_str),
            ) {
                (Some(device_id), Some(event)) if device_id == did => handler(&did, event == "online"),
                _ => error!("Invalid cloud state message, {}, {}", topic, payload),
            }
        });
        self.core.sub_broadcast(topic.clone(), topic, on_msg)
    }

    pub fn unsub_device_state(&self, did: &str) -> Result<()> {
        self.core.unsub_broadcast(format!("device/{}/state/#", did))
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

// -------------------------------------------------------------------------
// Hub gateway client
// -------------------------------------------------------------------------

/// A device as listed by a hub gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubDevice {
    pub did: String,
    pub name: String,
    pub urn: String,
    pub model: String,
    pub online: bool,
    pub specv2_access: bool,
    pub push_available: bool,
}

struct QueuedGet {
    siid: u32,
    piid: u32,
    timeout: Option<Duration>,
    resp_tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct PropQueue {
    items: HashMap<String, VecDeque<QueuedGet>>,
    draining: bool,
}

/// Client of a hub gateway's local broker.
pub struct MipsLocalClient {
    core: MipsCore,
    hub_did: String,
    main: MainLoop,
    prop_queue: Arc<Mutex<PropQueue>>,
}

impl MipsLocalClient {
    pub fn start(config: MipsConfig, hub_did: &str, broker: Arc<dyn Broker>, main: MainLoop) -> Result<Self> {
        if config.kind != BrokerKind::Local {
            return Err(MiotError::InvalidParams("local client needs a local broker config".to_string()));
        }
        let options = CoreOptions {
            name: format!("mips-local-{}", hub_did),
            framing: Framing::Envelope {
                reply_topic: format!("{}/reply", hub_did),
            },
            base_topics: vec![format!("{}/#", hub_did), "master/appMsg/devListChange".to_string()],
            dev_list_topic: Some(format!("{}/appMsg/devListChange", hub_did)),
        };
        Ok(Self {
            core: MipsCore::start(config, options, broker, main.clone())?,
            hub_did: hub_did.to_string(),
            main,
            prop_queue: Arc::new(Mutex::new(PropQueue::default())),
        })
    }

    pub fn hub_did(&self) -> &str {
        &self.hub_did
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn sub_state(&self, key: &str, handler: MipsStateHandler) -> Result<()> {
        self.core.sub_state(key, handler)
    }

    pub fn unsub_state(&self, key: &str) -> Result<()> {
        self.core.unsub_state(key)
    }

    fn reg_broadcast(&self, topic: &str, handler: BroadcastHandler) -> Result<()> {
        self.core.sub_broadcast(
            format!("{}/{}", self.hub_did, topic),
            format!("master/{}", topic),
            handler,
        )
    }

    fn unreg_broadcast(&self, topic: &str) -> Result<()> {
        self.core.unsub_broadcast(format!("{}/{}", self.hub_did, topic))
    }

    fn prop_topic(did: &str, siid: Option<u32>, piid: Option<u32>) -> String {
        match (siid, piid) {
            (Some(s), Some(p)) => format!("appMsg/notify/iot/{}/property/{}.{}", did, s, p),
            _ => format!("appMsg/notify/iot/{}/property/#", did),
        }
    }

    fn event_topic(did: &str, siid: Option<u32>, eiid: Option<u32>) -> String {
        match (siid, eiid) {
            (Some(s), Some(e)) => format!("appMsg/notify/iot/{}/event/{}.{}", did, s, e),
            _ => format!("appMsg/notify/iot/{}/event/#", did),
        }
    }

    pub fn sub_prop(&self, did: &str, siid: Option<u32>, piid: Option<u32>, handler: PropertyHandler) -> Result<()> {
        let on_msg: BroadcastHandler = Arc::new(move |topic, payload| {
            match serde_json::from_str::<PropertyMessage>(payload) {
                Ok(prop) if !prop.did.is_empty() => handler(prop),
                _ => error!("Invalid hub property message, {}, {}", topic, payload),
            }
        });
        self.reg_broadcast(&Self::prop_topic(did, siid, piid), on_msg)
    }

    pub fn unsub_prop(&self, did: &str, siid: Option<u32>, piid: Option<u32>) -> Result<()> {
        self.unreg_broadcast(&Self::prop_topic(did, siid, piid))
    }

    pub fn sub_event(&self, did: &str, siid: Option<u32>, eiid: Option<u32>, handler: EventHandler) -> Result<()> {
        let on_msg: BroadcastHandler = Arc::new(move |topic, payload| {
            match serde_json::from_str::<EventMessage>(payload) {
                Ok(event) if !event.did.is_empty() => handler(event),
                _ => error!("Invalid hub event message, {}, {}", topic, payload),
            }
        });
        self.reg_broadcast(&Self::event_topic(did, siid, eiid), on_msg)
    }

    pub fn unsub_event(&self, did: &str, siid: Option<u32>, eiid: Option<u32>) -> Result<()> {
        self.unreg_broadcast(&Self::event_topic(did, siid, eiid))
    }

    /// Called with the changed dids whenever the hub's device list changes.
    pub fn on_dev_list_changed(&self, handler: DevListHandler) -> Result<()> {
        self.core.send(MipsCommand::OnDevListChanged { handler })
    }

    async fn call(&self, topic: &str, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        call(&self.core, topic, payload, timeout).await
    }

    pub async fn get_prop(&self, did: &str, siid: u32, piid: u32, timeout: Option<Duration>) -> Result<Value> {
        proxy_get(&self.core, did, siid, piid, timeout).await
    }

    /// Like [`get_prop`](Self::get_prop) but serialised per device: at most one
    /// outstanding read per device every tick.
    pub async fn get_prop_safe(&self, did: &str, siid: u32, piid: u32, timeout: Option<Duration>) -> Result<Value> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let start = {
            let mut queue = self.prop_queue.lock();
            queue.items.entry(did.to_string()).or_default().push_back(QueuedGet {
                siid,
                piid,
                timeout,
                resp_tx,
            });
            !std::mem::replace(&mut queue.draining, true)
        };
        if start {
            self.main
                .spawn(drain_prop_queue(self.core.clone(), self.prop_queue.clone()));
        }
        resp_rx.await.map_err(|_| MiotError::Closed)?
    }

    pub async fn set_prop(&self, did: &str, siid: u32, piid: u32, value: Value, timeout: Option<Duration>) -> Result<i64> {
        let payload = json!({
            "did": did,
            "rpc": {
                "id": 0,
                "method": "set_properties",
                "params": [{"did": did, "siid": siid, "piid": piid, "value": value}],
            }
        });
        let reply = self.call("proxy/rpcReq", payload, timeout).await?;
        if let Some(first) = reply
            .get("result")
            .and_then(Value::as_array)
            .filter(|list| list.len() == 1)
            .and_then(|list| list.first())
            && first.get("did").and_then(Value::as_str) == Some(did)
            && first.get("code").is_some()
        {
            return check_code(first);
        }
        if let Some(err) = reply.get("error") {
            return Err(MiotError::from_reply(err));
        }
        Err(MiotError::InvalidResult(format!("unexpected reply {}", reply)))
    }

    pub async fn action(&self, did: &str, siid: u32, aiid: u32, in_list: Vec<Value>, timeout: Option<Duration>) -> Result<Vec<Value>> {
        let payload = json!({
            "did": did,
            "rpc": {
                "id": 0,
                "method": "action",
                "params": {"did": did, "siid": siid, "aiid": aiid, "in": in_list},
            }
        });
        let reply = self.call("proxy/rpcReq", payload, timeout).await?;
        if let Some(result) = reply.get("result")
            && result.get("code").is_some()
        {
            check_code(result)?;
            return Ok(result
                .get("out")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default());
        }
        if let Some(err) = reply.get("error") {
            return Err(MiotError::from_reply(err));
        }
        Err(MiotError::InvalidResult(format!("unexpected reply {}", reply)))
    }

    /// Devices the hub knows about, keyed by did.
    pub async fn get_dev_list(&self) -> Result<HashMap<String, HubDevice>> {
        let reply = self.call("proxy/getDevList", json!({}), None).await?;
        if let Some(err) = reply.get("error") {
            return Err(MiotError::from_reply(err));
        }
        let list = reply
            .get("devList")
            .and_then(Value::as_object)
            .ok_or_else(|| MiotError::InvalidResult(format!("no devList in {}", reply)))?;

        let mut devices = HashMap::new();
        for (did, info) in list {
            let field = |name: &str| info.get(name).and_then(Value::as_str).map(str::to_string);
            let (Some(name), Some(urn), Some(model)) = (field("name"), field("urn"), field("model")) else {
                info!("Invalid hub device info, {}, {}", did, info);
                continue;
            };
            let flag = |name: &str| info.get(name).and_then(Value::as_bool).unwrap_or(false);
            devices.insert(
                did.clone(),
                HubDevice {
                    did: did.clone(),
                    name,
                    urn,
                    model,
                    online: flag("online"),
                    specv2_access: flag("specV2Access"),
                    push_available: flag("pushAvailable"),
                },
            );
        }
        Ok(devices)
    }

    pub async fn get_action_group_list(&self) -> Result<Value> {
        let reply = self.call("proxy/getMijiaActionGroupList", json!({}), None).await?;
        if let Some(err) = reply.get("error") {
            return Err(MiotError::from_reply(err));
        }
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| MiotError::InvalidResult(format!("no result in {}", reply)))
    }

    pub async fn exec_action_group(&self, id: &str) -> Result<Value> {
        let reply = self
            .call("proxy/execMijiaActionGroup", json!({"id": id}), None)
            .await?;
        if let Some(result) = reply.get("result") {
            return Ok(result.clone());
        }
        if let Some(err) = reply.get("error") {
            return Err(MiotError::from_reply(err));
        }
        Err(MiotError::InvalidResult(format!("unexpected reply {}", reply)))
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

async fn call(core: &MipsCore, topic: &str, payload: Value, timeout: Option<Duration>) -> Result<Value> {
    let text = core
        .request(&format!("master/{}", topic), payload.to_string(), timeout)
        .await?;
    serde_json::from_str(&text).map_err(|_| MiotError::InvalidResult(format!("Error: {}", text)))
}

async fn proxy_get(core: &MipsCore, did: &str, siid: u32, piid: u32, timeout: Option<Duration>) -> Result<Value> {
    let reply = call(core, "proxy/get", json!({"did": did, "siid": siid, "piid": piid}), timeout).await?;
    if let Some(value) = reply.get("value") {
        return Ok(value.clone());
    }
    if let Some(err) = reply.get("error") {
        return Err(MiotError::from_reply(err));
    }
    Err(MiotError::InvalidResult(format!("no value in {}", reply)))
}

async fn drain_prop_queue(core: MipsCore, queue: Arc<Mutex<PropQueue>>) {
    loop {
        tokio::time::sleep(PROP_QUEUE_TICK).await;
        let batch: Vec<(String, QueuedGet)> = {
            let mut queue = queue.lock();
            let mut batch = Vec::new();
            let mut emptied = Vec::new();
            for (did, list) in queue.items.iter_mut() {
                if let Some(item) = list.pop_front() {
                    batch.push((did.clone(), item));
                }
                if list.is_empty() {
                    emptied.push(did.clone());
                }
            }
            for did in emptied {
                queue.items.remove(&did);
            }
            batch
        };

        // reads run detached so a silent device never stalls the tick
        for (did, item) in batch {
            let core = core.clone();
            tokio::spawn(async move {
                debug!("Queued get prop, {}, {}.{}", did, item.siid, item.piid);
                let result = proxy_get(&core, &did, item.siid, item.piid, item.timeout).await;
                let _ = item.resp_tx.send(result);
            });
        }

        let mut queue = queue.lock();
        if queue.items.is_empty() {
            queue.draining = false;
            break;
        }
    }
}
