//! LAN transport: UDP discovery, keep-alive tracking and encrypted control of
//! devices on the local segment, without any broker.
//!
//! All sockets and device records are owned by one worker thread. The public
//! [`MiotLan`] handle talks to it through a command channel; callbacks are
//! handed back to the host loop through [`MainLoop`].

use crate::config::{LanConfig, REQUEST_FROM};
use crate::crypto::LanCipher;
use crate::error::{MiotError, Result};
use crate::liveness::{
    Damping, Effect, FlapDamper, Liveness, LivenessEvent, LivenessState, LivenessTiming, randomize,
};
use crate::matcher::TopicMatcher;
use crate::protocol::{MAX_FRAME_LEN, PROBE_LEN, build_probe, pack_frame, parse_beacon, parse_header, unpack_frame};
use crate::runtime::{MainLoop, Worker};
use crate::types::{
    EventHandler, EventMessage, PropertyHandler, PropertyMessage, event_key, prop_key,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue::Key};

const SCAN_JITTER: f64 = 0.1;
const MSG_ID_MAX: u32 = 0x8000_0000;

/// Catalog entry handed to the LAN transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanDeviceInfo {
    pub did: String,
    /// 32 hex characters
    pub token: String,
}

impl LanDeviceInfo {
    pub fn new<D: Into<String>, T: Into<String>>(did: D, token: T) -> Self {
        Self {
            did: did.into(),
            token: token.into(),
        }
    }
}

/// Reachability of one device as seen by the LAN transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanDeviceState {
    pub online: bool,
    /// The device pushes property/event changes to us
    pub push_available: bool,
}

pub type LanDeviceStateHandler = Arc<dyn Fn(&str, LanDeviceState) + Send + Sync>;
pub type LanStateHandler = Arc<dyn Fn(bool) + Send + Sync>;

enum Subscriber {
    Prop(PropertyHandler),
    Event(EventHandler),
}

/// Internal commands for the LAN worker.
enum LanCommand {
    UpdateDevices(Vec<LanDeviceInfo>),
    DeleteDevices(Vec<String>),
    UpdateNetIfs(Vec<String>),
    UpdateSubscribeOption(bool),
    Ping {
        if_name: Option<String>,
        target: Option<Ipv4Addr>,
    },
    Request {
        did: String,
        msg: Map<String, Value>,
        timeout: Duration,
        resp_tx: oneshot::Sender<Result<Value>>,
    },
    Subscribe {
        key: String,
        sub: Subscriber,
    },
    Unsubscribe {
        key: String,
    },
    SubDeviceState {
        key: String,
        handler: LanDeviceStateHandler,
    },
    UnsubDeviceState {
        key: String,
    },
    SubLanState {
        key: String,
        handler: LanStateHandler,
    },
    UnsubLanState {
        key: String,
    },
    GetDevList {
        resp_tx: oneshot::Sender<HashMap<String, LanDeviceState>>,
    },
}

// -------------------------------------------------------------------------
// Public handle
// -------------------------------------------------------------------------

/// Handle to a running LAN transport.
pub struct MiotLan {
    tx: mpsc::UnboundedSender<LanCommand>,
    worker: Mutex<Option<Worker>>,
    virtual_did: u64,
    request_timeout: Duration,
}

impl MiotLan {
    /// Spawn the LAN worker thread and open a socket per configured interface.
    pub fn start(config: LanConfig, main: MainLoop) -> Result<Self> {
        let virtual_did = if config.virtual_did == 0 {
            rand::rng().next_u64()
        } else {
            config.virtual_did
        };
        let request_timeout = config.request_timeout();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::spawn("miot-lan", move |cancel| async move {
            LanWorker::new(config, virtual_did, main).run(rx, cancel).await;
        })?;
        info!("LAN transport started, virtual did {}", virtual_did);

        Ok(Self {
            tx,
            worker: Mutex::new(Some(worker)),
            virtual_did,
            request_timeout,
        })
    }

    pub fn virtual_did(&self) -> u64 {
        self.virtual_did
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(Worker::is_running)
    }

    /// Stop the worker and join its thread. Pending requests fail with
    /// [`MiotError::Closed`].
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.shutdown_async().await;
            info!("LAN transport stopped");
        }
    }

    fn send(&self, cmd: LanCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| MiotError::Closed)
    }

    pub fn update_devices(&self, devices: Vec<LanDeviceInfo>) -> Result<()> {
        self.send(LanCommand::UpdateDevices(devices))
    }

    pub fn delete_devices(&self, dids: Vec<String>) -> Result<()> {
        self.send(LanCommand::DeleteDevices(dids))
    }

    pub fn update_net_ifs(&self, if_names: Vec<String>) -> Result<()> {
        self.send(LanCommand::UpdateNetIfs(if_names))
    }

    pub fn update_subscribe_option(&self, enable: bool) -> Result<()> {
        self.send(LanCommand::UpdateSubscribeOption(enable))
    }

    /// Send a probe. Without a target the probe is broadcast, without an
    /// interface it goes out on every socket.
    pub fn ping(&self, if_name: Option<String>, target: Option<Ipv4Addr>) -> Result<()> {
        self.send(LanCommand::Ping { if_name, target })
    }

    pub fn sub_prop(&self, did: &str, siid: Option<u32>, piid: Option<u32>, handler: PropertyHandler) -> Result<()> {
        self.send(LanCommand::Subscribe {
            key: prop_key(did, siid, piid),
            sub: Subscriber::Prop(handler),
        })
    }

    pub fn unsub_prop(&self, did: &str, siid: Option<u32>, piid: Option<u32>) -> Result<()> {
        self.send(LanCommand::Unsubscribe {
            key: prop_key(did, siid, piid),
        })
    }

    pub fn sub_event(&self, did: &str, siid: Option<u32>, eiid: Option<u32>, handler: EventHandler) -> Result<()> {
        self.send(LanCommand::Subscribe {
            key: event_key(did, siid, eiid),
            sub: Subscriber::Event(handler),
        })
    }

    pub fn unsub_event(&self, did: &str, siid: Option<u32>, eiid: Option<u32>) -> Result<()> {
        self.send(LanCommand::Unsubscribe {
            key: event_key(did, siid, eiid),
        })
    }

    pub fn sub_device_state(&self, key: &str, handler: LanDeviceStateHandler) -> Result<()> {
        self.send(LanCommand::SubDeviceState {
            key: key.to_string(),
            handler,
        })
    }

    pub fn unsub_device_state(&self, key: &str) -> Result<()> {
        self.send(LanCommand::UnsubDeviceState { key: key.to_string() })
    }

    pub fn sub_lan_state(&self, key: &str, handler: LanStateHandler) -> Result<()> {
        self.send(LanCommand::SubLanState {
            key: key.to_string(),
            handler,
        })
    }

    pub fn unsub_lan_state(&self, key: &str) -> Result<()> {
        self.send(LanCommand::UnsubLanState { key: key.to_string() })
    }

    /// Online devices and whether they push changes.
    pub async fn get_dev_list(&self) -> Result<HashMap<String, LanDeviceState>> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(LanCommand::GetDevList { resp_tx })?;
        resp_rx.await.map_err(|_| MiotError::Closed)
    }

    /// Issue a raw request and return the device's full reply object.
    pub async fn request(&self, did: &str, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let mut msg = Map::new();
        msg.insert("from".into(), json!(REQUEST_FROM));
        msg.insert("method".into(), json!(method));
        msg.insert("params".into(), params);

        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(LanCommand::Request {
            did: did.to_string(),
            msg,
            timeout: timeout.unwrap_or(self.request_timeout),
            resp_tx,
        })?;
        resp_rx.await.map_err(|_| MiotError::Closed)?
    }

    pub async fn get_prop(&self, did: &str, siid: u32, piid: u32, timeout: Option<Duration>) -> Result<Value> {
        let reply = self
            .request(did, "get_properties", json!([{"did": did, "siid": siid, "piid": piid}]), timeout)
            .await?;
        let first = first_result(&reply, did)?;
        check_code(first)?;
        first
            .get("value")
            .cloned()
            .ok_or_else(|| MiotError::InvalidResult(format!("no value in {}", reply)))
    }

    pub async fn set_prop(&self, did: &str, siid: u32, piid: u32, value: Value, timeout: Option<Duration>) -> Result<i64> {
        let reply = self
            .request(
                did,
                "set_properties",
                json!([{"did": did, "siid": siid, "piid": piid, "value": value}]),
                timeout,
            )
            .await?;
        let first = first_result(&reply, did)?;
        check_code(first)
    }

    /// Set several properties in one frame; returns one code per property.
    pub async fn set_props(&self, did: &str, props: Vec<(u32, u32, Value)>, timeout: Option<Duration>) -> Result<Vec<Result<i64>>> {
        let params: Vec<Value> = props
            .into_iter()
            .map(|(siid, piid, value)| json!({"did": did, "siid": siid, "piid": piid, "value": value}))
            .collect();
        let reply = self.request(did, "set_properties", Value::Array(params), timeout).await?;
        if let Some(err) = reply.get("error") {
            return Err(MiotError::from_reply(err));
        }
        let list = reply
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| MiotError::InvalidResult(format!("no result list in {}", reply)))?;
        Ok(list.iter().map(check_code).collect())
    }

    /// Invoke an action and return its output values.
    pub async fn action(&self, did: &str, siid: u32, aiid: u32, in_list: Vec<Value>, timeout: Option<Duration>) -> Result<Vec<Value>> {
        let reply = self
            .request(
                did,
                "action",
                json!({"did": did, "siid": siid, "aiid": aiid, "in": in_list}),
                timeout,
            )
            .await?;
        if let Some(err) = reply.get("error") {
            return Err(MiotError::from_reply(err));
        }
        let result = reply
            .get("result")
            .ok_or_else(|| MiotError::InvalidResult(format!("no result in {}", reply)))?;
        check_code(result)?;
        Ok(result
            .get("out")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

impl Drop for MiotLan {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown();
        }
    }
}

/// First element of the `result` list, or the device error.
fn first_result<'a>(reply: &'a Value, did: &str) -> Result<&'a Value> {
    if let Some(err) = reply.get("error") {
        return Err(MiotError::from_reply(err));
    }
    let first = reply
        .get("result")
        .and_then(Value::as_array)
        .filter(|list| list.len() == 1)
        .and_then(|list| list.first())
        .ok_or_else(|| MiotError::InvalidResult(format!("unexpected reply {}", reply)))?;
    match first.get("did").and_then(Value::as_str) {
        Some(reply_did) if reply_did != did => Err(MiotError::InvalidResult(format!(
            "reply for {} while asking {}",
            reply_did, did
        ))),
        _ => Ok(first),
    }
}

/// Codes 0 and 1 are success; anything else is an application error.
pub(crate) fn check_code(value: &Value) -> Result<i64> {
    match value.get("code").and_then(Value::as_i64) {
        None => Ok(0),
        Some(code @ (0 | 1)) => Ok(code),
        Some(_) => Err(MiotError::from_reply(value)),
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

// -------------------------------------------------------------------------
// Worker
// -------------------------------------------------------------------------

struct LanDevice {
    did_num: u64,
    cipher: LanCipher,
    ip: Option<Ipv4Addr>,
    if_name: Option<String>,
    /// Local clock minus device clock, seconds
    offset: i64,
    liveness: Liveness,
    damper: FlapDamper,
    online: bool,
    subscribed: bool,
    sub_epoch: u32,
    sub_pending: bool,
    supports_wildcard: bool,
    ka_timer: Option<Key>,
    resume_timer: Option<Key>,
}

impl LanDevice {
    fn new(did_num: u64, cipher: LanCipher, timing: LivenessTiming) -> Self {
        Self {
            did_num,
            cipher,
            ip: None,
            if_name: None,
            offset: 0,
            liveness: Liveness::with_timing(timing),
            damper: FlapDamper::with_timing(timing),
            online: false,
            subscribed: false,
            sub_epoch: 0,
            sub_pending: false,
            supports_wildcard: false,
            ka_timer: None,
            resume_timer: None,
        }
    }

    fn state(&self) -> LanDeviceState {
        LanDeviceState {
            online: self.online,
            push_available: self.subscribed,
        }
    }
}

enum LanTimer {
    KeepAlive(String),
    Resume(String),
    Scan,
    Request(u32),
    Dedup(String),
}

enum Pending {
    Caller(oneshot::Sender<Result<Value>>),
    Subscribe { epoch: u32 },
    Unsubscribe,
}

struct PendingRequest {
    did: String,
    kind: Pending,
    timer: Key,
}

struct BoundSocket {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
}

struct Inbound {
    data: Vec<u8>,
    from: SocketAddr,
    if_name: String,
}

struct LanWorker {
    config: LanConfig,
    virtual_did: u64,
    main: MainLoop,
    devices: HashMap<String, LanDevice>,
    sockets: HashMap<String, BoundSocket>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Option<mpsc::Receiver<Inbound>>,
    pending: HashMap<u32, PendingRequest>,
    dedup: HashSet<String>,
    timers: DelayQueue<LanTimer>,
    scan_timer: Option<Key>,
    scan_interval: Duration,
    msg_id: u32,
    subscribers: TopicMatcher<Subscriber>,
    device_state_subs: HashMap<String, LanDeviceStateHandler>,
    lan_state_subs: HashMap<String, LanStateHandler>,
    enable_subscribe: bool,
}

impl LanWorker {
    fn new(config: LanConfig, virtual_did: u64, main: MainLoop) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let enable_subscribe = config.enable_subscribe;
        Self {
            virtual_did,
            main,
            devices: HashMap::new(),
            sockets: HashMap::new(),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            pending: HashMap::new(),
            dedup: HashSet::new(),
            timers: DelayQueue::new(),
            scan_timer: None,
            scan_interval: Duration::ZERO,
            msg_id: rand::rng().random_range(0..MSG_ID_MAX - 1),
            subscribers: TopicMatcher::new(),
            device_state_subs: HashMap::new(),
            lan_state_subs: HashMap::new(),
            enable_subscribe,
            config,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LanCommand>, cancel: CancellationToken) {
        let Some(mut inbound_rx) = self.inbound_rx.take() else {
            return;
        };
        let interfaces = self.config.interfaces.clone();
        self.update_net_ifs(interfaces);

        debug!("LAN worker loop running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(inbound) = inbound_rx.recv() => self.handle_datagram(inbound),
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    self.handle_timer(expired.into_inner());
                }
            }
        }

        for (_, bound) in self.sockets.drain() {
            bound.cancel.cancel();
        }
        self.timers.clear();
        debug!("LAN worker loop stopped, {} pending requests dropped", self.pending.len());
    }

    fn handle_command(&mut self, cmd: LanCommand) {
        match cmd {
            LanCommand::UpdateDevices(devices) => self.update_devices(devices),
            LanCommand::DeleteDevices(dids) => self.delete_devices(dids),
            LanCommand::UpdateNetIfs(if_names) => self.update_net_ifs(if_names),
            LanCommand::UpdateSubscribeOption(enable) => self.update_subscribe_option(enable),
            LanCommand::Ping { if_name, target } => {
                self.ping(if_name.as_deref(), target.unwrap_or(self.config.broadcast_addr));
            }
            LanCommand::Request {
                did,
                msg,
                timeout,
                resp_tx,
            } => self.send_request(&did, msg, timeout, Pending::Caller(resp_tx)),
            LanCommand::Subscribe { key, sub } => {
                self.subscribers.insert(&key, sub);
            }
            LanCommand::Unsubscribe { key } => {
                self.subscribers.remove(&key);
            }
            LanCommand::SubDeviceState { key, handler } => {
                self.device_state_subs.insert(key, handler);
            }
            LanCommand::UnsubDeviceState { key } => {
                self.device_state_subs.remove(&key);
            }
            LanCommand::SubLanState { key, handler } => {
                self.lan_state_subs.insert(key, handler);
            }
            LanCommand::UnsubLanState { key } => {
                self.lan_state_subs.remove(&key);
            }
            LanCommand::GetDevList { resp_tx } => {
                let list = self
                    .devices
                    .iter()
                    .filter(|(_, dev)| dev.online)
                    .map(|(did, dev)| (did.clone(), dev.state()))
                    .collect();
                let _ = resp_tx.send(list);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Catalog and interfaces
    // ---------------------------------------------------------------------

    fn update_devices(&mut self, devices: Vec<LanDeviceInfo>) {
        for info in devices {
            let Ok(did_num) = info.did.parse::<u64>() else {
                info!("Skipping non-numeric did {}", info.did);
                continue;
            };
            let cipher = match LanCipher::from_hex(&info.token) {
                Ok(c) => c,
                Err(e) => {
                    error!("Invalid token for device {}: {}", info.did, e);
                    continue;
                }
            };
            match self.devices.get_mut(&info.did) {
                Some(dev) => {
                    if dev.cipher.token() != cipher.token() {
                        dev.cipher = cipher;
                        debug!("Token updated for device {}", info.did);
                    }
                }
                None => {
                    debug!("LAN device added, {}", info.did);
                    self.devices.insert(info.did, LanDevice::new(did_num, cipher, self.config.liveness_timing()));
                }
            }
        }
    }

    fn delete_devices(&mut self, dids: Vec<String>) {
        for did in dids {
            if let Some(dev) = self.devices.remove(&did) {
                for key in [dev.ka_timer, dev.resume_timer].into_iter().flatten() {
                    self.timers.try_remove(&key);
                }
                debug!("LAN device deleted, {}", did);
            }
        }
    }

    fn update_net_ifs(&mut self, if_names: Vec<String>) {
        let wanted: HashSet<String> = if_names.into_iter().collect();
        let had_sockets = !self.sockets.is_empty();

        let stale: Vec<String> = self
            .sockets
            .keys()
            .filter(|name| !wanted.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(bound) = self.sockets.remove(&name) {
                bound.cancel.cancel();
                info!("LAN socket closed on {}", name);
            }
        }

        let mut added = false;
        for name in wanted {
            if self.sockets.contains_key(&name) {
                continue;
            }
            match self.create_socket(&name) {
                Ok(socket) => {
                    let socket = Arc::new(socket);
                    let cancel = CancellationToken::new();
                    self.spawn_receiver(&name, socket.clone(), cancel.clone());
                    self.sockets.insert(name.clone(), BoundSocket { socket, cancel });
                    info!("LAN socket opened on {}", name);
                    added = true;
                }
                Err(e) => error!("Failed to open LAN socket on {}: {}", name, e),
            }
        }

        if added {
            self.scan_interval = Duration::ZERO;
            let delay = self
                .config
                .scan_initial_delay()
                .mul_f64(rand::rng().random::<f64>());
            self.arm_scan(delay);
        }
        let has_sockets = !self.sockets.is_empty();
        if had_sockets != has_sockets {
            if !has_sockets && let Some(key) = self.scan_timer.take() {
                self.timers.try_remove(&key);
            }
            self.broadcast_lan_state(has_sockets);
        }
    }

    /// Create and configure a UDP socket bound to a network interface.
    fn create_socket(&self, if_name: &str) -> Result<UdpSocket> {
        let addr = SocketAddr::from((self.config.bind_addr, 0));
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on {}: {}", if_name, e);
        }
        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on {}: {}", if_name, e);
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Err(e) = socket.bind_device(Some(if_name.as_bytes())) {
            warn!("Failed to bind socket to interface {}: {}", if_name, e);
        }

        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    fn spawn_receiver(&self, if_name: &str, socket: Arc<UdpSocket>, cancel: CancellationToken) {
        let tx = self.inbound_tx.clone();
        let if_name = if_name.to_string();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_LEN];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = socket.recv_from(&mut buf) => match res {
                        Ok((len, from)) => {
                            let inbound = Inbound {
                                data: buf[..len].to_vec(),
                                from,
                                if_name: if_name.clone(),
                            };
                            if tx.send(inbound).await.is_err() {
                                break;
                            }
                        }
                        Err(e) if matches!(
                            e.kind(),
                            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
                        ) => debug!("Ignoring receive error on {}: {}", if_name, e),
                        Err(e) => {
                            error!("Receive failed on {}: {}", if_name, e);
                            break;
                        }
                    },
                }
            }
        });
    }

    fn update_subscribe_option(&mut self, enable: bool) {
        if enable == self.enable_subscribe {
            return;
        }
        self.enable_subscribe = enable;
        info!("LAN subscription {}", if enable { "enabled" } else { "disabled" });
        if !enable {
            let dids: Vec<String> = self.devices.keys().cloned().collect();
            for did in dids {
                self.unsubscribe_device(&did);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Discovery and liveness
    // ---------------------------------------------------------------------

    fn arm_scan(&mut self, after: Duration) {
        if let Some(key) = self.scan_timer.take() {
            self.timers.try_remove(&key);
        }
        self.scan_timer = Some(self.timers.insert(LanTimer::Scan, after));
    }

    fn scan(&mut self) {
        self.scan_timer = None;
        self.ping(None, self.config.broadcast_addr);

        let min = self.config.scan_interval_min();
        let max = self.config.scan_interval_max();
        self.scan_interval = if self.scan_interval.is_zero() {
            min
        } else {
            (self.scan_interval * 2).min(max)
        };
        let next = randomize(self.scan_interval, SCAN_JITTER, rand::rng().random::<f64>());
        self.arm_scan(next);
    }

    fn ping(&self, if_name: Option<&str>, target: Ipv4Addr) {
        let probe = build_probe(self.virtual_did);
        let addr = SocketAddr::from((target, self.config.device_port));
        match if_name {
            Some(name) => {
                self.send_on(name, &probe, addr);
            }
            None => {
                for name in self.sockets.keys() {
                    self.send_on(name, &probe, addr);
                }
            }
        }
    }

    fn send_on(&self, if_name: &str, data: &[u8], addr: SocketAddr) -> bool {
        let Some(bound) = self.sockets.get(if_name) else {
            warn!("No LAN socket on interface {}", if_name);
            return false;
        };
        match bound.socket.try_send_to(data, addr) {
            Ok(_) => true,
            Err(e) => {
                warn!("Send to {} on {} failed: {}", addr, if_name, e);
                false
            }
        }
    }

    fn keep_alive(&mut self, did: &str, ip: Ipv4Addr, if_name: &str) {
        let Some(dev) = self.devices.get_mut(did) else {
            return;
        };
        dev.ip = Some(ip);
        if dev.if_name.as_deref() != Some(if_name) {
            info!("Device {} reachable via {} ({})", did, if_name, ip);
            dev.if_name = Some(if_name.to_string());
        }
        self.step_liveness(did, LivenessEvent::Heard);
    }

    fn step_liveness(&mut self, did: &str, event: LivenessEvent) {
        let sample = rand::rng().random::<f64>();
        let Some(dev) = self.devices.get_mut(did) else {
            return;
        };
        let (next, effects) = dev.liveness.step(event, sample);
        if next.state() != LivenessState::Fresh && next.state() != dev.liveness.state() {
            debug!("Device {} keep-alive state {:?}", did, next.state());
        }
        dev.liveness = next;

        let mut ping = false;
        let mut change = None;
        for effect in effects {
            match effect {
                Effect::Schedule(after) => {
                    if let Some(key) = dev.ka_timer.take() {
                        self.timers.try_remove(&key);
                    }
                    dev.ka_timer = Some(self.timers.insert(LanTimer::KeepAlive(did.to_string()), after));
                }
                Effect::Ping => ping = true,
                Effect::WentOnline => change = Some(true),
                Effect::WentOffline => change = Some(false),
            }
        }

        if ping {
            match (dev.if_name.clone(), dev.ip) {
                (Some(if_name), Some(ip)) => self.ping(Some(&if_name), ip),
                _ => error!("Device {} has no known address to ping", did),
            }
        }
        if let Some(online) = change {
            self.change_online(did, online);
        }
    }

    fn change_online(&mut self, did: &str, online: bool) {
        let Some(dev) = self.devices.get_mut(did) else {
            return;
        };
        info!("Device {} liveness changed, online: {}", did, online);
        if let Some(key) = dev.resume_timer.take() {
            self.timers.try_remove(&key);
        }
        match dev.damper.record(online, Instant::now()) {
            Damping::Apply(value) => self.set_online(did, value),
            Damping::Defer(after) => {
                info!("Unstable device detected, {}", did);
                dev.resume_timer = Some(self.timers.insert(LanTimer::Resume(did.to_string()), after));
            }
        }
    }

    fn set_online(&mut self, did: &str, online: bool) {
        let Some(dev) = self.devices.get_mut(did) else {
            return;
        };
        if dev.online == online {
            return;
        }
        dev.online = online;
        self.broadcast_device_state(did);
    }

    fn broadcast_device_state(&self, did: &str) {
        let Some(dev) = self.devices.get(did) else {
            return;
        };
        let state = dev.state();
        for handler in self.device_state_subs.values() {
            let handler = handler.clone();
            let did = did.to_string();
            self.main.call_soon(move || handler(&did, state));
        }
    }

    fn broadcast_lan_state(&self, enabled: bool) {
        info!("LAN transport {}", if enabled { "enabled" } else { "disabled" });
        for handler in self.lan_state_subs.values() {
            let handler = handler.clone();
            self.main.call_soon(move || handler(enabled));
        }
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    fn handle_datagram(&mut self, inbound: Inbound) {
        if inbound.from.port() != self.config.device_port {
            return;
        }
        let IpAddr::V4(ip) = inbound.from.ip() else {
            return;
        };
        let header = match parse_header(&inbound.data) {
            Ok(h) => h,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", inbound.from, e);
                return;
            }
        };
        let did = header.did.to_string();
        let length = header.length as usize;

        let subscribed = {
            let Some(dev) = self.devices.get_mut(&did) else {
                debug!("Dropping datagram from unknown device {}", did);
                return;
            };
            dev.offset = now_secs() - header.timestamp as i64;
            dev.subscribed
        };

        if length == PROBE_LEN || subscribed {
            self.keep_alive(&did, ip, &inbound.if_name);
        }

        if self.enable_subscribe
            && length == PROBE_LEN
            && let Some(beacon) = parse_beacon(&inbound.data[..PROBE_LEN])
        {
            let resubscribe = match self.devices.get_mut(&did) {
                Some(dev) => {
                    dev.supports_wildcard = beacon.wildcard;
                    if beacon.accepts_wildcard() && beacon.epoch != dev.sub_epoch {
                        dev.subscribed = false;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if resubscribe {
                self.subscribe_device(&did);
            }
        }

        if length > PROBE_LEN {
            let plain = match self.devices.get(&did) {
                Some(dev) => unpack_frame(&dev.cipher, &inbound.data),
                None => return,
            };
            match plain.and_then(|p| Ok(serde_json::from_slice::<Value>(&p)?)) {
                Ok(msg) => self.handle_message(&did, msg),
                Err(e) => warn!("Dropping frame from device {}: {}", did, e),
            }
        }
    }

    fn handle_message(&mut self, did: &str, msg: Value) {
        let Some(id) = msg.get("id").and_then(Value::as_u64) else {
            warn!("Invalid message from {}, no id: {}", did, msg);
            return;
        };

        // Reply to one of our requests
        if let Some(req) = u32::try_from(id).ok().and_then(|id| self.pending.remove(&id)) {
            self.timers.try_remove(&req.timer);
            self.resolve(&req.did, req.kind, Ok(msg));
            return;
        }

        let (Some(method), Some(params)) = (msg.get("method").and_then(Value::as_str), msg.get("params")) else {
            debug!("Invalid message from {}, no method or params: {}", did, msg);
            return;
        };

        if !self.dedup.insert(format!("{}.{}", did, id)) {
            self.ack(did, id);
            return;
        }
        self.timers
            .insert(LanTimer::Dedup(format!("{}.{}", did, id)), self.config.dedup_window());
        debug!("LAN message from {}: {}", did, msg);

        match method {
            "properties_changed" => {
                for param in params.as_array().into_iter().flatten() {
                    let mut prop = match serde_json::from_value::<PropertyMessage>(param.clone()) {
                        Ok(p) => p,
                        Err(_) => {
                            debug!("Invalid property from {}: {}", did, param);
                            continue;
                        }
                    };
                    prop.did = did.to_string();
                    let key = prop_key(did, Some(prop.siid), Some(prop.piid));
                    for sub in self.subscribers.matches(&key) {
                        if let Subscriber::Prop(handler) = sub {
                            let handler = handler.clone();
                            let prop = prop.clone();
                            self.main.call_soon(move || handler(prop));
                        }
                    }
                }
            }
            "event_occured" => match serde_json::from_value::<EventMessage>(params.clone()) {
                Ok(mut event) => {
                    event.did = did.to_string();
                    let key = event_key(did, Some(event.siid), Some(event.eiid));
                    for sub in self.subscribers.matches(&key) {
                        if let Subscriber::Event(handler) = sub {
                            let handler = handler.clone();
                            let event = event.clone();
                            self.main.call_soon(move || handler(event));
                        }
                    }
                }
                Err(_) => debug!("Invalid event from {}: {}", did, params),
            },
            other => debug!("Unknown method {} from {}", other, did),
        }
        self.ack(did, id);
    }

    fn ack(&self, did: &str, id: u64) {
        if let Err(e) = self.send_to_device(did, &json!({"id": id, "result": {"code": 0}})) {
            debug!("Ack to {} failed: {}", did, e);
        }
    }

    fn handle_timer(&mut self, timer: LanTimer) {
        match timer {
            LanTimer::KeepAlive(did) => {
                if let Some(dev) = self.devices.get_mut(&did) {
                    dev.ka_timer = None;
                    self.step_liveness(&did, LivenessEvent::Timer);
                }
            }
            LanTimer::Resume(did) => {
                if let Some(dev) = self.devices.get_mut(&did) {
                    dev.resume_timer = None;
                    info!("Unstable resume threshold past, {}", did);
                    self.set_online(&did, true);
                }
            }
            LanTimer::Scan => self.scan(),
            LanTimer::Request(id) => {
                if let Some(req) = self.pending.remove(&id) {
                    warn!("Request {} to device {} timed out", id, req.did);
                    self.resolve(&req.did, req.kind, Err(MiotError::Timeout));
                }
            }
            LanTimer::Dedup(key) => {
                self.dedup.remove(&key);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    fn next_msg_id(&mut self) -> u32 {
        self.msg_id += 1;
        if self.msg_id > MSG_ID_MAX {
            self.msg_id = 1;
        }
        self.msg_id
    }

    fn send_to_device(&self, did: &str, msg: &Value) -> Result<()> {
        let dev = self
            .devices
            .get(did)
            .ok_or_else(|| MiotError::TransportUnreachable(format!("device {} not on lan", did)))?;
        let (Some(ip), Some(if_name)) = (dev.ip, dev.if_name.as_deref()) else {
            return Err(MiotError::TransportUnreachable(format!("device {} address unknown", did)));
        };
        let timestamp = (now_secs() - dev.offset) as u32;
        let frame = pack_frame(&dev.cipher, dev.did_num, timestamp, &serde_json::to_vec(msg)?)?;
        if self.send_on(if_name, &frame, SocketAddr::from((ip, self.config.device_port))) {
            Ok(())
        } else {
            Err(MiotError::TransportUnreachable(format!("send to {} failed", did)))
        }
    }

    fn send_request(&mut self, did: &str, mut msg: Map<String, Value>, timeout: Duration, kind: Pending) {
        let id = self.next_msg_id();
        msg.insert("id".into(), json!(id));
        match self.send_to_device(did, &Value::Object(msg)) {
            Ok(()) => {
                let timer = self.timers.insert(LanTimer::Request(id), timeout);
                self.pending.insert(
                    id,
                    PendingRequest {
                        did: did.to_string(),
                        kind,
                        timer,
                    },
                );
            }
            Err(e) => {
                debug!("Request {} to {} not sent: {}", id, did, e);
                self.resolve(did, kind, Err(e));
            }
        }
    }

    fn resolve(&mut self, did: &str, kind: Pending, result: Result<Value>) {
        match kind {
            Pending::Caller(tx) => {
                let _ = tx.send(result);
            }
            Pending::Subscribe { epoch } => self.on_subscribe_reply(did, epoch, result),
            Pending::Unsubscribe => match result.as_ref().map(|v| v.get("result").map(check_code)) {
                Ok(Some(Ok(_))) => info!("Unsubscribe success, {}", did),
                _ => error!("Unsubscribe device error, {}, {:?}", did, result),
            },
        }
    }

    fn subscribe_device(&mut self, did: &str) {
        let Some(dev) = self.devices.get_mut(did) else {
            return;
        };
        if dev.sub_pending {
            return;
        }
        dev.sub_pending = true;
        let epoch = now_secs() as u32;
        let msg = json!({
            "method": "miIO.sub",
            "params": {
                "version": "2.0",
                "did": self.virtual_did.to_string(),
                "update_ts": epoch,
                "sub_method": ".",
            }
        });
        if let Value::Object(map) = msg {
            let timeout = self.config.subscribe_timeout();
            self.send_request(did, map, timeout, Pending::Subscribe { epoch });
        }
    }

    fn on_subscribe_reply(&mut self, did: &str, epoch: u32, result: Result<Value>) {
        let Some(dev) = self.devices.get_mut(did) else {
            return;
        };
        dev.sub_pending = false;
        let accepted = matches!(
            result.as_ref().map(|v| v.get("result").and_then(|r| r.get("code")).and_then(Value::as_i64)),
            Ok(Some(0))
        );
        if !accepted {
            error!("Subscribe device error, {}, {:?}", did, result);
            return;
        }
        dev.subscribed = true;
        dev.sub_epoch = epoch;
        info!("Subscribe success, {:?}, {}", dev.if_name, did);
        self.broadcast_device_state(did);
    }

    fn unsubscribe_device(&mut self, did: &str) {
        let Some(dev) = self.devices.get_mut(did) else {
            return;
        };
        if !dev.subscribed {
            return;
        }
        dev.subscribed = false;
        let msg = json!({
            "method": "miIO.unsub",
            "params": {
                "version": "2.0",
                "did": self.virtual_did.to_string(),
                "update_ts": dev.sub_epoch,
                "sub_method": ".",
            }
        });
        if let Value::Object(map) = msg {
            let timeout = self.config.subscribe_timeout();
            self.send_request(did, map, timeout, Pending::Unsubscribe);
        }
        self.broadcast_device_state(did);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_result_checks_shape_and_did() {
        let ok = json!({"id": 1, "result": [{"did": "42", "siid": 2, "piid": 1, "code": 0, "value": true}]});
        assert_eq!(first_result(&ok, "42").unwrap()["value"], json!(true));
        assert!(matches!(first_result(&ok, "43"), Err(MiotError::InvalidResult(_))));

        let err = json!({"id": 1, "error": {"code": -9999, "message": "user ack timeout"}});
        assert_eq!(
            first_result(&err, "42"),
            Err(MiotError::Application {
                code: -9999,
                message: "user ack timeout".into()
            })
        );
        assert!(first_result(&json!({"id": 1, "result": []}), "42").is_err());
    }

    #[test]
    fn check_code_accepts_zero_and_one() {
        assert_eq!(check_code(&json!({"code": 1})), Ok(1));
        assert_eq!(check_code(&json!({})), Ok(0));
        assert!(check_code(&json!({"code": -4004})).is_err());
    }

    #[test]
    fn message_ids_wrap_to_one() {
        let main = MainLoop::from_handle(
            tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .handle()
                .clone(),
        );
        let mut worker = LanWorker::new(LanConfig::default(), 1, main);
        worker.msg_id = MSG_ID_MAX - 1;
        assert_eq!(worker.next_msg_id(), MSG_ID_MAX);
        assert_eq!(worker.next_msg_id(), 1);
    }
}
