#![allow(dead_code)]

use futures_util::future::BoxFuture;
use miot::client::{CloudApi, DeviceInfo, PropertyKey, Storage};
use miot::crypto::LanCipher;
use miot::mips::{Broker, BrokerEvent, MemoryBroker};
use miot::protocol::{Envelope, PROBE_LEN, SubscribeBeacon, build_probe_reply, pack_frame, unpack_frame};
use miot::{LanConfig, MiotLan, MipsConfig, PropertyMessage, Result};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub const TOKEN: &str = "00112233445566778899aabbccddeeff";
pub const NEW_TOKEN: &str = "ffeeddccbbaa99887766554433221100";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

/// LAN settings pointing at a simulated device on loopback.
pub fn lan_config(device_port: u16) -> LanConfig {
    LanConfig::new(["lo"])
        .with_device_port(device_port)
        .with_bind_addr(Ipv4Addr::LOCALHOST)
        .with_broadcast_addr(Ipv4Addr::LOCALHOST)
        .with_scan_initial_delay(Duration::from_millis(20))
        .with_scan_interval(Duration::from_millis(100), Duration::from_secs(1))
        .with_request_timeout(Duration::from_secs(2))
}

// -------------------------------------------------------------------------
// Simulated LAN device
// -------------------------------------------------------------------------

/// Reply body for a request plus how long to hold it back.
pub type Responder = Arc<dyn Fn(&Value) -> Option<(Value, Duration)> + Send + Sync>;

/// Answers the standard methods immediately. Property reads return `value`.
pub fn standard_responder(value: Value) -> Responder {
    Arc::new(move |msg| {
        let params = msg.get("params").cloned().unwrap_or(Value::Null);
        let first = params.get(0).cloned().unwrap_or(Value::Null);
        let body = match msg.get("method").and_then(Value::as_str)? {
            "get_properties" => json!({"result": [{
                "did": first["did"], "siid": first["siid"], "piid": first["piid"],
                "code": 0, "value": value,
            }]}),
            "set_properties" => json!({"result": [{
                "did": first["did"], "siid": first["siid"], "piid": first["piid"], "code": 0,
            }]}),
            "action" => json!({"result": {"code": 0, "out": [params["siid"], params["aiid"]]}}),
            "miIO.sub" | "miIO.unsub" => json!({"result": {"code": 0}}),
            _ => json!({"error": {"code": -9999, "message": "unknown method"}}),
        };
        Some((body, Duration::ZERO))
    })
}

struct DeviceShared {
    did: u64,
    cipher: Mutex<LanCipher>,
    beacon: Mutex<Option<SubscribeBeacon>>,
    responder: Responder,
    peer: Mutex<Option<SocketAddr>>,
    received: Mutex<Vec<Value>>,
    rejected: AtomicUsize,
    probes: AtomicUsize,
    push_id: AtomicU64,
    muted: AtomicBool,
}

impl DeviceShared {
    async fn send(&self, socket: &UdpSocket, to: SocketAddr, body: &Value) {
        let frame = {
            let cipher = self.cipher.lock();
            let Ok(data) = serde_json::to_vec(body) else {
                return;
            };
            match pack_frame(&cipher, self.did, now_secs(), &data) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        };
        let _ = socket.send_to(&frame, to).await;
    }
}

/// A LAN device on a loopback UDP port.
pub struct FakeDevice {
    pub did: u64,
    pub port: u16,
    shared: Arc<DeviceShared>,
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    pub async fn start(did: u64, token: &str, beacon: Option<SubscribeBeacon>, responder: Responder) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind fake device"));
        let port = socket.local_addr().expect("local addr").port();
        let shared = Arc::new(DeviceShared {
            did,
            cipher: Mutex::new(LanCipher::from_hex(token).expect("token")),
            beacon: Mutex::new(beacon),
            responder,
            peer: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            push_id: AtomicU64::new(1000),
            muted: AtomicBool::new(false),
        });
        let task = tokio::spawn(serve(shared.clone(), socket.clone()));
        Self {
            did,
            port,
            shared,
            socket,
            task,
        }
    }

    pub fn did_str(&self) -> String {
        self.did.to_string()
    }

    /// Control messages decoded so far, acks included.
    pub fn received(&self) -> Vec<Value> {
        self.shared.received.lock().clone()
    }

    pub fn received_method(&self, method: &str) -> usize {
        self.received()
            .iter()
            .filter(|m| m.get("method").and_then(Value::as_str) == Some(method))
            .count()
    }

    /// Frames dropped because the integrity tag did not match our token.
    pub fn rejected(&self) -> usize {
        self.shared.rejected.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.shared.probes.load(Ordering::SeqCst)
    }

    pub fn rotate_token(&self, token: &str) {
        *self.shared.cipher.lock() = LanCipher::from_hex(token).expect("token");
    }

    /// Send a device-initiated message to the controller; returns its id.
    pub async fn push(&self, method: &str, params: Value) -> u64 {
        let id = self.shared.push_id.fetch_add(1, Ordering::SeqCst);
        self.push_with_id(id, method, params).await;
        id
    }

    pub async fn push_with_id(&self, id: u64, method: &str, params: Value) {
        let Some(peer) = *self.shared.peer.lock() else {
            panic!("controller has not contacted the device yet");
        };
        let msg = json!({"id": id, "method": method, "params": params});
        self.shared.send(&self.socket, peer, &msg).await;
    }

    /// Change the subscription epoch, as a device does after a reboot.
    pub fn reset_epoch(&self, epoch: u32) {
        if let Some(beacon) = self.shared.beacon.lock().as_mut() {
            beacon.epoch = epoch;
        }
    }

    /// A muted device drops every datagram, probes included.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(shared: Arc<DeviceShared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            break;
        };
        if shared.muted.load(Ordering::SeqCst) {
            continue;
        }
        let data = buf[..len].to_vec();
        *shared.peer.lock() = Some(from);

        if len == PROBE_LEN {
            shared.probes.fetch_add(1, Ordering::SeqCst);
            let beacon = *shared.beacon.lock();
            let reply = build_probe_reply(shared.did, now_secs(), beacon);
            let _ = socket.send_to(&reply, from).await;
            continue;
        }

        let plain = {
            let cipher = shared.cipher.lock();
            unpack_frame(&cipher, &data)
        };
        let Some(msg) = plain.ok().and_then(|p| serde_json::from_slice::<Value>(&p).ok()) else {
            shared.rejected.fetch_add(1, Ordering::SeqCst);
            continue;
        };
        shared.received.lock().push(msg.clone());

        // the beacon echoes the epoch of the accepted subscription
        if msg.get("method").and_then(Value::as_str) == Some("miIO.sub")
            && let Some(epoch) = msg["params"]["update_ts"].as_u64()
            && let Some(beacon) = shared.beacon.lock().as_mut()
        {
            beacon.epoch = epoch as u32;
        }

        // acks carry no method
        let (Some(id), Some(_)) = (msg.get("id").cloned(), msg.get("method")) else {
            continue;
        };
        let Some((mut body, delay)) = (shared.responder)(&msg) else {
            continue;
        };
        body["id"] = id;
        let shared = shared.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.send(&socket, from, &body).await;
        });
    }
}

/// Wait until the LAN transport lists `did` as online.
pub async fn wait_lan_online(lan: &MiotLan, did: &str) {
    for _ in 0..300 {
        if lan.get_dev_list().await.map(|l| l.contains_key(did)).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("device {} never came online", did);
}

/// Wait until the LAN transport holds a push subscription with `did`.
pub async fn wait_lan_subscribed(lan: &MiotLan, did: &str) {
    for _ in 0..300 {
        if let Ok(list) = lan.get_dev_list().await
            && list.get(did).is_some_and(|state| state.push_available)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("device {} never accepted the subscription", did);
}

// -------------------------------------------------------------------------
// Simulated hub gateway
// -------------------------------------------------------------------------

/// Reply payload for a `master/{method}` request, `None` to stay silent.
pub type HubResponder = Arc<dyn Fn(&str, &Value) -> Option<Value> + Send + Sync>;

pub fn envelope(mid: u32, payload: &Value) -> Vec<u8> {
    Envelope {
        mid,
        from: None,
        ret_topic: None,
        payload: Some(payload.to_string()),
    }
    .pack()
    .expect("pack envelope")
}

/// The hub side of a local broker: answers proxy requests.
pub struct HubSim {
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    task: JoinHandle<()>,
}

impl HubSim {
    pub fn start(broker: &MemoryBroker, responder: HubResponder) -> Self {
        let (session, mut events) = broker
            .connect(&MipsConfig::local("127.0.0.1", 0))
            .expect("hub session");
        session
            .subscribe(&["master/proxy/#".to_string()])
            .expect("hub subscribe");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let BrokerEvent::Message { topic, payload } = event else {
                    continue;
                };
                let Ok(request) = Envelope::unpack(&payload) else {
                    continue;
                };
                let body: Value = request
                    .payload
                    .as_deref()
                    .and_then(|p| serde_json::from_str(p).ok())
                    .unwrap_or(Value::Null);
                let method = topic.trim_start_matches("master/").to_string();
                seen.lock().push((method.clone(), body.clone()));
                if let (Some(reply), Some(ret_topic)) = (responder(&method, &body), request.ret_topic) {
                    let _ = session.publish(&ret_topic, envelope(request.mid, &reply));
                }
            }
        });
        Self { requests, task }
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().clone()
    }
}

impl Drop for HubSim {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A hub listing `devices` as `(did, online)`, all with spec v2 access and push.
pub fn hub_responder(devices: Vec<(&'static str, bool)>, value: Value) -> HubResponder {
    Arc::new(move |method, body| match method {
        "proxy/getDevList" => {
            let list: serde_json::Map<String, Value> = devices
                .iter()
                .map(|(did, online)| {
                    (
                        did.to_string(),
                        json!({
                            "name": "dev", "urn": "urn:miot-spec-v2:device:light:0000A001",
                            "model": "yeelink.light.lamp1", "online": online,
                            "specV2Access": true, "pushAvailable": true,
                        }),
                    )
                })
                .collect();
            Some(json!({"devList": list}))
        }
        "proxy/get" => Some(json!({"value": value})),
        "proxy/rpcReq" => {
            let rpc = &body["rpc"];
            match rpc["method"].as_str() {
                Some("set_properties") => Some(json!({"result": [{"did": body["did"], "code": 0}]})),
                Some("action") => Some(json!({"result": {"code": 0, "out": ["done"]}})),
                _ => None,
            }
        }
        _ => None,
    })
}

// -------------------------------------------------------------------------
// Host collaborators
// -------------------------------------------------------------------------

#[derive(Default)]
pub struct MockCloud {
    pub props: Mutex<HashMap<(String, u32, u32), Value>>,
    pub online: Mutex<HashMap<String, bool>>,
    pub set_code: Mutex<i64>,
    pub calls: Mutex<Vec<String>>,
}

impl MockCloud {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

impl CloudApi for MockCloud {
    fn get_prop(&self, did: String, siid: u32, piid: u32) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.record(format!("get_prop {}.{}.{}", did, siid, piid));
            self.props
                .lock()
                .get(&(did, siid, piid))
                .cloned()
                .ok_or(miot::MiotError::Application {
                    code: -704220043,
                    message: "property not found".to_string(),
                })
        })
    }

    fn get_props(&self, keys: Vec<PropertyKey>) -> BoxFuture<'_, Result<Vec<PropertyMessage>>> {
        Box::pin(async move {
            self.record(format!("get_props {}", keys.len()));
            let props = self.props.lock();
            Ok(keys
                .into_iter()
                .filter_map(|key| {
                    props
                        .get(&(key.did.clone(), key.siid, key.piid))
                        .map(|value| PropertyMessage {
                            did: key.did,
                            siid: key.siid,
                            piid: key.piid,
                            value: value.clone(),
                        })
                })
                .collect())
        })
    }

    fn set_prop(&self, did: String, siid: u32, piid: u32, value: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.record(format!("set_prop {}.{}.{}={}", did, siid, piid, value));
            Ok(json!({"did": did, "siid": siid, "piid": piid, "code": *self.set_code.lock()}))
        })
    }

    fn action(&self, did: String, siid: u32, aiid: u32, in_list: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.record(format!("action {}.{}.{}", did, siid, aiid));
            Ok(json!({"code": 0, "out": in_list}))
        })
    }

    fn refresh_devices(&self, dids: Vec<String>) -> BoxFuture<'_, Result<HashMap<String, bool>>> {
        Box::pin(async move {
            self.record(format!("refresh_devices {}", dids.len()));
            let online = self.online.lock();
            Ok(dids
                .into_iter()
                .filter_map(|did| online.get(&did).map(|o| (did, *o)))
                .collect())
        })
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    pub saved: Mutex<Vec<Vec<DeviceInfo>>>,
}

impl Storage for MemoryStorage {
    fn save_devices(&self, devices: Vec<DeviceInfo>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.saved.lock().push(devices);
            Ok(())
        })
    }
}
