//! Control-plane orchestrator.
//!
//! [`MiotClient`] holds the device catalog and one reachability flag per source
//! (cloud, hub gateway, LAN), picks a transport per call, reconciles the
//! per-source flags into one online/offline signal and batches property
//! refreshes. All of its state lives on the host loop; transports reach it only
//! through callbacks scheduled with [`MainLoop::call_soon`].

use crate::config::{ClientConfig, CtrlMode};
use crate::error::{MiotError, Result};
use crate::lan::{LanDeviceInfo, LanDeviceState, MiotLan};
use crate::matcher::TopicMatcher;
use crate::mips::{HubDevice, MipsCloudClient, MipsLocalClient};
use crate::runtime::MainLoop;
use crate::types::{
    DeviceState, EventHandler, EventMessage, PropertyHandler, PropertyMessage, event_key, prop_key,
};
use futures_core::Stream;
use futures_util::future::{BoxFuture, join_all};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Connect types whose devices speak the LAN protocol.
const LAN_CONNECT_TYPES: [i32; 4] = [0, 8, 12, 23];
/// Cloud codes meaning the device was removed or went offline.
const CLOUD_DEVICE_GONE: [i64; 2] = [-704010000, -704042011];
const SUB_KEY: &str = "miot-client";

/// Catalog entry handed over by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub did: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    /// LAN token, 32 hex characters
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub connect_type: Option<i32>,
    /// Online as last reported by the cloud
    #[serde(default)]
    pub online: bool,
    /// Hub group the device was last seen behind
    #[serde(default)]
    pub group_id: Option<String>,
}

impl DeviceInfo {
    pub fn new(did: &str, name: &str, model: &str) -> Self {
        Self {
            did: did.to_string(),
            name: name.to_string(),
            model: model.to_string(),
            token: None,
            connect_type: None,
            online: false,
            group_id: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_cloud_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn lan_capable(&self) -> bool {
        self.token.is_some()
            && self
                .connect_type
                .is_none_or(|t| LAN_CONNECT_TYPES.contains(&t))
    }
}

/// A device as listed by one hub gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayDevice {
    pub group_id: String,
    pub online: bool,
    pub specv2_access: bool,
    pub push_available: bool,
}

/// What each source currently says about one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceView {
    pub cloud_online: Option<bool>,
    pub gateway: Option<GatewayDevice>,
    pub lan: Option<LanDeviceState>,
}

/// Transport chosen for a call or for push messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Hub gateway identified by its group id
    Gateway(String),
    Lan,
    Cloud,
}

/// Pick the transport for get/set/action. The hub comes first when hub control
/// is enabled, the device has spec v2 access there and a client for the hub
/// exists; then LAN; then the cloud.
pub fn select_transport<F>(view: &DeviceView, mode: CtrlMode, hub_control: bool, has_hub: F) -> Option<Route>
where
    F: Fn(&str) -> bool,
{
    if mode == CtrlMode::Auto {
        if hub_control
            && let Some(gw) = &view.gateway
            && gw.online
            && gw.specv2_access
        {
            if has_hub(&gw.group_id) {
                return Some(Route::Gateway(gw.group_id.clone()));
            }
            error!("No gateway route for group {}, trying other transports", gw.group_id);
        }
        if view.lan.is_some_and(|lan| lan.online) {
            return Some(Route::Lan);
        }
    }
    if view.cloud_online == Some(true) {
        return Some(Route::Cloud);
    }
    None
}

/// Pick the source that delivers property and event pushes.
pub fn select_push_source(view: &DeviceView, mode: CtrlMode) -> Option<Route> {
    if mode == CtrlMode::Auto {
        if let Some(gw) = &view.gateway
            && gw.online
            && gw.push_available
        {
            return Some(Route::Gateway(gw.group_id.clone()));
        }
        if view.lan.is_some_and(|lan| lan.online && lan.push_available) {
            return Some(Route::Lan);
        }
    }
    if view.cloud_online == Some(true) {
        return Some(Route::Cloud);
    }
    None
}

/// Derived online flag: `None` when no source has ever reported the device,
/// otherwise the OR of all sources.
pub fn check_device_state(cloud: Option<bool>, gateway: bool, lan: bool) -> Option<bool> {
    if cloud.is_none() && !gateway && !lan {
        return None;
    }
    Some(cloud.unwrap_or(false) || gateway || lan)
}

// -------------------------------------------------------------------------
// Host collaborators
// -------------------------------------------------------------------------

/// Property coordinates for batched cloud reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyKey {
    pub did: String,
    pub siid: u32,
    pub piid: u32,
}

impl PropertyKey {
    fn refresh_key(&self) -> String {
        format!("{}|{}|{}", self.did, self.siid, self.piid)
    }
}

/// Cloud HTTP API provided by the host.
pub trait CloudApi: Send + Sync + 'static {
    fn get_prop(&self, did: String, siid: u32, piid: u32) -> BoxFuture<'_, Result<Value>>;
    /// Results carry `did`, `siid`, `piid` and `value`; unreadable entries are omitted.
    fn get_props(&self, keys: Vec<PropertyKey>) -> BoxFuture<'_, Result<Vec<PropertyMessage>>>;
    /// Returns the result object, `{"code": ..}` at least.
    fn set_prop(&self, did: String, siid: u32, piid: u32, value: Value) -> BoxFuture<'_, Result<Value>>;
    /// Returns the result object, `{"code": .., "out": [..]}`.
    fn action(&self, did: String, siid: u32, aiid: u32, in_list: Vec<Value>) -> BoxFuture<'_, Result<Value>>;
    /// Current cloud online flag per did.
    fn refresh_devices(&self, dids: Vec<String>) -> BoxFuture<'_, Result<HashMap<String, bool>>>;
}

/// Persistent catalog storage provided by the host.
pub trait Storage: Send + Sync + 'static {
    fn save_devices(&self, devices: Vec<DeviceInfo>) -> BoxFuture<'_, Result<()>>;
}

pub type DeviceStateHandler = Arc<dyn Fn(&str, DeviceState) + Send + Sync>;

/// Everything the orchestrator reports, as one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    DeviceState { did: String, state: DeviceState },
    Property(PropertyMessage),
    Event(EventMessage),
    CloudState(bool),
    HubState { group_id: String, connected: bool },
    LanState(bool),
}

// -------------------------------------------------------------------------
// Client
// -------------------------------------------------------------------------

enum ClientSub {
    Prop(PropertyHandler),
    Event(EventHandler),
}

struct RefreshItem {
    key: PropertyKey,
    attempts: u32,
}

#[derive(Default)]
struct RefreshQueue {
    items: HashMap<String, RefreshItem>,
    running: bool,
}

#[derive(Default)]
struct ClientState {
    devices: HashMap<String, DeviceInfo>,
    online: HashMap<String, Option<bool>>,
    /// `None` once the cloud stops listing the device
    cloud: HashMap<String, Option<bool>>,
    gateway: HashMap<String, GatewayDevice>,
    lan: HashMap<String, LanDeviceState>,
    hubs: HashMap<String, Arc<MipsLocalClient>>,
    sub_source: HashMap<String, Route>,
    subs: TopicMatcher<ClientSub>,
    state_subs: HashMap<String, DeviceStateHandler>,
}

type StateChange = (String, Option<bool>);

impl ClientState {
    fn view(&self, did: &str) -> DeviceView {
        DeviceView {
            cloud_online: self.cloud.get(did).copied().flatten(),
            gateway: self.gateway.get(did).cloned(),
            lan: self.lan.get(did).copied(),
        }
    }

    fn reconcile(&mut self, did: &str) -> Option<StateChange> {
        if !self.devices.contains_key(did) {
            return None;
        }
        let new = check_device_state(
            self.cloud.get(did).copied().flatten(),
            self.gateway.get(did).is_some_and(|gw| gw.online),
            self.lan.get(did).is_some_and(|lan| lan.online),
        );
        let old = self.online.get(did).copied().flatten();
        if old == new {
            return None;
        }
        self.online.insert(did.to_string(), new);
        Some((did.to_string(), new))
    }
}

struct ClientInner {
    config: ClientConfig,
    main: MainLoop,
    cloud_api: Option<Arc<dyn CloudApi>>,
    storage: Option<Arc<dyn Storage>>,
    lan: Option<Arc<MiotLan>>,
    mips_cloud: Option<Arc<MipsCloudClient>>,
    state: Mutex<ClientState>,
    refresh: Mutex<RefreshQueue>,
    event_tx: broadcast::Sender<ClientEvent>,
}

/// Builder for [`MiotClient`].
pub struct MiotClientBuilder {
    config: ClientConfig,
    cloud_api: Option<Arc<dyn CloudApi>>,
    storage: Option<Arc<dyn Storage>>,
    lan: Option<Arc<MiotLan>>,
    mips_cloud: Option<Arc<MipsCloudClient>>,
}

impl MiotClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            cloud_api: None,
            storage: None,
            lan: None,
            mips_cloud: None,
        }
    }

    pub fn cloud_api(mut self, api: Arc<dyn CloudApi>) -> Self {
        self.cloud_api = Some(api);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn lan(mut self, lan: Arc<MiotLan>) -> Self {
        self.lan = Some(lan);
        self
    }

    pub fn cloud_broker(mut self, mips: Arc<MipsCloudClient>) -> Self {
        self.mips_cloud = Some(mips);
        self
    }

    pub fn build(self, main: MainLoop) -> MiotClient {
        let (event_tx, _) = broadcast::channel(64);
        MiotClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                main,
                cloud_api: self.cloud_api,
                storage: self.storage,
                lan: self.lan,
                mips_cloud: self.mips_cloud,
                state: Mutex::new(ClientState::default()),
                refresh: Mutex::new(RefreshQueue::default()),
                event_tx,
            }),
        }
    }
}

/// One device-control API over cloud, hub gateways and LAN.
#[derive(Clone)]
pub struct MiotClient {
    inner: Arc<ClientInner>,
}

impl MiotClient {
    pub fn builder(config: ClientConfig) -> MiotClientBuilder {
        MiotClientBuilder::new(config)
    }

    fn from_weak(weak: &Weak<ClientInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn weak(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    /// Load the catalog and hook up every transport's state callbacks.
    pub async fn init(&self, devices: Vec<DeviceInfo>) -> Result<()> {
        if let Some(lan) = &self.inner.lan {
            let weak = self.weak();
            lan.sub_lan_state(
                SUB_KEY,
                Arc::new(move |enabled| {
                    if let Some(client) = Self::from_weak(&weak) {
                        client.on_lan_state(enabled);
                    }
                }),
            )?;
            let weak = self.weak();
            lan.sub_device_state(
                SUB_KEY,
                Arc::new(move |did, state| {
                    if let Some(client) = Self::from_weak(&weak) {
                        client.on_lan_device_state(did, state);
                    }
                }),
            )?;
        }
        if let Some(mips) = &self.inner.mips_cloud {
            let weak = self.weak();
            mips.sub_state(
                SUB_KEY,
                Arc::new(move |connected| {
                    if let Some(client) = Self::from_weak(&weak) {
                        client.on_cloud_state(connected);
                    }
                }),
            )?;
        }

        self.update_devices(devices).await?;

        if let Some(lan) = &self.inner.lan {
            for (did, state) in lan.get_dev_list().await? {
                self.on_lan_device_state(&did, state);
            }
        }
        if self.inner.mips_cloud.as_ref().is_some_and(|m| m.is_connected()) {
            self.on_cloud_state(true);
        }
        info!("Client initialised with {} devices", self.inner.state.lock().devices.len());
        Ok(())
    }

    /// Add or update catalog entries and persist the catalog.
    pub async fn update_devices(&self, devices: Vec<DeviceInfo>) -> Result<()> {
        let mut changes = Vec::new();
        let mut lan_devices = Vec::new();
        let mut new_dids = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for device in devices {
                let did = device.did.clone();
                if device.lan_capable()
                    && let Some(token) = &device.token
                {
                    lan_devices.push(LanDeviceInfo::new(did.clone(), token.clone()));
                }
                state.cloud.insert(did.clone(), Some(device.online));
                if state.devices.insert(did.clone(), device).is_none() {
                    new_dids.push(did.clone());
                }
                self.update_device_sub(&mut state, &did);
                changes.extend(state.reconcile(&did));
            }
        }
        debug!("Catalog updated, {} new devices", new_dids.len());

        if let Some(lan) = &self.inner.lan
            && !lan_devices.is_empty()
        {
            lan.update_devices(lan_devices)?;
        }
        if let Some(mips) = &self.inner.mips_cloud
            && mips.is_connected()
        {
            for did in &new_dids {
                self.sub_cloud_device_state(mips, did)?;
            }
        }
        self.emit_states(changes);
        self.persist().await;
        Ok(())
    }

    /// Drop a device with everything attached to it and persist the catalog.
    ///
    /// The host's device-state handler is not called for the removed did;
    /// the events stream still reports it as disabled.
    pub async fn remove_device(&self, did: &str) -> Result<()> {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.devices.remove(did);
            if removed.is_some() {
                if let Some(route) = state.sub_source.remove(did) {
                    self.unsub_from(&state, &route, did);
                }
                state.online.remove(did);
                state.cloud.remove(did);
                state.gateway.remove(did);
                state.lan.remove(did);
                state.state_subs.remove(did);
                let observers: Vec<String> = state
                    .subs
                    .iter_prefix(did)
                    .into_iter()
                    .map(|(key, _)| key)
                    .collect();
                for key in observers {
                    state.subs.remove(&key);
                }
            }
            removed
        };
        let Some(device) = removed else {
            return Err(MiotError::DeviceNotFound(did.to_string()));
        };
        if let Some(lan) = &self.inner.lan
            && device.lan_capable()
        {
            lan.delete_devices(vec![did.to_string()])?;
        }
        if let Some(mips) = &self.inner.mips_cloud {
            mips.unsub_device_state(did)?;
        }
        info!("Device removed, {}", did);
        self.emit(ClientEvent::DeviceState {
            did: did.to_string(),
            state: DeviceState::Disable,
        });
        self.persist().await;
        Ok(())
    }

    async fn persist(&self) {
        let Some(storage) = &self.inner.storage else {
            return;
        };
        let devices: Vec<DeviceInfo> = self.inner.state.lock().devices.values().cloned().collect();
        if let Err(e) = storage.save_devices(devices).await {
            error!("Failed to persist device catalog: {}", e);
        }
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.inner.state.lock().devices.values().cloned().collect()
    }

    /// Derived online flag, `None` if the device is unknown or never reported.
    pub fn device_online(&self, did: &str) -> Option<bool> {
        self.inner.state.lock().online.get(did).copied().flatten()
    }

    pub fn device_view(&self, did: &str) -> Option<DeviceView> {
        let state = self.inner.state.lock();
        state.devices.contains_key(did).then(|| state.view(did))
    }

    /// Current push source of a device.
    pub fn push_source(&self, did: &str) -> Option<Route> {
        self.inner.state.lock().sub_source.get(did).cloned()
    }

    /// Stream of everything the client reports.
    pub fn events(&self) -> impl Stream<Item = ClientEvent> {
        let mut rx = self.inner.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn emit_states(&self, changes: Vec<StateChange>) {
        for (did, online) in changes {
            let state = match online {
                Some(online) => DeviceState::from(online),
                None => DeviceState::Disable,
            };
            info!("Device state changed, {}, {:?}", did, state);
            let handler = self.inner.state.lock().state_subs.get(&did).cloned();
            if let Some(handler) = handler {
                handler(&did, state);
            }
            self.emit(ClientEvent::DeviceState { did, state });
        }
    }

    // ---------------------------------------------------------------------
    // Control
    // ---------------------------------------------------------------------

    fn route(&self, did: &str) -> Result<Route> {
        let state = self.inner.state.lock();
        if !state.devices.contains_key(did) {
            return Err(MiotError::DeviceNotFound(did.to_string()));
        }
        let view = state.view(did);
        select_transport(&view, self.inner.config.ctrl_mode, self.inner.config.hub_control, |group| {
            state.hubs.contains_key(group)
        })
        .ok_or_else(|| MiotError::TransportUnreachable(format!("no link to device {}", did)))
    }

    fn hub(&self, group_id: &str) -> Result<Arc<MipsLocalClient>> {
        self.inner
            .state
            .lock()
            .hubs
            .get(group_id)
            .cloned()
            .ok_or_else(|| MiotError::TransportUnreachable(format!("hub {} gone", group_id)))
    }

    fn lan(&self) -> Result<&Arc<MiotLan>> {
        self.inner
            .lan
            .as_ref()
            .ok_or_else(|| MiotError::TransportUnreachable("lan disabled".to_string()))
    }

    fn cloud_api(&self) -> Result<&Arc<dyn CloudApi>> {
        self.inner
            .cloud_api
            .as_ref()
            .ok_or_else(|| MiotError::TransportUnreachable("no cloud api".to_string()))
    }

    /// Check a cloud result code, asking for a device refresh when the cloud
    /// says the device is gone.
    fn check_cloud_result(&self, did: &str, result: &Value) -> Result<()> {
        let code = result.get("code").and_then(Value::as_i64).unwrap_or(0);
        if matches!(code, 0 | 1) {
            return Ok(());
        }
        if CLOUD_DEVICE_GONE.contains(&code) {
            error!("Device may be removed or offline, {}", did);
            let client = self.clone();
            let dids = vec![did.to_string()];
            self.inner.main.spawn(async move {
                client.refresh_cloud_devices(dids).await;
            });
        }
        Err(MiotError::from_reply(result))
    }

    pub async fn set_prop(&self, did: &str, siid: u32, piid: u32, value: Value) -> Result<()> {
        let route = self.route(did)?;
        debug!("Set prop {}.{}.{} via {:?}", did, siid, piid, route);
        match route {
            Route::Gateway(group) => {
                self.hub(&group)?
                    .set_prop(did, siid, piid, value, Some(self.inner.config.request_timeout()))
                    .await?;
            }
            Route::Lan => {
                self.lan()?
                    .set_prop(did, siid, piid, value, Some(self.inner.config.request_timeout()))
                    .await?;
            }
            Route::Cloud => {
                let result = self.cloud_api()?.set_prop(did.to_string(), siid, piid, value).await?;
                self.check_cloud_result(did, &result)?;
            }
        }
        Ok(())
    }

    pub async fn get_prop(&self, did: &str, siid: u32, piid: u32) -> Result<Value> {
        let route = self.route(did)?;
        debug!("Get prop {}.{}.{} via {:?}", did, siid, piid, route);
        match route {
            Route::Gateway(group) => {
                self.hub(&group)?
                    .get_prop(did, siid, piid, Some(self.inner.config.request_timeout()))
                    .await
            }
            Route::Lan => {
                self.lan()?
                    .get_prop(did, siid, piid, Some(self.inner.config.request_timeout()))
                    .await
            }
            Route::Cloud => self.cloud_api()?.get_prop(did.to_string(), siid, piid).await,
        }
    }

    pub async fn action(&self, did: &str, siid: u32, aiid: u32, in_list: Vec<Value>) -> Result<Vec<Value>> {
        let route = self.route(did)?;
        debug!("Action {}.{}.{} via {:?}", did, siid, aiid, route);
        match route {
            Route::Gateway(group) => {
                self.hub(&group)?
                    .action(did, siid, aiid, in_list, Some(self.inner.config.request_timeout()))
                    .await
            }
            Route::Lan => {
                self.lan()?
                    .action(did, siid, aiid, in_list, Some(self.inner.config.request_timeout()))
                    .await
            }
            Route::Cloud => {
                let result = self
                    .cloud_api()?
                    .action(did.to_string(), siid, aiid, in_list)
                    .await?;
                self.check_cloud_result(did, &result)?;
                Ok(result
                    .get("out")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Host observers
    // ---------------------------------------------------------------------

    fn require_device(&self, did: &str) -> Result<()> {
        if self.inner.state.lock().devices.contains_key(did) {
            Ok(())
        } else {
            Err(MiotError::DeviceNotFound(did.to_string()))
        }
    }

    pub fn sub_prop(&self, did: &str, siid: Option<u32>, piid: Option<u32>, handler: PropertyHandler) -> Result<()> {
        self.require_device(did)?;
        let key = prop_key(did, siid, piid);
        debug!("Client sub prop, {}", key);
        self.inner.state.lock().subs.insert(&key, ClientSub::Prop(handler));
        Ok(())
    }

    pub fn unsub_prop(&self, did: &str, siid: Option<u32>, piid: Option<u32>) {
        self.inner.state.lock().subs.remove(&prop_key(did, siid, piid));
    }

    pub fn sub_event(&self, did: &str, siid: Option<u32>, eiid: Option<u32>, handler: EventHandler) -> Result<()> {
        self.require_device(did)?;
        let key = event_key(did, siid, eiid);
        debug!("Client sub event, {}", key);
        self.inner.state.lock().subs.insert(&key, ClientSub::Event(handler));
        Ok(())
    }

    pub fn unsub_event(&self, did: &str, siid: Option<u32>, eiid: Option<u32>) {
        self.inner.state.lock().subs.remove(&event_key(did, siid, eiid));
    }

    pub fn sub_device_state(&self, did: &str, handler: DeviceStateHandler) -> Result<()> {
        self.require_device(did)?;
        self.inner.state.lock().state_subs.insert(did.to_string(), handler);
        Ok(())
    }

    pub fn unsub_device_state(&self, did: &str) {
        self.inner.state.lock().state_subs.remove(did);
    }

    fn on_prop_msg(&self, msg: PropertyMessage) {
        let key = prop_key(&msg.did, Some(msg.siid), Some(msg.piid));
        let handlers: Vec<PropertyHandler> = {
            let state = self.inner.state.lock();
            state
                .subs
                .matches(&key)
                .into_iter()
                .filter_map(|sub| match sub {
                    ClientSub::Prop(h) => Some(h.clone()),
                    ClientSub::Event(_) => None,
                })
                .collect()
        };
        for handler in handlers {
            handler(msg.clone());
        }
        self.emit(ClientEvent::Property(msg));
    }

    fn on_event_msg(&self, msg: EventMessage) {
        let key = event_key(&msg.did, Some(msg.siid), Some(msg.eiid));
        let handlers: Vec<EventHandler> = {
            let state = self.inner.state.lock();
            state
                .subs
                .matches(&key)
                .into_iter()
                .filter_map(|sub| match sub {
                    ClientSub::Event(h) => Some(h.clone()),
                    ClientSub::Prop(_) => None,
                })
                .collect()
        };
        for handler in handlers {
            handler(msg.clone());
        }
        self.emit(ClientEvent::Event(msg));
    }

    // ---------------------------------------------------------------------
    // Push source selection
    // ---------------------------------------------------------------------

    fn prop_handler(&self) -> PropertyHandler {
        let weak = self.weak();
        Arc::new(move |msg| {
            if let Some(client) = Self::from_weak(&weak) {
                client.on_prop_msg(msg);
            }
        })
    }

    fn event_handler(&self) -> EventHandler {
        let weak = self.weak();
        Arc::new(move |msg| {
            if let Some(client) = Self::from_weak(&weak) {
                client.on_event_msg(msg);
            }
        })
    }

    fn sub_from(&self, state: &ClientState, route: &Route, did: &str) {
        let result = match route {
            Route::Cloud => self.inner.mips_cloud.as_ref().map(|mips| {
                mips.sub_prop(did, None, None, self.prop_handler())
                    .and_then(|_| mips.sub_event(did, None, None, self.event_handler()))
            }),
            Route::Lan => self.inner.lan.as_ref().map(|lan| {
                lan.sub_prop(did, None, None, self.prop_handler())
                    .and_then(|_| lan.sub_event(did, None, None, self.event_handler()))
            }),
            Route::Gateway(group) => state.hubs.get(group).map(|hub| {
                hub.sub_prop(did, None, None, self.prop_handler())
                    .and_then(|_| hub.sub_event(did, None, None, self.event_handler()))
            }),
        };
        if let Some(Err(e)) = result {
            warn!("Subscribe {} via {:?} failed: {}", did, route, e);
        }
    }

    fn unsub_from(&self, state: &ClientState, route: &Route, did: &str) {
        let result = match route {
            Route::Cloud => self
                .inner
                .mips_cloud
                .as_ref()
                .map(|mips| mips.unsub_prop(did, None, None).and_then(|_| mips.unsub_event(did, None, None))),
            Route::Lan => self
                .inner
                .lan
                .as_ref()
                .map(|lan| lan.unsub_prop(did, None, None).and_then(|_| lan.unsub_event(did, None, None))),
            Route::Gateway(group) => state
                .hubs
                .get(group)
                .map(|hub| hub.unsub_prop(did, None, None).and_then(|_| hub.unsub_event(did, None, None))),
        };
        if let Some(Err(e)) = result {
            debug!("Unsubscribe {} via {:?} failed: {}", did, route, e);
        }
    }

    fn update_device_sub(&self, state: &mut ClientState, did: &str) {
        if !state.devices.contains_key(did) {
            return;
        }
        let old = state.sub_source.get(did).cloned();
        let new = select_push_source(&state.view(did), self.inner.config.ctrl_mode);
        if old == new {
            return;
        }
        if let Some(old) = &old {
            self.unsub_from(state, old, did);
        }
        match &new {
            Some(route) => {
                self.sub_from(state, route, did);
                state.sub_source.insert(did.to_string(), route.clone());
            }
            None => {
                state.sub_source.remove(did);
            }
        }
        info!("Device sub changed, {}, from {:?} to {:?}", did, old, new);
    }

    // ---------------------------------------------------------------------
    // Cloud source
    // ---------------------------------------------------------------------

    fn sub_cloud_device_state(&self, mips: &MipsCloudClient, did: &str) -> Result<()> {
        let weak = self.weak();
        mips.sub_device_state(
            did,
            Arc::new(move |did, online| {
                if let Some(client) = Self::from_weak(&weak) {
                    client.on_cloud_device_state(did, online);
                }
            }),
        )
    }

    fn on_cloud_state(&self, connected: bool) {
        info!("Cloud broker state changed, {}", connected);
        self.emit(ClientEvent::CloudState(connected));
        if connected {
            if let Some(mips) = &self.inner.mips_cloud {
                let dids: Vec<String> = self.inner.state.lock().devices.keys().cloned().collect();
                for did in &dids {
                    if let Err(e) = self.sub_cloud_device_state(mips, did) {
                        warn!("Cloud device state sub failed, {}, {}", did, e);
                    }
                }
                let client = self.clone();
                self.inner.main.spawn(async move {
                    client.refresh_cloud_devices(dids).await;
                });
            }
            return;
        }

        let changes = {
            let mut state = self.inner.state.lock();
            let dids: Vec<String> = state
                .cloud
                .iter()
                .filter(|(_, online)| **online == Some(true))
                .map(|(did, _)| did.clone())
                .collect();
            let mut changes = Vec::new();
            for did in dids {
                state.cloud.insert(did.clone(), Some(false));
                self.update_device_sub(&mut state, &did);
                changes.extend(state.reconcile(&did));
            }
            changes
        };
        self.emit_states(changes);
    }

    fn on_cloud_device_state(&self, did: &str, online: bool) {
        self.set_cloud_online(did, Some(online));
    }

    fn set_cloud_online(&self, did: &str, online: Option<bool>) {
        let change = {
            let mut state = self.inner.state.lock();
            match state.cloud.get(did) {
                None => return,
                Some(old) if *old == online => return,
                Some(_) => {}
            }
            info!("Cloud device state changed, {}, {:?}", did, online);
            state.cloud.insert(did.to_string(), online);
            self.update_device_sub(&mut state, did);
            state.reconcile(did)
        };
        self.emit_states(change.into_iter().collect());
    }

    /// Ask the cloud about `dids`; the ones it leaves out lose their cloud state.
    async fn refresh_cloud_devices(&self, dids: Vec<String>) {
        let Some(api) = self.inner.cloud_api.clone() else {
            return;
        };
        match api.refresh_devices(dids.clone()).await {
            Ok(mut states) => {
                for did in dids {
                    let online = states.remove(&did);
                    if online.is_none() {
                        warn!("Device {} unknown to the cloud", did);
                    }
                    self.set_cloud_online(&did, online);
                }
            }
            Err(e) => error!("Refresh cloud devices failed: {}", e),
        }
    }

    // ---------------------------------------------------------------------
    // LAN source
    // ---------------------------------------------------------------------

    fn on_lan_state(&self, enabled: bool) {
        info!("LAN state changed, {}", enabled);
        self.emit(ClientEvent::LanState(enabled));
        if enabled {
            let client = self.clone();
            self.inner.main.spawn(async move {
                let Some(lan) = client.inner.lan.clone() else {
                    return;
                };
                match lan.get_dev_list().await {
                    Ok(list) => {
                        for (did, state) in list {
                            client.on_lan_device_state(&did, state);
                        }
                    }
                    Err(e) => warn!("LAN device list unavailable: {}", e),
                }
            });
            return;
        }

        let changes = {
            let mut state = self.inner.state.lock();
            let dids: Vec<String> = state
                .lan
                .iter()
                .filter(|(_, lan)| lan.online)
                .map(|(did, _)| did.clone())
                .collect();
            state.lan.clear();
            let mut changes = Vec::new();
            for did in dids {
                self.update_device_sub(&mut state, &did);
                changes.extend(state.reconcile(&did));
            }
            changes
        };
        self.emit_states(changes);
    }

    fn on_lan_device_state(&self, did: &str, lan_state: LanDeviceState) {
        let change = {
            let mut state = self.inner.state.lock();
            if state.lan.get(did) == Some(&lan_state) {
                return;
            }
            info!("LAN device state changed, {}, {:?}", did, lan_state);
            state.lan.insert(did.to_string(), lan_state);
            self.update_device_sub(&mut state, did);
            state.reconcile(did)
        };
        self.emit_states(change.into_iter().collect());
    }

    // ---------------------------------------------------------------------
    // Hub gateways
    // ---------------------------------------------------------------------

    /// Register a hub client under its group id.
    pub fn add_hub(&self, group_id: &str, hub: Arc<MipsLocalClient>) -> Result<()> {
        let weak = self.weak();
        let group = group_id.to_string();
        hub.sub_state(
            SUB_KEY,
            Arc::new(move |connected| {
                if let Some(client) = Self::from_weak(&weak) {
                    client.on_hub_state(&group, connected);
                }
            }),
        )?;
        let weak = self.weak();
        let group = group_id.to_string();
        hub.on_dev_list_changed(Arc::new(move |dids| {
            if let Some(client) = Self::from_weak(&weak) {
                client.on_hub_dev_list_changed(&group, dids);
            }
        }))?;

        let connected = hub.is_connected();
        {
            let mut state = self.inner.state.lock();
            if let Some(old) = state.hubs.insert(group_id.to_string(), hub) {
                warn!("Hub {} replaced", group_id);
                let _ = old.unsub_state(SUB_KEY);
                // the push source is unchanged, so move its subscriptions over by hand
                let route = Route::Gateway(group_id.to_string());
                let dids: Vec<String> = state
                    .sub_source
                    .iter()
                    .filter(|(_, source)| **source == route)
                    .map(|(did, _)| did.clone())
                    .collect();
                for did in dids {
                    self.sub_from(&state, &route, &did);
                }
            }
        }
        info!("Hub added, {}", group_id);
        if connected {
            self.request_hub_refresh(group_id, None);
        }
        Ok(())
    }

    /// Forget a hub; its devices drop their gateway route.
    pub async fn remove_hub(&self, group_id: &str) -> Result<()> {
        let Some(hub) = self.inner.state.lock().hubs.remove(group_id) else {
            return Err(MiotError::InvalidParams(format!("unknown hub {}", group_id)));
        };
        let _ = hub.unsub_state(SUB_KEY);
        self.on_hub_state(group_id, false);
        hub.shutdown().await;
        info!("Hub removed, {}", group_id);
        Ok(())
    }

    fn on_hub_state(&self, group_id: &str, connected: bool) {
        info!("Hub state changed, {}, {}", group_id, connected);
        self.emit(ClientEvent::HubState {
            group_id: group_id.to_string(),
            connected,
        });
        if connected {
            self.request_hub_refresh(group_id, None);
            return;
        }

        let changes = {
            let mut state = self.inner.state.lock();
            let dids: Vec<String> = state
                .gateway
                .iter()
                .filter(|(_, gw)| gw.group_id == group_id && gw.online)
                .map(|(did, _)| did.clone())
                .collect();
            let mut changes = Vec::new();
            for did in dids {
                if let Some(gw) = state.gateway.get_mut(&did) {
                    gw.online = false;
                    gw.push_available = false;
                }
                self.update_device_sub(&mut state, &did);
                changes.extend(state.reconcile(&did));
            }
            changes
        };
        self.emit_states(changes);
    }

    fn on_hub_dev_list_changed(&self, group_id: &str, dids: Vec<String>) {
        info!("Hub device list changed, {}, {:?}", group_id, dids);
        self.request_hub_refresh(group_id, Some(dids));
    }

    fn request_hub_refresh(&self, group_id: &str, changed: Option<Vec<String>>) {
        let client = self.clone();
        let group = group_id.to_string();
        self.inner.main.spawn(async move {
            client.refresh_hub_devices(&group, changed).await;
        });
    }

    /// Pull the hub's device list, retrying while the hub stays connected.
    async fn refresh_hub_devices(&self, group_id: &str, changed: Option<Vec<String>>) {
        loop {
            let hub = match self.inner.state.lock().hubs.get(group_id) {
                Some(hub) => hub.clone(),
                None => return,
            };
            if !hub.is_connected() {
                debug!("Hub {} disconnected, skip refresh", group_id);
                return;
            }
            match hub.get_dev_list().await {
                Ok(list) => {
                    self.update_devices_from_gw(group_id, list, changed);
                    return;
                }
                Err(e) => {
                    error!("Refresh hub devices failed, {}, {}", group_id, e);
                    tokio::time::sleep(self.inner.config.refresh_retry_delay()).await;
                }
            }
        }
    }

    fn update_devices_from_gw(&self, group_id: &str, mut list: HashMap<String, HubDevice>, changed: Option<Vec<String>>) {
        let changes = {
            let mut state = self.inner.state.lock();
            let filter: Vec<String> = match changed {
                Some(dids) => dids
                    .into_iter()
                    .filter(|did| state.gateway.get(did).is_none_or(|gw| gw.group_id == group_id))
                    .collect(),
                None => state
                    .gateway
                    .iter()
                    .filter(|(_, gw)| gw.group_id == group_id)
                    .map(|(did, _)| did.clone())
                    .collect(),
            };

            let mut changes = Vec::new();
            for did in filter {
                if !state.devices.contains_key(&did) {
                    continue;
                }
                let old_online = state.gateway.get(&did).is_some_and(|gw| gw.online);
                let new_online = match list.remove(&did) {
                    Some(dev) => {
                        state.gateway.insert(did.clone(), gateway_device(group_id, &dev));
                        dev.online
                    }
                    None => {
                        if let Some(gw) = state.gateway.get_mut(&did) {
                            gw.online = false;
                        }
                        false
                    }
                };
                if let Some(info) = state.devices.get_mut(&did) {
                    info.group_id = Some(group_id.to_string());
                }
                if old_online == new_online && !new_online {
                    continue;
                }
                self.update_device_sub(&mut state, &did);
                changes.extend(state.reconcile(&did));
            }

            // New devices, or devices moved from another hub
            for (did, dev) in list {
                state.gateway.insert(did.clone(), gateway_device(group_id, &dev));
                let Some(info) = state.devices.get_mut(&did) else {
                    continue;
                };
                if info.group_id.as_deref() != Some(group_id) {
                    info!("Move device {} from {:?} to {}", did, info.group_id, group_id);
                }
                info.group_id = Some(group_id.to_string());
                self.update_device_sub(&mut state, &did);
                changes.extend(state.reconcile(&did));
            }
            changes
        };
        self.emit_states(changes);
    }

    // ---------------------------------------------------------------------
    // Property refresh
    // ---------------------------------------------------------------------

    /// Queue a property read whose result is delivered like a push.
    pub fn request_refresh_prop(&self, did: &str, siid: u32, piid: u32) -> Result<()> {
        self.require_device(did)?;
        let key = PropertyKey {
            did: did.to_string(),
            siid,
            piid,
        };
        let start = {
            let mut queue = self.inner.refresh.lock();
            queue
                .items
                .entry(key.refresh_key())
                .or_insert(RefreshItem { key, attempts: 0 });
            !std::mem::replace(&mut queue.running, true)
        };
        if start {
            let client = self.clone();
            self.inner.main.spawn(async move {
                client.run_refresh().await;
            });
        }
        Ok(())
    }

    async fn run_refresh(&self) {
        let mut delay = self.inner.config.refresh_delay();
        loop {
            tokio::time::sleep(delay).await;
            let cycle: Vec<String> = self.inner.refresh.lock().items.keys().cloned().collect();
            if cycle.is_empty() {
                self.inner.refresh.lock().running = false;
                return;
            }

            let from_cloud = self.refresh_from_cloud().await;
            let from_gw = self.refresh_from_local(true).await;
            let from_lan = self.refresh_from_local(false).await;
            debug!(
                "Refresh cycle resolved cloud {}, hub {}, lan {}",
                from_cloud, from_gw, from_lan
            );

            let mut queue = self.inner.refresh.lock();
            let mut max_attempts = 0;
            for key in cycle {
                let Some(item) = queue.items.get_mut(&key) else {
                    continue;
                };
                item.attempts += 1;
                if item.attempts > self.inner.config.refresh_max_retries {
                    error!("Refresh props failed, retry count exceeded, {}", key);
                    queue.items.remove(&key);
                } else {
                    max_attempts = max_attempts.max(item.attempts);
                }
            }
            if queue.items.is_empty() {
                queue.running = false;
                return;
            }
            delay = if max_attempts == 0 {
                self.inner.config.refresh_delay()
            } else {
                info!("Refresh props retry {}, {} pending", max_attempts, queue.items.len());
                self.inner.config.refresh_retry_delay() * max_attempts
            };
        }
    }

    /// One cloud batch; returns the number of resolved properties.
    async fn refresh_from_cloud(&self) -> usize {
        let Some(api) = self.inner.cloud_api.clone() else {
            return 0;
        };
        let batch: Vec<RefreshItem> = {
            let mut queue = self.inner.refresh.lock();
            let keys: Vec<String> = queue
                .items
                .keys()
                .take(self.inner.config.refresh_cloud_batch.max(1))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| queue.items.remove(k)).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let mut pending: HashMap<String, RefreshItem> =
            batch.into_iter().map(|item| (item.key.refresh_key(), item)).collect();
        let keys = pending.values().map(|item| item.key.clone()).collect();
        let mut resolved = 0;
        match api.get_props(keys).await {
            Ok(results) => {
                for msg in results {
                    let key = format!("{}|{}|{}", msg.did, msg.siid, msg.piid);
                    if pending.remove(&key).is_some() {
                        resolved += 1;
                        self.on_prop_msg(msg);
                    }
                }
                if !pending.is_empty() {
                    info!("Refresh props failed, cloud, {:?}", pending.keys().collect::<Vec<_>>());
                }
            }
            Err(e) => error!("Refresh props error, cloud, {}", e),
        }
        self.requeue(pending);
        resolved
    }

    /// One read per device through hubs (`via_hub`) or LAN, all in parallel.
    async fn refresh_from_local(&self, via_hub: bool) -> usize {
        if self.inner.config.ctrl_mode != CtrlMode::Auto {
            return 0;
        }
        let picked: Vec<(RefreshItem, Route, Option<Arc<MipsLocalClient>>)> = {
            let state = self.inner.state.lock();
            let mut queue = self.inner.refresh.lock();
            let mut seen = Vec::new();
            let mut picked = Vec::new();
            let keys: Vec<String> = queue.items.keys().cloned().collect();
            for key in keys {
                let Some(did) = queue.items.get(&key).map(|item| item.key.did.clone()) else {
                    continue;
                };
                if seen.contains(&did) {
                    continue;
                }
                let target = if via_hub {
                    state.gateway.get(&did).filter(|gw| gw.online).and_then(|gw| {
                        state
                            .hubs
                            .get(&gw.group_id)
                            .map(|hub| (Route::Gateway(gw.group_id.clone()), Some(hub.clone())))
                    })
                } else if state.lan.get(&did).is_some_and(|lan| lan.online) && self.inner.lan.is_some() {
                    Some((Route::Lan, None))
                } else {
                    None
                };
                if let Some((route, hub)) = target
                    && let Some(item) = queue.items.remove(&key)
                {
                    seen.push(did);
                    picked.push((item, route, hub));
                }
            }
            picked
        };
        if picked.is_empty() {
            return 0;
        }

        let timeout = Some(self.inner.config.refresh_local_timeout());
        let lan = self.inner.lan.clone();
        let reads = picked.iter().map(|(item, _, hub)| {
            let key = item.key.clone();
            let hub = hub.clone();
            let lan = lan.clone();
            async move {
                match (hub, lan) {
                    (Some(hub), _) => hub.get_prop(&key.did, key.siid, key.piid, timeout).await,
                    (None, Some(lan)) => lan.get_prop(&key.did, key.siid, key.piid, timeout).await,
                    (None, None) => Err(MiotError::TransportUnreachable("lan disabled".to_string())),
                }
            }
        });
        let results = join_all(reads).await;

        let mut resolved = 0;
        let mut failed = HashMap::new();
        for ((item, route, _), result) in picked.into_iter().zip(results) {
            match result {
                Ok(value) => {
                    resolved += 1;
                    self.on_prop_msg(PropertyMessage {
                        did: item.key.did.clone(),
                        siid: item.key.siid,
                        piid: item.key.piid,
                        value,
                    });
                }
                Err(e) => {
                    debug!("Refresh {} via {:?} failed: {}", item.key.refresh_key(), route, e);
                    failed.insert(item.key.refresh_key(), item);
                }
            }
        }
        if !failed.is_empty() {
            info!(
                "Refresh props failed, {}, {:?}",
                if via_hub { "hub" } else { "lan" },
                failed.keys().collect::<Vec<_>>()
            );
        }
        self.requeue(failed);
        resolved
    }

    fn requeue(&self, items: HashMap<String, RefreshItem>) {
        let mut queue = self.inner.refresh.lock();
        for (key, item) in items {
            queue.items.entry(key).or_insert(item);
        }
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Unsubscribe everything and stop every transport worker.
    pub async fn deinit(&self) {
        let (hubs, mut dids) = {
            let mut state = self.inner.state.lock();
            let sources: Vec<(String, Route)> = state.sub_source.drain().collect();
            for (did, route) in &sources {
                self.unsub_from(&state, route, did);
            }
            let hubs: Vec<(String, Arc<MipsLocalClient>)> = state.hubs.drain().collect();
            let dids: Vec<String> = state.devices.keys().cloned().collect();
            state.subs = TopicMatcher::new();
            state.state_subs.clear();
            (hubs, dids)
        };
        {
            let mut queue = self.inner.refresh.lock();
            queue.items.clear();
        }

        for (group_id, hub) in hubs {
            let _ = hub.unsub_state(SUB_KEY);
            hub.shutdown().await;
            debug!("Hub {} stopped", group_id);
        }
        if let Some(mips) = &self.inner.mips_cloud {
            let _ = mips.unsub_state(SUB_KEY);
            for did in dids.drain(..) {
                let _ = mips.unsub_device_state(&did);
            }
            mips.shutdown().await;
        }
        if let Some(lan) = &self.inner.lan {
            let _ = lan.unsub_lan_state(SUB_KEY);
            let _ = lan.unsub_device_state(SUB_KEY);
            lan.shutdown().await;
        }
        info!("Client deinitialised");
    }
}

fn gateway_device(group_id: &str, dev: &HubDevice) -> GatewayDevice {
    GatewayDevice {
        group_id: group_id.to_string(),
        online: dev.online,
        specv2_access: dev.specv2_access,
        push_available: dev.push_available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gw(online: bool, specv2: bool, push: bool) -> Option<GatewayDevice> {
        Some(GatewayDevice {
            group_id: "g1".to_string(),
            online,
            specv2_access: specv2,
            push_available: push,
        })
    }

    fn lan(online: bool, push: bool) -> Option<LanDeviceState> {
        Some(LanDeviceState {
            online,
            push_available: push,
        })
    }

    #[test]
    fn derived_state_is_none_only_without_reports() {
        assert_eq!(check_device_state(None, false, false), None);
        assert_eq!(check_device_state(Some(false), false, false), Some(false));
        assert_eq!(check_device_state(None, false, true), Some(true));
        assert_eq!(check_device_state(Some(false), true, false), Some(true));
    }

    #[test]
    fn hub_wins_over_lan_when_enabled() {
        let view = DeviceView {
            cloud_online: Some(true),
            gateway: gw(true, true, true),
            lan: lan(true, true),
        };
        let has = |_: &str| true;
        assert_eq!(
            select_transport(&view, CtrlMode::Auto, true, has),
            Some(Route::Gateway("g1".to_string()))
        );
        assert_eq!(select_transport(&view, CtrlMode::Auto, false, has), Some(Route::Lan));
        assert_eq!(select_transport(&view, CtrlMode::Cloud, true, has), Some(Route::Cloud));
        // hub listed but no client for it
        assert_eq!(select_transport(&view, CtrlMode::Auto, true, |_| false), Some(Route::Lan));
    }

    #[test]
    fn hub_without_specv2_falls_through() {
        let view = DeviceView {
            cloud_online: Some(false),
            gateway: gw(true, false, true),
            lan: lan(false, false),
        };
        assert_eq!(select_transport(&view, CtrlMode::Auto, true, |_| true), None);

        let offline_cloud_lan_up = DeviceView {
            cloud_online: Some(false),
            gateway: None,
            lan: lan(true, false),
        };
        assert_eq!(
            select_transport(&offline_cloud_lan_up, CtrlMode::Auto, true, |_| true),
            Some(Route::Lan)
        );
    }

    #[test]
    fn push_source_needs_push_capability() {
        let view = DeviceView {
            cloud_online: Some(true),
            gateway: gw(true, true, false),
            lan: lan(true, false),
        };
        assert_eq!(select_push_source(&view, CtrlMode::Auto), Some(Route::Cloud));

        let lan_push = DeviceView {
            lan: lan(true, true),
            ..view.clone()
        };
        assert_eq!(select_push_source(&lan_push, CtrlMode::Auto), Some(Route::Lan));

        let gw_push = DeviceView {
            gateway: gw(true, true, true),
            ..lan_push
        };
        assert_eq!(
            select_push_source(&gw_push, CtrlMode::Auto),
            Some(Route::Gateway("g1".to_string()))
        );
        assert_eq!(select_push_source(&DeviceView::default(), CtrlMode::Auto), None);
    }

    #[test]
    fn lan_capability_follows_connect_type() {
        let mut info = DeviceInfo::new("1", "lamp", "yeelink.light.lamp1").with_token("00112233445566778899aabbccddeeff");
        assert!(info.lan_capable());
        info.connect_type = Some(16);
        assert!(!info.lan_capable());
        info.connect_type = Some(12);
        assert!(info.lan_capable());
        assert!(!DeviceInfo::new("2", "hub", "m").lan_capable());
    }

    #[test]
    fn reconcile_reports_only_changes() {
        let mut state = ClientState::default();
        state.devices.insert("1".into(), DeviceInfo::new("1", "", ""));
        state.cloud.insert("1".into(), Some(false));
        assert_eq!(state.reconcile("1"), Some(("1".to_string(), Some(false))));
        assert_eq!(state.reconcile("1"), None);

        // dropped by the cloud, nothing else knows it
        state.cloud.insert("1".into(), None);
        assert_eq!(state.reconcile("1"), Some(("1".to_string(), None)));
        assert_eq!(state.view("1").cloud_online, None);
        state.cloud.insert("1".into(), Some(false));
        assert_eq!(state.reconcile("1"), Some(("1".to_string(), Some(false))));

        state.lan.insert("1".into(), LanDeviceState { online: true, push_available: false });
        assert_eq!(state.reconcile("1"), Some(("1".to_string(), Some(true))));

        // unknown devices never report
        state.lan.insert("2".into(), LanDeviceState { online: true, push_available: false });
        assert_eq!(state.reconcile("2"), None);
    }
}
