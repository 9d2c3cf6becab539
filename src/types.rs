//! Device level messages and handler signatures shared by every transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Externally visible reachability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Removed from the catalog
    Disable,
    Offline,
    Online,
}

impl From<bool> for DeviceState {
    fn from(online: bool) -> Self {
        if online {
            DeviceState::Online
        } else {
            DeviceState::Offline
        }
    }
}

/// A property value pushed by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMessage {
    #[serde(default)]
    pub did: String,
    pub siid: u32,
    pub piid: u32,
    pub value: Value,
}

/// An event raised by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default)]
    pub did: String,
    pub siid: u32,
    pub eiid: u32,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

pub type PropertyHandler = Arc<dyn Fn(PropertyMessage) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(EventMessage) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Key under which property subscriptions are stored: `{did}/p/{siid}/{piid}`,
/// with `#` standing in for all properties.
pub fn prop_key(did: &str, siid: Option<u32>, piid: Option<u32>) -> String {
    match (siid, piid) {
        (Some(s), Some(p)) => format!("{}/p/{}/{}", did, s, p),
        _ => format!("{}/p/#", did),
    }
}

/// Key under which event subscriptions are stored: `{did}/e/{siid}/{eiid}`.
pub fn event_key(did: &str, siid: Option<u32>, eiid: Option<u32>) -> String {
    match (siid, eiid) {
        (Some(s), Some(e)) => format!("{}/e/{}/{}", did, s, e),
        _ => format!("{}/e/#", did),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_without_arguments_parses() {
        let ev: EventMessage = serde_json::from_value(json!({"siid": 2, "eiid": 1})).unwrap();
        assert!(ev.arguments.is_empty());
        assert_eq!(ev.did, "");
    }

    #[test]
    fn keys() {
        assert_eq!(prop_key("1", Some(2), Some(3)), "1/p/2/3");
        assert_eq!(prop_key("1", Some(2), None), "1/p/#");
        assert_eq!(event_key("1", Some(2), Some(3)), "1/e/2/3");
        assert_eq!(DeviceState::from(false), DeviceState::Offline);
    }
}
