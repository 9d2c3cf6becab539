//! # miot
//!
//! Asynchronous control plane for MIoT smart-home devices. Devices are reached
//! directly over the encrypted LAN UDP protocol, through a hub gateway's local
//! pub/sub broker, or through the cloud broker; [`MiotClient`] picks the
//! transport per call and folds every source into one online/offline signal.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use miot::{LanConfig, MainLoop, MiotLan};
//!
//! # async fn run() -> miot::Result<()> {
//! let lan = MiotLan::start(LanConfig::new(["eth0"]), MainLoop::current()?)?;
//! let value = lan.get_prop("123456", 2, 1, None).await?;
//! println!("{}", value);
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lan;
pub mod liveness;
pub mod matcher;
pub mod mips;
pub mod protocol;
pub mod runtime;
pub mod types;

pub use client::{
    ClientEvent, CloudApi, DeviceInfo, DeviceView, MiotClient, MiotClientBuilder, PropertyKey, Route, Storage,
};
pub use config::{BrokerKind, ClientConfig, CtrlMode, LanConfig, MipsConfig};
pub use error::{MiotError, Result};
pub use lan::{LanDeviceInfo, LanDeviceState, MiotLan};
pub use mips::{Broker, MemoryBroker, MipsCloudClient, MipsLocalClient, MqttBroker};
pub use runtime::MainLoop;
pub use types::{DeviceState, EventMessage, PropertyMessage};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
