#![warn(missing_docs)]

//! Smart plug telemetry over MQTT for farmhand.
//!
//! This crate provides:
//! - A reconnecting MQTT bridge with a single shared broker session
//! - Per-plug topic subscriptions with dot-path payload extraction
//! - Power, energy and state snapshots with a reachability window
//!
//! # Example
//!
//! ```ignore
//! use farmhand_telemetry::{BridgeSettings, PlugSubscription, SmartPlugBridge};
//!
//! let bridge = SmartPlugBridge::new();
//! let ok = bridge
//!     .configure(BridgeSettings {
//!         enabled: true,
//!         broker: "broker.local".into(),
//!         ..Default::default()
//!     })
//!     .await;
//! if ok {
//!     let sub = PlugSubscription::new("tele/plug1/SENSOR")
//!         .with_power_path("ENERGY.Power")
//!         .with_energy_path("ENERGY.Total");
//!     bridge.subscribe(1, sub).await;
//!     println!("{:?}", bridge.snapshot(1));
//! }
//! ```

pub mod bridge;
pub mod fieldpath;
pub mod plug;
mod table;

pub use bridge::{BridgeOptions, BridgeSettings, ConnectionState, SmartPlugBridge};
pub use plug::{PlugSnapshot, PlugState, PlugSubscription};
