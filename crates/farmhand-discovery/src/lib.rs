#![warn(missing_docs)]

//! SSDP discovery of Bambu Lab printers on the local network.
//!
//! This crate provides:
//! - Background discovery sessions with a bounded window ([`DiscoveryEngine`])
//! - One-shot scans ([`discover`], [`discover_with`])
//! - Parsing of the vendor's SSDP response headers
//!
//! # Example
//!
//! ```ignore
//! use farmhand_discovery::{DiscoveryEngine, DEFAULT_DISCOVERY_WINDOW};
//!
//! let engine = DiscoveryEngine::new();
//! engine.start(DEFAULT_DISCOVERY_WINDOW).await;
//!
//! // ... let the scan run ...
//!
//! for printer in engine.printers() {
//!     println!("{} ({}) at {}", printer.name, printer.serial, printer.ip_address);
//! }
//! engine.stop().await;
//! ```

pub mod engine;
pub mod error;
pub mod ssdp;

pub use engine::{
    discover, discover_with, DiscoveryConfig, DiscoveryEngine, DEFAULT_DISCOVERY_WINDOW,
};
pub use error::{DiscoveryError, Result};
pub use ssdp::DiscoveredPrinter;
