//! Connectivity core for COSMIC Connect: LAN discovery, mutually-pinned
//! TLS link transport, a device-level pairing state machine, and a plugin
//! router that hands typed packets to feature implementations living
//! outside this crate.
//!
//! This crate does not parse or act on plugin packet bodies (§1
//! Non-goals: ping/clipboard/file-transfer/etc. *behavior* is out of
//! scope); it provides the transport, trust, and routing substrate those
//! features are built on, the same way the teacher's `src-tauri/src/runtime/lan` module
//! underpins its (single, built-in) clipboard-sync feature.

pub mod config;
pub mod context;
pub mod device;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod link;
pub mod logging;
pub mod observer;
pub mod packet;
pub mod payload;
pub mod plugin;
pub mod provider;
pub mod registry;
pub mod tls;

pub use config::CoreConfig;
pub use context::CoreContext;
pub use device::{Device, PairState};
pub use error::{CoreError, CoreResult};
pub use identity::IdentityStore;
pub use observer::Observer;
pub use packet::{DeviceInfo, DeviceType, Packet};
pub use plugin::{PacketSender, Plugin, PluginDescriptor, PluginFactory, PluginRegistry};
pub use registry::DeviceRegistry;
