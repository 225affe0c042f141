//! Async client for the Android Debug Bridge host protocol.
//!
//! [`adb::AdbServer`] talks to a running bridge server (starting one if needed), lists and
//! watches devices and hands out [`adb::device::AdbDevice`] handles for shell commands, log
//! streaming, file transfer and the rest. [`session::Session`] ties a server, its device
//! watcher and a [`registry::DeviceRegistry`] together.

pub mod adb;
pub mod error;
pub mod logging;
pub mod models;
pub mod registry;
pub mod session;
pub mod settings;
pub mod storage;
pub mod utils;

pub use adb::{AdbServer, device::AdbDevice, watcher::DeviceWatcher};
pub use error::{BridgeError, ErrorKind, Result};
