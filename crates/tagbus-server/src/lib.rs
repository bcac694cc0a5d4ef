//! # tagbus-server
//!
//! The tag bus service: driver registry, subscription fan-out, named calls,
//! the bus event loop and its WebSocket transport.
//!
//! Enable features based on target platform:
//! - `tokio-runtime` (default) - WebSocket transport for Linux/desktop

pub mod bus;
pub mod client;
pub mod registry;
pub mod rpc;
#[cfg(feature = "tokio-runtime")]
pub mod server;
pub mod subscription;

pub use bus::{Bus, BusCommand, BusHandle, BusState};
pub use client::LocalClient;
pub use registry::{started_tag_id, DriverCatalog, DriverFactory, DriverRegistry};
pub use rpc::{RpcFn, RpcTable};
#[cfg(feature = "tokio-runtime")]
pub use server::{ServerConfig, ServerError, TagBusServer};
pub use subscription::{Delivery, SubscriptionHub, TagCallback};

pub use tagbus_core::{ProjectConfig, TagChanged};
pub use tagbus_protocol::AppCallResult;
