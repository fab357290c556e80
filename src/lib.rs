//! cumulus is a publish/subscribe messaging system built around
//! subject/type pattern matching. Processes attach to a broker with a
//! [`client::Client`]; brokers federate into a "cloud" that behaves like
//! one logical broker, bridging subscriptions and one-shot gets between
//! members and failing clients over when their broker dies.

pub mod backoff;
pub mod error;
pub mod proto;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "broker")]
pub mod broker;

pub use error::{Error, Result};
pub use proto::Message;

#[cfg(feature = "client")]
pub use client::{Client, ClientConfig};

#[cfg(feature = "broker")]
pub use broker::{Broker, BrokerConfig};
