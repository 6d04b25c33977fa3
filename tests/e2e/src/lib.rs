//! End-to-end test harness for the gateway data publisher
//!
//! Starts a real [`DataPublisher`](data_publisher::DataPublisher) on a loopback
//! port and drives it with [`TestSubscriber`], a minimal subscriber speaking
//! the command channel protocol over TCP.

pub mod client;
pub mod fixtures;

pub use client::TestSubscriber;
pub use fixtures::*;
