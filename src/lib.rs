//! tetherd, a persistent IRC bouncer.
//!
//! The daemon keeps one upstream IRC connection per (user, network)
//! alive while downstream clients attach and detach at will. The crate
//! is a library so the integration tests can drive a full in-process
//! server; the `tetherd` binary is a thin wrapper around [`server`].

pub mod auth;
pub mod config;
pub mod db;
pub mod downstream;
pub mod error;
pub mod hub;
pub mod network;
pub mod server;
pub mod service;
pub mod upstream;
