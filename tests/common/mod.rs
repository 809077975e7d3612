//! Shared infrastructure for the integration tests: an in-process
//! bouncer, a scripted IRC client, and a fake upstream server.

#![allow(dead_code)]

pub mod client;
pub mod server;
pub mod upstream;

pub use client::TestClient;
pub use server::TestServer;
pub use upstream::FakeUpstream;
