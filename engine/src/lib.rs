//! Release Engine Library
//!
//! Drives CI builds on an external build server and rolls artifacts out to Kubernetes
//! clusters or remote hosts, streaming per-stage progress to subscribers.

pub mod adapters;
pub mod app;
pub mod build;
pub mod cache;
pub mod client;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod fsm;
pub mod logs;
pub mod models;
pub mod notify;
pub mod poll;
pub mod progress;
pub mod server;
pub mod service;
pub mod storage;
pub mod utils;
pub mod workers;
