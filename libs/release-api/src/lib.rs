//! Release engine API models
//!
//! Shared by the engine's HTTP server and any client following job progress.

pub mod models;
