pub mod build_server;
pub mod cluster;
pub mod http;
pub mod registry;
pub mod remote;
