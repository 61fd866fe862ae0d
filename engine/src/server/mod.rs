pub mod handlers;
pub mod progress_ws;
pub mod serve;
pub mod state;
