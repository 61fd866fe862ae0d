pub mod app;
pub mod build;
pub mod deploy;
pub mod result;
pub mod stage;

/// Jobs are addressed by UUID everywhere
pub type JobId = uuid::Uuid;
