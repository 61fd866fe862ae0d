pub mod queue;
pub mod sweeper;
