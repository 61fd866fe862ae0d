pub mod completion;
pub mod controller;
pub mod definition;
pub mod flow;
