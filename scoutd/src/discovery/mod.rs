pub mod active_set;
pub mod engine;
