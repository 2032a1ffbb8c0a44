pub mod net;
pub mod protocol;
pub mod types;
