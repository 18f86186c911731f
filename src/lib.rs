pub mod config;
pub mod coordinator;
pub mod errors;
pub mod logging;
pub mod operator;
pub mod server;
pub mod tasks;

pub use shipwright_common as common;
