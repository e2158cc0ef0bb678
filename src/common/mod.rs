pub mod aligned;
pub mod config;
pub mod exception;
pub mod logger;
pub mod thread;
pub mod util;
