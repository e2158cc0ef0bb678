pub mod fixtures;
pub mod logger;
pub mod macros;
