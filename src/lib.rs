pub mod blk;
pub mod cli;
pub mod common;
