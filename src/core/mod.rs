pub mod atomic;
pub mod config;
pub mod isolation;
pub mod monitor;
pub mod patch;
pub mod process;
pub mod sandbox;
pub mod terminal;
pub mod worker;
