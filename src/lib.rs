pub mod bus;
pub mod config;
pub mod dlna;
pub mod error;
pub mod tasks;
