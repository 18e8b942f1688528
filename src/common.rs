//! These modules are shared among the client, server, and hub executables.
pub mod box_error;
pub mod config;
pub mod error;
pub mod packet;
pub mod stream_time_stat;
