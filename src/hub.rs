//! the hub: one control port, many peers, one audio device
pub mod listener;
pub mod patcher;
pub mod worker;
