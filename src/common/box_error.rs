//! boxed error type used everywhere a thread boundary is involved.
//!
//! The Send + Sync bounds let error values move into the sender/receiver
//! threads and back out through join handles.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
