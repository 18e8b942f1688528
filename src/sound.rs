//! components that touch audio: the engine, the jitter ring between the
//! network threads and the audio callback, the wire codec, the plugin chain,
//! and the jack host driver.
pub mod codec;
pub mod engine;
pub mod jack_thread;
pub mod plugin;
pub mod ring;
