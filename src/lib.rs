//! jacktrip_rust - uncompressed multichannel audio streaming over IP
//!
//! provides the pieces to run a two peer audio link (client or server) and a
//! hub server that multiplexes several peers through one audio device.  Audio
//! is never compressed; packets carry raw PCM quantized to the wire bit depth
//! and the whole thing lives or dies on network speed.

pub mod common;
pub mod dsp;
pub mod hub;
pub mod net;
pub mod session;
pub mod sound;
pub mod utils;
