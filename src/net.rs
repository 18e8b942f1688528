//! network side of a session: the socket helpers, the two I/O loops,
//! and the port negotiation handshake.
pub mod data_protocol;
pub mod handshake;
pub mod sock_with_tos;
