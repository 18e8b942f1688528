//! session error taxonomy and the slot the hot path uses to report one.
//!
//! The audio callback and the network loops are not allowed to unwind or to
//! return errors across their thread boundary.  When something goes wrong out
//! there they park a [`SessionError`] in the shared [`ErrorSlot`] and the
//! supervisor picks it up and runs an orderly stop.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Everything that can end a session, in one place so the supervisor can
/// match on the cause and the binary can map it to an exit code.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// bit resolution / channel count / port out of range.  Fatal pre-start.
    ConfigInvalid(String),
    /// audio server down or port registration denied.  Fatal.
    AudioHostUnavailable(String),
    /// local UDP port already in use.  Fatal.
    BindFailed(u16),
    /// no handshake reply within the allotted time
    HandshakeTimeout,
    /// no packets from the peer while RUNNING
    PeerTimeout,
    /// peer told us it was going away.  An ordinary disconnect, not a fault.
    PeerStopped,
    /// peer header advertised parameters we cannot run with
    IncompatiblePeer(String),
    /// transient socket trouble that crossed the fatal threshold
    SocketError(String),
    /// the audio host shut down underneath us mid-run
    AudioHostShutdown(String),
}

impl SessionError {
    /// exit code for the operator binary
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::ConfigInvalid(_) => 1,
            SessionError::AudioHostUnavailable(_) => 2,
            SessionError::AudioHostShutdown(_) => 2,
            SessionError::PeerTimeout => 3,
            SessionError::HandshakeTimeout => 4,
            SessionError::IncompatiblePeer(_) => 4,
            _ => 1,
        }
    }
    /// peer disconnects are reported, not failed on
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SessionError::PeerStopped)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::ConfigInvalid(what) => write!(f, "invalid configuration: {}", what),
            SessionError::AudioHostUnavailable(why) => {
                write!(f, "audio host unavailable: {}", why)
            }
            SessionError::BindFailed(port) => write!(f, "could not bind local UDP port {}", port),
            SessionError::HandshakeTimeout => write!(f, "no handshake reply from peer"),
            SessionError::PeerTimeout => write!(f, "peer went silent"),
            SessionError::PeerStopped => write!(f, "peer stopped the session"),
            SessionError::IncompatiblePeer(what) => write!(f, "incompatible peer: {}", what),
            SessionError::SocketError(what) => write!(f, "socket error: {}", what),
            SessionError::AudioHostShutdown(why) => write!(f, "audio host shut down: {}", why),
        }
    }
}

impl std::error::Error for SessionError {}

/// One-deep mailbox between the real time threads and the supervisor.
///
/// `raise` never blocks a raiser that loses the race; the first error in
/// wins and later ones are dropped (the session is coming down anyway).
pub struct ErrorSlot {
    slot: Mutex<Option<SessionError>>,
    raised: AtomicBool,
}

impl ErrorSlot {
    pub fn new() -> ErrorSlot {
        ErrorSlot {
            slot: Mutex::new(None),
            raised: AtomicBool::new(false),
        }
    }
    /// park an error for the supervisor.  First caller wins.
    pub fn raise(&self, err: SessionError) -> () {
        if self.raised.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(err);
        }
    }
    /// cheap check usable from any thread
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
    /// supervisor side: take the error out, leaving the raised flag set
    pub fn take(&self) -> Option<SessionError> {
        if !self.is_raised() {
            return None;
        }
        match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        }
    }
}

impl Default for ErrorSlot {
    fn default() -> Self {
        Self::new()
    }
}
