//! All session-level errors.

use std::{collections::HashMap, error::Error, fmt::Debug};

/// Why a listed peer was not ready when the client tried to start
/// downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerNotReadyCause {
    /// The connection is no longer in the session.
    ConnectionGone,
    /// The peer's machine left the contract-preparation state.
    NotInPreparingContract,
    /// The peer re-announced terms after the client committed.
    TermsExpired,
}

/// Enum to handle session-level errors.
///
/// Mode and state transition errors are reported atomically: when a call
/// returns one of these, no observable session state was changed.
#[derive(Debug)]
pub enum SessionError<Id> {
    /// Operation illegal in the current session state.
    StateIncompatibleOperation(&'static str),
    /// Operation does not apply to the current session mode.
    ModeIncompatibleOperation(&'static str),
    /// No connection with the given id.
    ConnectionDoesNotExist(Id),
    /// A connection with the given id already exists.
    ConnectionAlreadyExists(Id),
    /// startDownloading was called after the buying state moved on.
    NoLongerSendingInvitations,
    /// One or more committed peers were not ready; per-peer causes.
    PeersNotAllReadyToStartDownload(HashMap<Id, PeerNotReadyCause>),
}

impl<Id: Debug> std::fmt::Display for SessionError<Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl<Id: Debug> Error for SessionError<Id> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}
