//! Point-in-time status snapshots of the session and its parts.

use std::time::Duration;

use crate::{
    channel::{Payee, Payor},
    machine::AnnouncedModeAndTerms,
    protocol::messages::{BuyerTerms, SellerTerms},
};

use super::{piece::PieceState, BuyingState, SessionMode, SessionState};

/// Status of one connection.
#[derive(Debug, Clone)]
pub struct Connection<Id> {
    pub id: Id,
    /// Name of the innermost active machine state.
    pub state_name: &'static str,
    pub announced_mode_and_terms_from_peer: AnnouncedModeAndTerms,
    /// Buyer side of the channel, while downloading.
    pub payor: Option<Payor>,
    /// Seller side of the channel, once the contract is prepared.
    pub payee: Option<Payee>,
    /// Time the peer took to deliver the test payload.
    pub speed_test_latency: Option<Duration>,
}

/// Status of one piece.
#[derive(Debug, Clone)]
pub struct Piece<Id> {
    pub index: u32,
    pub size: u32,
    pub state: PieceState<Id>,
}

/// Status of one seller.
#[derive(Debug, Clone)]
pub struct Seller<Id> {
    pub connection: Id,
}

/// Status of the buying mode.
#[derive(Debug, Clone)]
pub struct Buying<Id> {
    pub state: BuyingState,
    pub terms: BuyerTerms,
    /// Sellers that are still around.
    pub sellers: Vec<Seller<Id>>,
    pub pieces: Vec<Piece<Id>>,
    pub number_of_missing_pieces: u32,
}

/// Status of the selling mode.
#[derive(Debug, Clone)]
pub struct Selling {
    pub terms: SellerTerms,
    pub max_piece_index: u32,
}

/// Status of the whole session.
#[derive(Debug, Clone)]
pub struct Session<Id> {
    /// `None` until one of the mode transitions has been made.
    pub mode: Option<SessionMode>,
    pub state: SessionState,
    pub connections: Vec<Connection<Id>>,
    pub buying: Option<Buying<Id>>,
    pub selling: Option<Selling>,
}

impl<Id: Copy + PartialEq> Session<Id> {
    /// Convenience lookup by connection id.
    pub fn connection(&self, id: Id) -> Option<&Connection<Id>> {
        self.connections.iter().find(|c| c.id == id)
    }
}
