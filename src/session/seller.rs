//! Buyer-side record of a seller under contract.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Window a seller is always granted after servicing starts before any
/// timeout applies.
pub(crate) const SERVICING_GRACE: Duration = Duration::from_secs(10);

/// Tracks what the buyer expects from one seller: the pieces requested and
/// not yet arrived (in request order) and the count of arrived pieces the
/// client is still validating. A removed seller stays in the map as an
/// inert `gone` record, since the same peer may reconnect under the same
/// connection id.
#[derive(Debug)]
pub(crate) struct Seller<Id> {
    id: Id,
    gone: bool,
    pieces_awaiting_arrival: VecDeque<u32>,
    number_of_pieces_awaiting_validation: u32,
    // The earliest time the front piece is expected: set when servicing
    // starts, refreshed on each arrival. Drives the servicing timeout.
    front_piece_expected_at: Option<Instant>,
    servicing_started_at: Option<Instant>,
}

impl<Id: Copy> Seller<Id> {
    pub(crate) fn new(id: Id) -> Seller<Id> {
        Seller {
            id,
            gone: false,
            pieces_awaiting_arrival: VecDeque::new(),
            number_of_pieces_awaiting_validation: 0,
            front_piece_expected_at: None,
            servicing_started_at: None,
        }
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.gone
    }

    /// Appends a request; returns the number of pieces awaiting arrival so
    /// the caller can decide whether to request more.
    pub(crate) fn piece_requested(&mut self, index: u32, now: Instant) -> usize {
        assert!(!self.gone, "cannot request pieces from a removed seller");
        if self.pieces_awaiting_arrival.is_empty() {
            self.front_piece_expected_at = Some(now);
            self.servicing_started_at = Some(now);
        }
        self.pieces_awaiting_arrival.push_back(index);
        self.pieces_awaiting_arrival.len()
    }

    /// The front piece arrived and moves to validation; returns its index.
    /// Pieces arrive in the order they were requested.
    pub(crate) fn full_piece_arrived(&mut self, now: Instant) -> u32 {
        assert!(!self.gone);
        let index = self
            .pieces_awaiting_arrival
            .pop_front()
            .expect("piece arrived with empty request queue");
        self.number_of_pieces_awaiting_validation += 1;
        if !self.pieces_awaiting_arrival.is_empty() {
            self.front_piece_expected_at = Some(now);
        }
        index
    }

    pub(crate) fn piece_was_valid(&mut self) {
        assert!(!self.gone);
        assert!(
            self.number_of_pieces_awaiting_validation > 0,
            "seller is not expecting a piece validation result"
        );
        self.number_of_pieces_awaiting_validation -= 1;
    }

    pub(crate) fn piece_was_invalid(&mut self) {
        assert!(!self.gone);
        assert!(
            self.number_of_pieces_awaiting_validation > 0,
            "seller is not expecting a piece validation result"
        );
        self.number_of_pieces_awaiting_validation -= 1;
    }

    /// Marks the seller gone and clears its queues; the record stays inert.
    pub(crate) fn removed(&mut self) {
        self.gone = true;
        self.pieces_awaiting_arrival.clear();
        self.number_of_pieces_awaiting_validation = 0;
    }

    /// Whether any piece is in flight or still being validated.
    pub(crate) fn is_possibly_owed_payment(&self) -> bool {
        !self.pieces_awaiting_arrival.is_empty() || self.number_of_pieces_awaiting_validation > 0
    }

    pub(crate) fn pieces_awaiting_arrival(&self) -> &VecDeque<u32> {
        &self.pieces_awaiting_arrival
    }

    pub(crate) fn number_of_pieces_awaiting_validation(&self) -> u32 {
        self.number_of_pieces_awaiting_validation
    }

    /// Whether servicing the front piece has exceeded the limit. The grace
    /// window shields a seller that only just started servicing.
    pub(crate) fn servicing_piece_has_timed_out(&self, limit: Duration, now: Instant) -> bool {
        if self.pieces_awaiting_arrival.is_empty() {
            return false;
        }
        let servicing_started_at = match self.servicing_started_at {
            Some(t) => t,
            None => return false,
        };
        if now.duration_since(servicing_started_at) < SERVICING_GRACE {
            return false;
        }
        match self.front_piece_expected_at {
            Some(front) => now.duration_since(front) > limit,
            None => false,
        }
    }
}
