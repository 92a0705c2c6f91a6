//! Buying mode: invitations, contract formation, piece assignment,
//! arrival/validation and the payment flow.

use std::collections::HashMap;
use std::time::Duration;

use bitcoin::{Amount, OutPoint, PubkeyHash, Transaction};

use crate::{
    channel::KeyPair,
    machine::{AnnouncedModeAndTerms, Input, Notification},
    protocol::messages::{BuyerTerms, PieceData, SellerTerms},
};

use super::{
    callbacks::BuyingCallbacks,
    error::{PeerNotReadyCause, SessionError},
    piece::{Piece, PieceInformation, PieceState},
    seller::Seller,
    BuyingState, Ctx, DisconnectCause, SessionState,
};

/// Most piece requests in flight per seller before waiting for arrivals.
pub const MAX_CONCURRENT_REQUESTS: usize = 4;

/// Everything the client commits to one seller when handing over the
/// signed funding transaction.
#[derive(Debug, Clone, Copy)]
pub struct StartDownloadInformation {
    /// Index of this seller's commitment output in the funding transaction.
    pub output_index: u32,
    /// Buyer channel key pair for this commitment.
    pub buyer_contract_keypair: KeyPair,
    /// Hash refunded settlement funds are paid to.
    pub buyer_final_pk_hash: PubkeyHash,
    /// Channel value locked in the commitment.
    pub value: Amount,
    /// Seller terms the client committed against.
    pub seller_terms: SellerTerms,
}

pub(crate) struct Buying<Id> {
    callbacks: BuyingCallbacks<Id>,
    state: BuyingState,
    terms: BuyerTerms,
    sellers: HashMap<Id, Seller<Id>>,
    pieces: Vec<Piece<Id>>,
    // drives completion detection
    number_of_missing_pieces: u32,
    max_time_to_service_piece: Duration,
}

impl<Id: super::ConnectionId> Buying<Id> {
    pub(crate) fn new(
        terms: BuyerTerms,
        piece_information: &[PieceInformation],
        callbacks: BuyingCallbacks<Id>,
        max_time_to_service_piece: Duration,
    ) -> Buying<Id> {
        let pieces: Vec<Piece<Id>> = piece_information
            .iter()
            .enumerate()
            .map(|(index, information)| Piece::new(index as u32, information))
            .collect();
        let number_of_missing_pieces = piece_information
            .iter()
            .filter(|information| !information.downloaded)
            .count() as u32;
        Buying {
            callbacks,
            state: BuyingState::SendingInvitations,
            terms,
            sellers: HashMap::new(),
            pieces,
            number_of_missing_pieces,
            max_time_to_service_piece,
        }
    }

    pub(crate) fn terms(&self) -> BuyerTerms {
        self.terms
    }

    pub(crate) fn state(&self) -> BuyingState {
        self.state
    }

    /// Dispatches one machine notification. Returns false when the
    /// connection was dropped as a side effect, in which case the caller
    /// must not touch it again.
    pub(crate) fn handle(
        &mut self,
        ctx: &mut Ctx<Id>,
        id: Id,
        notification: Notification,
    ) -> bool {
        match notification {
            Notification::PeerAnnouncedModeAndTerms(announced) => {
                self.peer_announced(ctx, id, announced);
                true
            }
            Notification::SellerJoined => {
                log::debug!("connection {:?}: seller joined the contract", id);
                true
            }
            Notification::SellerInterruptedContract => {
                self.remove_connection(ctx, id, DisconnectCause::SellerHasInterruptedContract);
                false
            }
            Notification::SellerCompletedSpeedTest {
                delivered_expected_payload,
            } => self.seller_completed_speed_test(ctx, id, delivered_expected_payload),
            Notification::ReceivedFullPiece(piece_data) => {
                self.received_full_piece(ctx, id, piece_data)
            }
            Notification::MessageOverflow(received) => {
                log::error!(
                    "connection {:?}: unexpected {} from seller",
                    id,
                    received
                );
                self.remove_connection(ctx, id, DisconnectCause::SellerMessageOverflow);
                false
            }
            other => {
                log::warn!(
                    "connection {:?}: ignoring notification {:?} in buy mode",
                    id,
                    other
                );
                true
            }
        }
    }

    fn peer_announced(&mut self, ctx: &mut Ctx<Id>, id: Id, announced: AnnouncedModeAndTerms) {
        log::debug!("connection {:?} announced {:?}", id, announced);
        if ctx.session_state == SessionState::Started
            && self.state == BuyingState::SendingInvitations
        {
            self.maybe_invite_seller(ctx, id);
        }
    }

    /// Invites the peer when it sells under acceptable terms; runs the
    /// speed test first when the policy asks for one.
    fn maybe_invite_seller(&mut self, ctx: &mut Ctx<Id>, id: Id) {
        debug_assert!(ctx.session_state == SessionState::Started);
        debug_assert!(self.state == BuyingState::SendingInvitations);

        let connection = match ctx.connections.get_mut(&id) {
            Some(connection) => connection,
            None => return,
        };
        let seller_terms = match connection.machine.announced_mode_and_terms_from_peer() {
            AnnouncedModeAndTerms::Sell(terms) => terms,
            _ => return,
        };
        if !self.terms.satisfied_by(&seller_terms) {
            return;
        }

        if ctx.policy.is_enabled() && !connection.has_completed_speed_test() {
            if connection.started_speed_test_at.is_some() {
                // test already in flight
                return;
            }
            connection.starting_speed_test(ctx.now);
            connection.process(Input::TestSellerSpeed {
                payload_size: ctx.policy.payload_size(),
            });
            log::debug!("connection {:?}: speed test requested", id);
            return;
        }

        connection.process(Input::InviteSeller);
        log::info!("connection {:?}: seller invited", id);
    }

    fn seller_completed_speed_test(&mut self, ctx: &mut Ctx<Id>, id: Id, delivered: bool) -> bool {
        if !delivered {
            log::info!("connection {:?}: speed test payload did not check out", id);
            self.remove_connection(ctx, id, DisconnectCause::SellerFailedSpeedTest);
            return false;
        }
        let latency = match ctx.connections.get_mut(&id) {
            Some(connection) => {
                connection.completed_speed_test(ctx.now);
                connection.speed_test_duration()
            }
            None => return false,
        };
        if ctx.policy.disconnect_if_slow() {
            if let Some(latency) = latency {
                if latency > ctx.policy.max_time_to_respond() {
                    log::info!(
                        "connection {:?}: speed test took {:?}, too slow",
                        id,
                        latency
                    );
                    self.remove_connection(ctx, id, DisconnectCause::SellerFailedSpeedTest);
                    return false;
                }
            }
        }
        log::debug!("connection {:?}: speed test passed", id);
        if ctx.session_state == SessionState::Started
            && self.state == BuyingState::SendingInvitations
        {
            self.maybe_invite_seller(ctx, id);
        }
        true
    }

    /// Hands the signed funding transaction over and starts downloading.
    /// Fails atomically: on any error no observable state has changed.
    pub(crate) fn start_downloading(
        &mut self,
        ctx: &mut Ctx<Id>,
        contract_tx: &Transaction,
        downloads: HashMap<Id, StartDownloadInformation>,
    ) -> Result<(), SessionError<Id>> {
        if self.state != BuyingState::SendingInvitations {
            return Err(SessionError::NoLongerSendingInvitations);
        }
        debug_assert!(self.sellers.is_empty());

        let mut peers_not_ready = HashMap::new();
        for (id, information) in &downloads {
            match ctx.connections.get(id) {
                None => {
                    peers_not_ready.insert(*id, PeerNotReadyCause::ConnectionGone);
                }
                Some(connection) => {
                    if !connection.machine.in_preparing_contract() {
                        peers_not_ready.insert(*id, PeerNotReadyCause::NotInPreparingContract);
                    } else if connection.machine.announced_mode_and_terms_from_peer().sell_terms()
                        != Some(information.seller_terms)
                    {
                        peers_not_ready.insert(*id, PeerNotReadyCause::TermsExpired);
                    }
                }
            }
        }
        if !peers_not_ready.is_empty() {
            log::warn!(
                "{} peer(s) in bad state, contract cannot be announced",
                peers_not_ready.len()
            );
            return Err(SessionError::PeersNotAllReadyToStartDownload(peers_not_ready));
        }

        let txid = contract_tx.compute_txid();

        // has to move before pieces are assigned to sellers
        self.state = BuyingState::Downloading;

        for (id, information) in &downloads {
            self.sellers.insert(*id, Seller::new(*id));
            if let Some(connection) = ctx.connections.get_mut(id) {
                connection.process(Input::ContractPrepared {
                    anchor: OutPoint::new(txid, information.output_index),
                    contract_keypair: information.buyer_contract_keypair,
                    final_pk_hash: information.buyer_final_pk_hash,
                    value: information.value,
                });
            }
            log::info!("connection {:?}: contract announced", id);
        }
        for id in downloads.keys() {
            self.try_to_assign_and_request_pieces(ctx, *id);
        }
        log::info!("started downloading with {} seller(s)", downloads.len());
        Ok(())
    }

    /// Fills the seller's request window from the unassigned pieces.
    fn try_to_assign_and_request_pieces(&mut self, ctx: &mut Ctx<Id>, id: Id) -> u32 {
        if ctx.session_state != SessionState::Started || self.state != BuyingState::Downloading {
            return 0;
        }
        let mut total_new_requests = 0;
        loop {
            match self.sellers.get(&id) {
                Some(seller)
                    if !seller.is_gone()
                        && seller.pieces_awaiting_arrival().len() < MAX_CONCURRENT_REQUESTS => {}
                _ => break,
            }
            let picked = match (self.callbacks.pick_next_piece)(&self.pieces) {
                Some(picked) => picked,
                None => break,
            };
            if picked >= self.pieces.len()
                || !matches!(self.pieces[picked].state(), PieceState::Unassigned)
            {
                log::error!("piece picker returned an unusable piece, stopping assignment");
                break;
            }
            let index = self.pieces[picked].index();
            self.pieces[picked].assigned(id);
            if let Some(seller) = self.sellers.get_mut(&id) {
                seller.piece_requested(index, ctx.now);
            }
            if let Some(connection) = ctx.connections.get_mut(&id) {
                connection.process(Input::RequestPiece(index));
            }
            total_new_requests += 1;
        }
        total_new_requests
    }

    fn received_full_piece(&mut self, ctx: &mut Ctx<Id>, id: Id, piece_data: PieceData) -> bool {
        debug_assert!(ctx.session_state != SessionState::Stopped);
        // a slower seller may still deliver after completion; it gets paid
        if !matches!(
            self.state,
            BuyingState::Downloading | BuyingState::DownloadCompleted
        ) {
            log::error!("connection {:?}: full piece outside downloading", id);
            self.remove_connection(ctx, id, DisconnectCause::SellerMessageOverflow);
            return false;
        }
        let index = match self.sellers.get_mut(&id) {
            Some(seller) if !seller.is_gone() => seller.full_piece_arrived(ctx.now),
            _ => {
                log::error!("connection {:?}: full piece from a non-seller", id);
                self.remove_connection(ctx, id, DisconnectCause::SellerMessageOverflow);
                return false;
            }
        };
        self.pieces[index as usize].arrived();

        // client validates synchronously
        let was_valid = (self.callbacks.full_piece_arrived)(id, &piece_data, index);
        if was_valid {
            self.valid_piece_received(ctx, id, index);
            true
        } else {
            self.invalid_piece_received(ctx, id, index);
            false
        }
    }

    fn valid_piece_received(&mut self, ctx: &mut Ctx<Id>, id: Id, index: u32) {
        if let Some(seller) = self.sellers.get_mut(&id) {
            seller.piece_was_valid();
        }
        let payment = ctx.connections.get_mut(&id).and_then(|connection| {
            connection.process(Input::SendPayment);
            connection.machine.payor().map(|payor| {
                (
                    payor.price(),
                    payor.number_of_payments_made(),
                    payor.amount_paid(),
                )
            })
        });
        if let Some((price, payments_made, amount_paid)) = payment {
            (self.callbacks.sent_payment)(id, price, payments_made, amount_paid, index);
        }
        self.mark_piece_downloaded(index);
        self.try_to_assign_and_request_pieces(ctx, id);
    }

    fn invalid_piece_received(&mut self, ctx: &mut Ctx<Id>, id: Id, index: u32) {
        log::warn!("connection {:?}: piece {} failed validation", id, index);
        if let Some(seller) = self.sellers.get_mut(&id) {
            seller.piece_was_invalid();
        }
        self.remove_connection(ctx, id, DisconnectCause::SellerSentInvalidPiece);
    }

    fn mark_piece_downloaded(&mut self, index: u32) {
        let piece = &mut self.pieces[index as usize];
        if !matches!(piece.state(), PieceState::Downloaded) {
            piece.downloaded();
            self.number_of_missing_pieces -= 1;
            if self.number_of_missing_pieces == 0 {
                self.state = BuyingState::DownloadCompleted;
                log::info!("download completed");
            }
        }
    }

    /// Piece completed through an out-of-band source.
    pub(crate) fn piece_downloaded(&mut self, index: u32) -> Result<(), SessionError<Id>> {
        if index as usize >= self.pieces.len() {
            return Err(SessionError::StateIncompatibleOperation(
                "piece index out of range",
            ));
        }
        // a seller may be mid-delivery of this very piece; its delivery
        // will still be paid for when it arrives
        self.mark_piece_downloaded(index);
        Ok(())
    }

    /// Removes the connection, unassigns its pieces, notifies the client,
    /// and restarts invitations when this was the last seller.
    pub(crate) fn remove_connection(&mut self, ctx: &mut Ctx<Id>, id: Id, cause: DisconnectCause) {
        self.destroy_connection(ctx, id, cause);
        if ctx.session_state == SessionState::Started && self.state == BuyingState::Downloading {
            self.reset_if_all_sellers_gone(ctx);
        }
    }

    fn destroy_connection(&mut self, ctx: &mut Ctx<Id>, id: Id, cause: DisconnectCause) {
        if let Some(seller) = self.sellers.get_mut(&id) {
            // the record may already be gone from a previous removal of
            // the same peer
            if !seller.is_gone() {
                for piece in self.pieces.iter_mut() {
                    if piece.assigned_to() == Some(id) {
                        piece.deassign();
                    }
                }
                seller.removed();
            }
        }
        ctx.connections.remove(&id);
        log::info!("connection {:?} removed: {:?}", id, cause);
        (self.callbacks.removed_connection)(id, cause);
    }

    fn reset_if_all_sellers_gone(&mut self, ctx: &mut Ctx<Id>) {
        debug_assert!(self.state == BuyingState::Downloading);
        debug_assert!(ctx.session_state == SessionState::Started);
        if self.sellers.values().any(|seller| !seller.is_gone()) {
            return;
        }
        log::info!("all sellers are gone, inviting again");
        (self.callbacks.all_sellers_gone)();
        self.state = BuyingState::SendingInvitations;
        self.sellers.clear();
        self.send_invitations(ctx);
    }

    fn send_invitations(&mut self, ctx: &mut Ctx<Id>) {
        debug_assert!(ctx.session_state == SessionState::Started);
        debug_assert!(self.state == BuyingState::SendingInvitations);
        let ids: Vec<Id> = ctx.connections.keys().copied().collect();
        for id in ids {
            self.maybe_invite_seller(ctx, id);
        }
    }

    /// Pay every seller for work it may have done that we will never see
    /// validated. The receiver may reject payments for pieces it never
    /// delivered, but it is worth trying. Safe to run twice: it drains
    /// counters and short-circuits once they are zero.
    fn polite_seller_compensation(&mut self, ctx: &mut Ctx<Id>) {
        let owed: Vec<Id> = self
            .sellers
            .iter()
            .filter(|(_, seller)| !seller.is_gone() && seller.is_possibly_owed_payment())
            .map(|(id, _)| *id)
            .collect();
        for id in owed {
            let payments = {
                let seller = match self.sellers.get_mut(&id) {
                    Some(seller) => seller,
                    None => continue,
                };
                while !seller.pieces_awaiting_arrival().is_empty() {
                    seller.full_piece_arrived(ctx.now);
                }
                let mut payments = 0;
                while seller.number_of_pieces_awaiting_validation() > 0 {
                    seller.piece_was_valid();
                    payments += 1;
                }
                payments
            };
            if let Some(connection) = ctx.connections.get_mut(&id) {
                for _ in 0..payments {
                    connection.process(Input::SendPayment);
                }
            }
        }
    }

    pub(crate) fn update_terms(&mut self, ctx: &mut Ctx<Id>, terms: BuyerTerms) {
        if self.state == BuyingState::Downloading {
            self.polite_seller_compensation(ctx);
        }
        let ids: Vec<Id> = ctx.connections.keys().copied().collect();
        for id in ids {
            if let Some(connection) = ctx.connections.get_mut(&id) {
                connection.process(Input::UpdateBuyerTerms(terms));
            }
        }
        self.terms = terms;
        if self.state != BuyingState::DownloadCompleted {
            self.state = BuyingState::SendingInvitations;
            self.discard_sellers();
            if ctx.session_state == SessionState::Started {
                self.send_invitations(ctx);
            }
        }
    }

    fn discard_sellers(&mut self) {
        // any assigned piece belongs to a seller that is being dropped
        for piece in self.pieces.iter_mut() {
            piece.deassign();
        }
        self.sellers.clear();
    }

    /// Session just moved to started.
    pub(crate) fn started(&mut self, ctx: &mut Ctx<Id>) {
        if self.state == BuyingState::SendingInvitations {
            self.send_invitations(ctx);
        }
    }

    pub(crate) fn stop(&mut self, ctx: &mut Ctx<Id>) {
        self.polite_seller_compensation(ctx);
        self.discard_sellers();
        let ids: Vec<Id> = ctx.connections.keys().copied().collect();
        for id in ids {
            self.destroy_connection(ctx, id, DisconnectCause::Client);
        }
        // an interrupted download starts over with invitations
        if self.state == BuyingState::Downloading {
            self.state = BuyingState::SendingInvitations;
        }
    }

    /// The mode is being replaced; settle debts first.
    pub(crate) fn leaving(&mut self, ctx: &mut Ctx<Id>) {
        self.polite_seller_compensation(ctx);
    }

    pub(crate) fn tick(&mut self, ctx: &mut Ctx<Id>) {
        if ctx.session_state != SessionState::Started {
            return;
        }
        // a pending speed test that outlived the response budget
        if ctx.policy.is_enabled() && ctx.policy.disconnect_if_slow() {
            let stale: Vec<Id> = ctx
                .connections
                .values()
                .filter(|connection| match (
                    connection.started_speed_test_at,
                    connection.completed_speed_test_at,
                ) {
                    (Some(started), None) => {
                        ctx.now.duration_since(started) > ctx.policy.max_time_to_respond()
                    }
                    _ => false,
                })
                .map(|connection| connection.id)
                .collect();
            for id in stale {
                log::info!("connection {:?}: speed test timed out", id);
                self.remove_connection(ctx, id, DisconnectCause::SellerFailedSpeedTest);
            }
        }
        if self.state == BuyingState::Downloading {
            let ids: Vec<Id> = self
                .sellers
                .iter()
                .filter(|(_, seller)| !seller.is_gone())
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                let (timed_out, idle) = match self.sellers.get(&id) {
                    Some(seller) if !seller.is_gone() => (
                        seller
                            .servicing_piece_has_timed_out(self.max_time_to_service_piece, ctx.now),
                        seller.pieces_awaiting_arrival().is_empty(),
                    ),
                    _ => continue,
                };
                if timed_out {
                    self.remove_connection(
                        ctx,
                        id,
                        DisconnectCause::SellerServicingPieceHasTimedOut,
                    );
                    continue;
                }
                if idle {
                    // a seller can go idle when its last delivery found no
                    // unassigned piece; pieces free up again on timeouts,
                    // terms updates and invalid deliveries
                    self.try_to_assign_and_request_pieces(ctx, id);
                }
            }
            if self.state == BuyingState::Downloading {
                self.reset_if_all_sellers_gone(ctx);
            }
        }
    }

    pub(crate) fn status(&self) -> super::status::Buying<Id> {
        super::status::Buying {
            state: self.state,
            terms: self.terms,
            sellers: self
                .sellers
                .values()
                .filter(|seller| !seller.is_gone())
                .map(|seller| super::status::Seller {
                    connection: seller.id(),
                })
                .collect(),
            pieces: self
                .pieces
                .iter()
                .map(|piece| super::status::Piece {
                    index: piece.index(),
                    size: piece.size(),
                    state: piece.state(),
                })
                .collect(),
            number_of_missing_pieces: self.number_of_missing_pieces,
        }
    }
}
