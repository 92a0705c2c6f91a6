//! Selling mode: contract handshake, pipeline-driven piece delivery,
//! payment intake and settlement claims.

use bitcoin::Amount;

use crate::{
    machine::{Input, Notification},
    protocol::messages::{PieceData, SellerTerms},
};

use super::{
    callbacks::SellingCallbacks, connection::Connection, pipeline::PieceDeliveryPipeline, Ctx,
    DisconnectCause, SessionState,
};

/// Most pieces delivered but not yet paid for before delivery defers.
/// Requests are still accepted and honored once pending payments arrive.
pub const MAX_OUTSTANDING_PAYMENTS: usize = 4;

/// Most pieces loaded ahead of the unpaid window, so resources are not
/// wasted on a buyer that disappears.
pub const MAX_PIECES_TO_PRELOAD: usize = 2;

pub(crate) struct Selling<Id> {
    callbacks: SellingCallbacks<Id>,
    terms: SellerTerms,
    max_piece_index: u32,
}

impl<Id: super::ConnectionId> Selling<Id> {
    pub(crate) fn new(
        terms: SellerTerms,
        max_piece_index: u32,
        callbacks: SellingCallbacks<Id>,
    ) -> Selling<Id> {
        Selling {
            callbacks,
            terms,
            max_piece_index,
        }
    }

    pub(crate) fn terms(&self) -> SellerTerms {
        self.terms
    }

    pub(crate) fn max_piece_index(&self) -> u32 {
        self.max_piece_index
    }

    /// Dispatches one machine notification. Returns false when the
    /// connection was dropped as a side effect.
    pub(crate) fn handle(
        &mut self,
        ctx: &mut Ctx<Id>,
        id: Id,
        notification: Notification,
    ) -> bool {
        match notification {
            Notification::PeerAnnouncedModeAndTerms(announced) => {
                log::debug!("connection {:?} announced {:?}", id, announced);
                true
            }
            Notification::InvitedToJoinContract => {
                self.invited_to_join_contract(ctx, id);
                true
            }
            Notification::ContractPrepared { value, anchor, .. } => {
                log::info!("connection {:?}: channel anchored at {}", id, anchor);
                (self.callbacks.anchor_announced)(id, anchor, value);
                true
            }
            Notification::PieceRequested(index) => {
                self.piece_requested(ctx, id, index);
                true
            }
            Notification::InvalidPieceRequested(index) => {
                log::error!(
                    "connection {:?}: requested piece {} beyond max index {}",
                    id,
                    index,
                    self.max_piece_index
                );
                self.remove_connection(ctx, id, DisconnectCause::BuyerMessageOverflow);
                false
            }
            Notification::BuyerRequestedSpeedTest { payload_size } => {
                // the machine already emitted the payload
                log::debug!(
                    "connection {:?}: served a {} byte speed test",
                    id,
                    payload_size
                );
                true
            }
            Notification::ValidPayment { amount_paid } => {
                self.received_valid_payment(ctx, id, amount_paid);
                true
            }
            Notification::InvalidPayment => {
                log::error!("connection {:?}: settlement signature did not verify", id);
                self.remove_connection(ctx, id, DisconnectCause::BuyerSentInvalidPayment);
                false
            }
            Notification::PaymentInterrupted => {
                log::info!("connection {:?}: buyer walked away from the contract", id);
                self.remove_connection(ctx, id, DisconnectCause::BuyerInterruptedPayment);
                false
            }
            Notification::MessageOverflow(received) => {
                log::error!("connection {:?}: unexpected {} from buyer", id, received);
                self.remove_connection(ctx, id, DisconnectCause::BuyerMessageOverflow);
                false
            }
            other => {
                log::warn!(
                    "connection {:?}: ignoring notification {:?} in sell mode",
                    id,
                    other
                );
                true
            }
        }
    }

    /// Joins immediately with fresh keys from the client.
    fn invited_to_join_contract(&mut self, ctx: &mut Ctx<Id>, id: Id) {
        if ctx.session_state != SessionState::Started {
            log::info!(
                "connection {:?}: ignoring contract invitation while not started",
                id
            );
            return;
        }
        let mut key_pairs = (self.callbacks.generate_key_pairs)(1);
        let mut pk_hashes = (self.callbacks.generate_p2pkh_addresses)(1);
        let (contract_keypair, final_pk_hash) = match (key_pairs.pop(), pk_hashes.pop()) {
            (Some(keypair), Some(hash)) => (keypair, hash),
            _ => {
                log::error!("client produced no contract keys, cannot join");
                return;
            }
        };
        if let Some(connection) = ctx.connections.get_mut(&id) {
            connection.process(Input::Joined {
                contract_keypair,
                final_pk_hash,
            });
            log::info!("connection {:?}: joining contract", id);
        }
    }

    fn piece_requested(&mut self, ctx: &mut Ctx<Id>, id: Id, index: u32) {
        match ctx.connections.get_mut(&id) {
            Some(connection) => {
                // the channel can only ever pay for so many pieces
                let remaining_payments = connection
                    .machine
                    .payee()
                    .map(|payee| {
                        payee
                            .max_number_of_payments()
                            .saturating_sub(payee.number_of_payments_made())
                    })
                    .unwrap_or(0);
                if connection.pipeline.len() as u64 >= remaining_payments {
                    log::warn!(
                        "connection {:?}: dropping request for piece {}, channel cannot pay for it",
                        id,
                        index
                    );
                    return;
                }
                connection.pipeline.add(index);
            }
            None => return,
        }
        self.try_to_load_pieces(ctx, id);
    }

    /// Piece data arrived from the client store.
    pub(crate) fn piece_loaded(&mut self, ctx: &mut Ctx<Id>, id: Id, data: PieceData, index: u32) {
        if let Some(connection) = ctx.connections.get_mut(&id) {
            let updated = connection.pipeline.data_ready(index, &data);
            // zero matches is fine: the request may have been popped by a
            // polite payment in the meantime
            log::debug!(
                "connection {:?}: data for piece {} filled {} pipeline entries",
                id,
                index,
                updated
            );
        }
        self.try_to_send_pieces(ctx, id);
    }

    fn try_to_load_pieces(&mut self, ctx: &mut Ctx<Id>, id: Id) {
        if ctx.session_state != SessionState::Started {
            return;
        }
        let indexes = match ctx.connections.get_mut(&id) {
            Some(connection) => connection
                .pipeline
                .get_next_batch_to_load(MAX_OUTSTANDING_PAYMENTS + MAX_PIECES_TO_PRELOAD - 1),
            None => return,
        };
        for index in indexes {
            (self.callbacks.load_piece_for_buyer)(id, index);
        }
    }

    fn try_to_send_pieces(&mut self, ctx: &mut Ctx<Id>, id: Id) {
        if ctx.session_state != SessionState::Started {
            return;
        }
        if let Some(connection) = ctx.connections.get_mut(&id) {
            let batch = connection
                .pipeline
                .get_next_batch_to_send(MAX_OUTSTANDING_PAYMENTS - 1);
            for piece_data in batch {
                connection.process(Input::PieceLoaded(piece_data));
            }
        }
    }

    fn received_valid_payment(&mut self, ctx: &mut Ctx<Id>, id: Id, amount_paid: Amount) {
        log::debug!("connection {:?}: paid up to {}", id, amount_paid);
        (self.callbacks.received_valid_payment)(id, amount_paid);
        if let Some(connection) = ctx.connections.get_mut(&id) {
            connection.pipeline.payment_received();
        }
        self.try_to_send_pieces(ctx, id);
        self.try_to_load_pieces(ctx, id);
    }

    /// Hands the payee over so the host can countersign and broadcast the
    /// settlement, when the channel earned anything.
    fn try_to_claim_last_payment(&mut self, id: Id, connection: &Connection<Id>) {
        if let Some(payee) = connection.machine.payee() {
            if payee.number_of_payments_made() > 0 {
                log::info!(
                    "connection {:?}: claiming settlement after {} payment(s)",
                    id,
                    payee.number_of_payments_made()
                );
                (self.callbacks.claim_last_payment)(id, payee);
            }
        }
    }

    pub(crate) fn remove_connection(&mut self, ctx: &mut Ctx<Id>, id: Id, cause: DisconnectCause) {
        if let Some(connection) = ctx.connections.remove(&id) {
            self.try_to_claim_last_payment(id, &connection);
            log::info!("connection {:?} removed: {:?}", id, cause);
            (self.callbacks.removed_connection)(id, cause);
        }
    }

    /// New terms break every live contract; settle their earnings first.
    pub(crate) fn update_terms(&mut self, ctx: &mut Ctx<Id>, terms: SellerTerms) {
        self.terms = terms;
        let ids: Vec<Id> = ctx.connections.keys().copied().collect();
        for id in ids {
            if let Some(connection) = ctx.connections.get(&id) {
                self.try_to_claim_last_payment(id, connection);
            }
            if let Some(connection) = ctx.connections.get_mut(&id) {
                connection.pipeline = PieceDeliveryPipeline::new();
                connection.process(Input::UpdateSellerTerms(terms));
            }
        }
    }

    pub(crate) fn stop(&mut self, ctx: &mut Ctx<Id>) {
        let ids: Vec<Id> = ctx.connections.keys().copied().collect();
        for id in ids {
            self.remove_connection(ctx, id, DisconnectCause::Client);
        }
    }

    /// The mode is being replaced; settle every channel's earnings.
    pub(crate) fn leaving(&mut self, ctx: &mut Ctx<Id>) {
        let ids: Vec<Id> = ctx.connections.keys().copied().collect();
        for id in ids {
            if let Some(connection) = ctx.connections.get(&id) {
                self.try_to_claim_last_payment(id, connection);
            }
        }
    }

    /// Re-drives pipelines; also picks up work deferred while paused.
    pub(crate) fn tick(&mut self, ctx: &mut Ctx<Id>) {
        if ctx.session_state != SessionState::Started {
            return;
        }
        let ids: Vec<Id> = ctx.connections.keys().copied().collect();
        for id in ids {
            self.try_to_load_pieces(ctx, id);
            self.try_to_send_pieces(ctx, id);
        }
    }

    pub(crate) fn status(&self) -> super::status::Selling {
        super::status::Selling {
            terms: self.terms,
            max_piece_index: self.max_piece_index,
        }
    }
}
