//! Inputs and outputs of the per-connection state machine.

use bitcoin::{Amount, OutPoint, PubkeyHash, PublicKey};

use crate::{
    channel::KeyPair,
    protocol::messages::{BuyerTerms, PieceData, ProtocolMessage, SellerTerms},
};

/// What the remote peer has announced, updated on every re-announcement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnnouncedModeAndTerms {
    None,
    Observe,
    Buy(BuyerTerms),
    Sell(SellerTerms),
}

impl AnnouncedModeAndTerms {
    pub fn buy_terms(&self) -> Option<BuyerTerms> {
        match self {
            Self::Buy(terms) => Some(*terms),
            _ => None,
        }
    }

    pub fn sell_terms(&self) -> Option<SellerTerms> {
        match self {
            Self::Sell(terms) => Some(*terms),
            _ => None,
        }
    }
}

/// Events fed into the machine: decoded wire messages from the peer and
/// instructions from the hosting session.
#[derive(Debug, Clone)]
pub enum Input {
    /// A decoded wire message from the peer.
    Message(ProtocolMessage),
    /// The session entered observe mode.
    ObserveModeStarted,
    /// The session entered buy mode with the given terms.
    BuyModeStarted(BuyerTerms),
    /// The session entered sell mode.
    SellModeStarted {
        terms: SellerTerms,
        max_piece_index: u32,
    },
    /// Renegotiate our buyer terms; breaks any live contract.
    UpdateBuyerTerms(BuyerTerms),
    /// Renegotiate our seller terms; breaks any live contract.
    UpdateSellerTerms(SellerTerms),
    /// Invite the peer to sell under its announced terms.
    InviteSeller,
    /// Probe the peer with a speed test before inviting.
    TestSellerSpeed { payload_size: u32 },
    /// The funding transaction exists; announce this seller's anchor.
    ContractPrepared {
        anchor: OutPoint,
        contract_keypair: KeyPair,
        final_pk_hash: PubkeyHash,
        value: Amount,
    },
    /// Request a piece from the seller.
    RequestPiece(u32),
    /// Pay for the piece most recently validated (or, when none is under
    /// validation, for the front requested piece that never arrived).
    SendPayment,
    /// Join the contract we were invited to, with our channel keys.
    Joined {
        contract_keypair: KeyPair,
        final_pk_hash: PubkeyHash,
    },
    /// Piece data is available; deliver it to the buyer.
    PieceLoaded(PieceData),
}

/// What a processed input produced.
#[derive(Debug, Clone)]
pub enum Output {
    /// Message to put on the wire, in emission order.
    Send(ProtocolMessage),
    /// Event for the hosting session.
    Notify(Notification),
}

/// Session-facing machine events.
#[derive(Debug, Clone)]
pub enum Notification {
    /// The peer (re-)announced a mode, possibly with terms.
    PeerAnnouncedModeAndTerms(AnnouncedModeAndTerms),
    /// The invited seller joined our contract.
    SellerJoined,
    /// The seller broke a live contract by re-announcing.
    SellerInterruptedContract,
    /// A full piece arrived and awaits validation.
    ReceivedFullPiece(PieceData),
    /// The pending speed test concluded.
    SellerCompletedSpeedTest { delivered_expected_payload: bool },
    /// A buyer invited us to join its contract.
    InvitedToJoinContract,
    /// The buyer announced our channel anchor; piece requests may follow.
    ContractPrepared {
        value: Amount,
        anchor: OutPoint,
        payor_contract_pk: PublicKey,
        payor_final_pk_hash: PubkeyHash,
    },
    /// The buyer requested a piece within bounds.
    PieceRequested(u32),
    /// The buyer requested a piece beyond the maximum index.
    InvalidPieceRequested(u32),
    /// The buyer ran a pre-contract speed test; the payload was already
    /// emitted.
    BuyerRequestedSpeedTest { payload_size: u32 },
    /// A settlement signature checked out; the payee counter advanced.
    ValidPayment { amount_paid: Amount },
    /// A settlement signature did not verify.
    InvalidPayment,
    /// The buyer walked away from a live contract by re-announcing.
    PaymentInterrupted,
    /// A message illegal in the current state; fatal for the connection.
    MessageOverflow(String),
}
