//! Piece exchange protocol messages.
//!
//! Messages are exchanged between one buyer and one seller over a single
//! connection; a session multiplexes many such connections but every
//! exchange is strictly bilateral.
//!
//! Each side first announces a mode and, for buy/sell, its terms. A mode
//! message may be re-sent at any time to renegotiate; re-announcing while
//! a contract is live interrupts that contract. The simplest successful
//! exchange between a buyer B and a seller S looks like:
//!
//! ```shell
//! B -> S: [ProtocolMessage::Buy]      (announce mode and terms)
//! S -> B: [ProtocolMessage::Sell]     (announce mode and terms)
//! B -> S: [ProtocolMessage::Invite]   (terms acceptable, invite seller)
//! S -> B: [ProtocolMessage::JoiningContract]  (seller contract keys)
//! B -> S: [ProtocolMessage::Ready]    (funding anchor for this channel)
//! B -> S: [ProtocolMessage::RequestFullPiece]
//! S -> B: [ProtocolMessage::FullPiece]
//! B -> S: [ProtocolMessage::Payment]  (settlement signature, one increment)
//! ...
//! ```
//!
//! Before inviting, a buyer may probe the seller with a single
//! [ProtocolMessage::Speed] request, answered by a `FullPiece` carrying a
//! synthetic payload of the declared size.

use std::fmt::Display;

use bitcoin::{secp256k1::ecdsa::Signature, Amount, OutPoint, PubkeyHash, PublicKey};

use serde::{Deserialize, Serialize};

/// Terms a buyer announces and invites sellers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuyerTerms {
    /// Highest price per piece the buyer will pay.
    pub max_price: u64,
    /// Longest refund lock (in time units) the buyer will fund.
    pub min_lock: u16,
    /// Fewest seller commitment outputs the buyer insists the seller
    /// tolerates in the funding transaction.
    pub min_number_of_sellers: u32,
    /// Highest settlement fee the buyer will cover.
    pub max_settlement_fee: u64,
}

impl BuyerTerms {
    /// Whether a seller quoting `terms` is acceptable under these terms.
    pub fn satisfied_by(&self, terms: &SellerTerms) -> bool {
        terms.min_price <= self.max_price
            && terms.min_lock <= self.min_lock
            && terms.settlement_fee <= self.max_settlement_fee
            && terms.max_number_of_sellers >= self.min_number_of_sellers
    }
}

/// Terms a seller announces and services piece requests under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SellerTerms {
    /// Lowest price per piece the seller accepts.
    pub min_price: u64,
    /// Shortest refund lock (in time units) the seller accepts.
    pub min_lock: u16,
    /// Most commitment outputs the seller tolerates in the funding
    /// transaction it joins.
    pub max_number_of_sellers: u32,
    /// Settlement fee the seller demands be budgeted.
    pub settlement_fee: u64,
}

/// Raw payload of one content piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PieceData(pub Vec<u8>);

impl PieceData {
    /// Deterministic payload of the given size, used for speed tests.
    pub fn zeroes(length: usize) -> PieceData {
        PieceData(vec![0u8; length])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// Buyer invites the seller to join its contract under the seller's most
/// recently announced terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite;

/// Seller joins the contract, revealing its channel keys.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JoiningContract {
    /// Seller key in the commitment output.
    pub contract_pk: PublicKey,
    /// Hash the seller wants settlement funds paid to.
    pub final_pk_hash: PubkeyHash,
}

/// Buyer announces the funding anchor of the seller's channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    /// Channel value locked in the commitment output.
    pub value: Amount,
    /// The commitment output of the funding transaction.
    pub anchor: OutPoint,
    /// Buyer key in the commitment output.
    pub contract_pk: PublicKey,
    /// Hash the buyer wants refunded settlement funds paid to.
    pub final_pk_hash: PubkeyHash,
}

/// Buyer requests delivery of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFullPiece {
    pub piece_index: u32,
}

/// Seller delivers one piece, or a speed-test payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullPiece {
    pub piece_data: PieceData,
}

/// Buyer pays for one delivered piece with a settlement signature for the
/// incremented channel balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub signature: Signature,
}

/// Buyer asks a prospective seller to deliver a synthetic payload of the
/// given size before any contract is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speed {
    pub payload_size: u32,
}

/// All messages of the piece exchange protocol. Terms renegotiation is
/// expressed by re-sending a mode message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Announce observe mode.
    Observe,
    /// Announce buy mode and buyer terms.
    Buy(BuyerTerms),
    /// Announce sell mode and seller terms.
    Sell(SellerTerms),
    /// Invite the seller to join the buyer's contract.
    Invite(Invite),
    /// Seller joins the contract.
    JoiningContract(JoiningContract),
    /// Buyer announces the channel anchor; piece exchange may begin.
    Ready(Ready),
    /// Request one piece.
    RequestFullPiece(RequestFullPiece),
    /// Deliver one piece.
    FullPiece(FullPiece),
    /// Pay for one delivered piece.
    Payment(Payment),
    /// Request a pre-contract speed-test payload.
    Speed(Speed),
}

impl Display for ProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Observe => write!(f, "Observe"),
            Self::Buy(_) => write!(f, "Buy"),
            Self::Sell(_) => write!(f, "Sell"),
            Self::Invite(_) => write!(f, "Invite"),
            Self::JoiningContract(_) => write!(f, "JoiningContract"),
            Self::Ready(_) => write!(f, "Ready"),
            Self::RequestFullPiece(_) => write!(f, "RequestFullPiece"),
            Self::FullPiece(_) => write!(f, "FullPiece"),
            Self::Payment(_) => write!(f, "Payment"),
            Self::Speed(_) => write!(f, "Speed"),
        }
    }
}
