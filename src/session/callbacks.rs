//! Grouped client callback records, passed at mode entry.
//!
//! Every callback is invoked synchronously from inside a session entry
//! point. Clients must not re-enter the session with a mutating call from
//! a callback; read-only re-entrance is fine. `FullPieceArrived` must
//! return its validation verdict synchronously.

use bitcoin::{Amount, OutPoint, PubkeyHash};

use crate::{
    channel::{KeyPair, Payee},
    protocol::messages::PieceData,
};

use super::{piece::Piece, DisconnectCause};

/// A connection was removed, and why.
pub type RemovedConnection<Id> = Box<dyn FnMut(Id, DisconnectCause)>;

/// Produce `n` fresh contract key pairs.
pub type GenerateKeyPairs = Box<dyn FnMut(u32) -> Vec<KeyPair>>;

/// Produce `n` fresh P2PKH output hashes for settlement payouts.
pub type GenerateP2pkhAddresses = Box<dyn FnMut(u32) -> Vec<PubkeyHash>>;

/// A full piece arrived; the client validates it and answers immediately.
pub type FullPieceArrived<Id> = Box<dyn FnMut(Id, &PieceData, u32) -> bool>;

/// A payment went out: `(id, price, payments_made, amount_paid, piece_index)`.
pub type SentPayment<Id> = Box<dyn FnMut(Id, u64, u64, Amount, u32)>;

/// Every seller is gone; the session is inviting again.
pub type AllSellersGone = Box<dyn FnMut()>;

/// Pick the next piece to assign, or `None` when nothing is unassigned.
/// Tie-breaking is entirely the host's policy.
pub type PickNextPiece<Id> = Box<dyn FnMut(&[Piece<Id>]) -> Option<usize>>;

/// Load the data of one piece for the buyer on the given connection.
pub type LoadPieceForBuyer<Id> = Box<dyn FnMut(Id, u32)>;

/// The channel closed with payments received; the host can countersign
/// and broadcast the settlement held by the payee.
pub type ClaimLastPayment<Id> = Box<dyn FnMut(Id, &Payee)>;

/// The buyer announced the channel anchor for this connection.
pub type AnchorAnnounced<Id> = Box<dyn FnMut(Id, OutPoint, Amount)>;

/// A payment came in: `(id, amount_paid)`.
pub type ReceivedValidPayment<Id> = Box<dyn FnMut(Id, Amount)>;

/// Callbacks for observing mode.
pub struct ObservingCallbacks<Id> {
    pub removed_connection: RemovedConnection<Id>,
}

/// Callbacks for buying mode.
pub struct BuyingCallbacks<Id> {
    pub removed_connection: RemovedConnection<Id>,
    pub full_piece_arrived: FullPieceArrived<Id>,
    pub sent_payment: SentPayment<Id>,
    pub all_sellers_gone: AllSellersGone,
    pub pick_next_piece: PickNextPiece<Id>,
}

/// Callbacks for selling mode.
pub struct SellingCallbacks<Id> {
    pub removed_connection: RemovedConnection<Id>,
    pub generate_key_pairs: GenerateKeyPairs,
    pub generate_p2pkh_addresses: GenerateP2pkhAddresses,
    pub load_piece_for_buyer: LoadPieceForBuyer<Id>,
    pub claim_last_payment: ClaimLastPayment<Id>,
    pub anchor_announced: AnchorAnnounced<Id>,
    pub received_valid_payment: ReceivedValidPayment<Id>,
}
