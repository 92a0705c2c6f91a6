//! Shared harness for driving a session end to end from both sides of
//! the protocol: callback recorders, a controllable clock, and simulated
//! remote peers that run real channel state.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bitcoin::{
    secp256k1::{ecdsa::Signature, Message, Secp256k1},
    Amount, OutPoint, PubkeyHash, Transaction,
};

use pieceswap::channel::{KeyPair, Payee, Payor};
use pieceswap::protocol::contract::{create_funding_transaction, Commitment};
use pieceswap::protocol::messages::{
    BuyerTerms, Invite, JoiningContract, Payment, PieceData, ProtocolMessage, Ready, SellerTerms,
};
use pieceswap::session::callbacks::{
    AllSellersGone, AnchorAnnounced, BuyingCallbacks, ClaimLastPayment, FullPieceArrived,
    LoadPieceForBuyer, ObservingCallbacks, PickNextPiece, ReceivedValidPayment, RemovedConnection,
    SellingCallbacks, SentPayment,
};
use pieceswap::session::{
    Clock, DisconnectCause, PieceInformation, PieceState, SendMessage, Session,
    StartDownloadInformation,
};

/// Connection identity used across all session tests.
pub type Id = u32;

/// Everything the client callbacks reported, in invocation order.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    RemovedConnection(Id, DisconnectCause),
    FullPieceArrived {
        id: Id,
        piece_index: u32,
        length: usize,
    },
    SentPayment {
        id: Id,
        price: u64,
        payments_made: u64,
        amount_paid: u64,
        piece_index: u32,
    },
    AllSellersGone,
    LoadPiece {
        id: Id,
        piece_index: u32,
    },
    AnchorAnnounced {
        id: Id,
        anchor: OutPoint,
        value: u64,
    },
    ReceivedValidPayment {
        id: Id,
        amount_paid: u64,
    },
    ClaimLastPayment {
        id: Id,
        payments_made: u64,
    },
}

/// Records every callback invocation and every outbound wire message.
pub struct Spy {
    pub events: Rc<RefCell<Vec<CallbackEvent>>>,
    pub sent: Rc<RefCell<HashMap<Id, Vec<ProtocolMessage>>>>,
    /// Verdict `full_piece_arrived` returns; defaults to valid.
    pub validation_result: Rc<Cell<bool>>,
}

impl Spy {
    pub fn new() -> Spy {
        Spy {
            events: Rc::new(RefCell::new(Vec::new())),
            sent: Rc::new(RefCell::new(HashMap::new())),
            validation_result: Rc::new(Cell::new(true)),
        }
    }

    /// Send slot recording the connection's outbound messages.
    pub fn sender(&self, id: Id) -> SendMessage {
        let sent = self.sent.clone();
        Box::new(move |message| {
            sent.borrow_mut()
                .entry(id)
                .or_insert_with(Vec::new)
                .push(message)
        })
    }

    pub fn sent_on(&self, id: Id) -> Vec<ProtocolMessage> {
        self.sent.borrow().get(&id).cloned().unwrap_or_default()
    }

    pub fn last_sent(&self, id: Id) -> Option<ProtocolMessage> {
        self.sent.borrow().get(&id).and_then(|v| v.last().cloned())
    }

    pub fn drain_events(&self) -> Vec<CallbackEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    fn removed_connection(&self) -> RemovedConnection<Id> {
        let events = self.events.clone();
        Box::new(move |id, cause| {
            events
                .borrow_mut()
                .push(CallbackEvent::RemovedConnection(id, cause))
        })
    }

    pub fn observing_callbacks(&self) -> ObservingCallbacks<Id> {
        ObservingCallbacks {
            removed_connection: self.removed_connection(),
        }
    }

    pub fn buying_callbacks(&self) -> BuyingCallbacks<Id> {
        let events = self.events.clone();
        let validation_result = self.validation_result.clone();
        let full_piece_arrived: FullPieceArrived<Id> = Box::new(move |id, data, piece_index| {
            events.borrow_mut().push(CallbackEvent::FullPieceArrived {
                id,
                piece_index,
                length: data.len(),
            });
            validation_result.get()
        });
        let events = self.events.clone();
        let sent_payment: SentPayment<Id> =
            Box::new(move |id, price, payments_made, amount_paid, piece_index| {
                events.borrow_mut().push(CallbackEvent::SentPayment {
                    id,
                    price,
                    payments_made,
                    amount_paid: amount_paid.to_sat(),
                    piece_index,
                });
            });
        let events = self.events.clone();
        let all_sellers_gone: AllSellersGone =
            Box::new(move || events.borrow_mut().push(CallbackEvent::AllSellersGone));
        // lowest unassigned index first
        let pick_next_piece: PickNextPiece<Id> = Box::new(|pieces| {
            pieces
                .iter()
                .position(|piece| matches!(piece.state(), PieceState::Unassigned))
        });
        BuyingCallbacks {
            removed_connection: self.removed_connection(),
            full_piece_arrived,
            sent_payment,
            all_sellers_gone,
            pick_next_piece,
        }
    }

    pub fn selling_callbacks(&self) -> SellingCallbacks<Id> {
        let events = self.events.clone();
        let load_piece_for_buyer: LoadPieceForBuyer<Id> = Box::new(move |id, piece_index| {
            events
                .borrow_mut()
                .push(CallbackEvent::LoadPiece { id, piece_index })
        });
        let events = self.events.clone();
        let claim_last_payment: ClaimLastPayment<Id> = Box::new(move |id, payee| {
            events.borrow_mut().push(CallbackEvent::ClaimLastPayment {
                id,
                payments_made: payee.number_of_payments_made(),
            })
        });
        let events = self.events.clone();
        let anchor_announced: AnchorAnnounced<Id> = Box::new(move |id, anchor, value| {
            events.borrow_mut().push(CallbackEvent::AnchorAnnounced {
                id,
                anchor,
                value: value.to_sat(),
            })
        });
        let events = self.events.clone();
        let received_valid_payment: ReceivedValidPayment<Id> = Box::new(move |id, amount_paid| {
            events.borrow_mut().push(CallbackEvent::ReceivedValidPayment {
                id,
                amount_paid: amount_paid.to_sat(),
            })
        });
        SellingCallbacks {
            removed_connection: self.removed_connection(),
            generate_key_pairs: Box::new(|n| {
                (0..n).map(|_| KeyPair::generate().unwrap()).collect()
            }),
            generate_p2pkh_addresses: Box::new(|n| {
                (0..n)
                    .map(|_| KeyPair::generate().unwrap().pk.pubkey_hash())
                    .collect()
            }),
            load_piece_for_buyer,
            claim_last_payment,
            anchor_announced,
            received_valid_payment,
        }
    }
}

/// A clock the test advances by hand.
pub fn test_clock() -> (Rc<Cell<Instant>>, Clock) {
    let now = Rc::new(Cell::new(Instant::now()));
    let handle = now.clone();
    (now, Rc::new(move || handle.get()))
}

pub fn advance(clock: &Rc<Cell<Instant>>, delta: Duration) {
    clock.set(clock.get() + delta);
}

pub fn buyer_terms() -> BuyerTerms {
    BuyerTerms {
        max_price: 20,
        min_lock: 10,
        min_number_of_sellers: 2,
        max_settlement_fee: 5,
    }
}

pub fn seller_terms() -> SellerTerms {
    SellerTerms {
        min_price: 10,
        min_lock: 5,
        max_number_of_sellers: 4,
        settlement_fee: 1,
    }
}

pub fn pieces(count: usize) -> Vec<PieceInformation> {
    vec![
        PieceInformation {
            size: 1000,
            downloaded: false,
        };
        count
    ]
}

/// A buying session with the speed test disabled and a 5 s servicing
/// timeout; tests that need the test re-enable it through the policy.
pub fn buying_session(piece_count: usize) -> (Session<Id>, Spy, Rc<Cell<Instant>>) {
    buying_session_with_timeout(piece_count, Duration::from_secs(5))
}

pub fn buying_session_with_timeout(
    piece_count: usize,
    max_time_to_service_piece: Duration,
) -> (Session<Id>, Spy, Rc<Cell<Instant>>) {
    let spy = Spy::new();
    let (handle, clock) = test_clock();
    let mut session = Session::with_clock(clock);
    session.speed_test_policy_mut().disable();
    session.to_buy_mode(
        buyer_terms(),
        pieces(piece_count),
        spy.buying_callbacks(),
        max_time_to_service_piece,
    );
    (session, spy, handle)
}

/// A started selling session with default terms and max piece index 100.
pub fn selling_session() -> (Session<Id>, Spy) {
    let spy = Spy::new();
    let (_, clock) = test_clock();
    let mut session = Session::with_clock(clock);
    session.to_sell_mode(seller_terms(), 100, spy.selling_callbacks());
    session.start().unwrap();
    (session, spy)
}

/// Simulated remote seller for buying-side tests; holds the real payee
/// side of the channel so payments can be verified.
pub struct SellerPeer {
    pub id: Id,
    pub terms: SellerTerms,
    pub contract_keypair: KeyPair,
    pub final_pk_hash: PubkeyHash,
    pub payee: Option<Payee>,
}

impl SellerPeer {
    pub fn new(id: Id, terms: SellerTerms) -> SellerPeer {
        SellerPeer {
            id,
            terms,
            contract_keypair: KeyPair::generate().unwrap(),
            final_pk_hash: KeyPair::generate().unwrap().pk.pubkey_hash(),
            payee: None,
        }
    }

    pub fn joining_contract_message(&self) -> ProtocolMessage {
        ProtocolMessage::JoiningContract(JoiningContract {
            contract_pk: self.contract_keypair.pk,
            final_pk_hash: self.final_pk_hash,
        })
    }

    /// Builds the payee side from the observed `Ready` announcement.
    pub fn contract_announced(&mut self, ready: &Ready) {
        self.payee = Some(Payee::new(
            self.terms.min_price,
            self.terms.min_lock,
            self.terms.settlement_fee,
            ready.value,
            ready.anchor,
            self.contract_keypair,
            self.final_pk_hash,
            ready.contract_pk,
            ready.final_pk_hash,
        ));
    }

    pub fn validate_payment(&mut self, signature: &Signature) -> bool {
        self.payee
            .as_mut()
            .expect("no contract announced")
            .register_payment(signature)
            .unwrap()
    }
}

/// Simulated remote buyer for selling-side tests; holds the real payor
/// side of the channel so it can produce valid payments.
pub struct BuyerPeer {
    pub id: Id,
    pub terms: BuyerTerms,
    pub contract_keypair: KeyPair,
    pub final_pk_hash: PubkeyHash,
    pub payor: Option<Payor>,
}

impl BuyerPeer {
    pub fn new(id: Id, terms: BuyerTerms) -> BuyerPeer {
        BuyerPeer {
            id,
            terms,
            contract_keypair: KeyPair::generate().unwrap(),
            final_pk_hash: KeyPair::generate().unwrap().pk.pubkey_hash(),
            payor: None,
        }
    }

    /// Announce buy terms, invite, fund the channel from the observed
    /// join message and announce `Ready`.
    pub fn take_seller_to_exchange(
        &mut self,
        session: &mut Session<Id>,
        spy: &Spy,
        seller_terms: SellerTerms,
        value: u64,
    ) {
        session
            .process_message_on_connection(self.id, ProtocolMessage::Buy(self.terms))
            .unwrap();
        session
            .process_message_on_connection(self.id, ProtocolMessage::Invite(Invite))
            .unwrap();
        let joining = spy
            .sent_on(self.id)
            .iter()
            .find_map(|message| match message {
                ProtocolMessage::JoiningContract(joining) => Some(*joining),
                _ => None,
            })
            .expect("seller did not join the contract");

        let commitment = Commitment {
            value: Amount::from_sat(value),
            buyer_contract_pk: self.contract_keypair.pk,
            seller_contract_pk: joining.contract_pk,
            lock: seller_terms.min_lock,
        };
        let funding_tx = create_funding_transaction(&[commitment]);
        let anchor = OutPoint::new(funding_tx.compute_txid(), 0);
        self.payor = Some(Payor::new(
            seller_terms.min_price,
            seller_terms.min_lock,
            seller_terms.settlement_fee,
            Amount::from_sat(value),
            anchor,
            self.contract_keypair,
            self.final_pk_hash,
            joining.contract_pk,
            joining.final_pk_hash,
        ));
        session
            .process_message_on_connection(
                self.id,
                ProtocolMessage::Ready(Ready {
                    value: Amount::from_sat(value),
                    anchor,
                    contract_pk: self.contract_keypair.pk,
                    final_pk_hash: self.final_pk_hash,
                }),
            )
            .unwrap();
    }

    pub fn pay(&mut self, session: &mut Session<Id>) {
        let signature = self
            .payor
            .as_mut()
            .expect("no channel funded")
            .make_payment()
            .unwrap();
        session
            .process_message_on_connection(self.id, ProtocolMessage::Payment(Payment { signature }))
            .unwrap();
    }
}

/// One buyer/seller channel of the funding transaction.
pub struct BuyerSellerRelationship {
    pub peer_id: Id,
    pub seller_contract_pk: bitcoin::PublicKey,
    pub seller_terms: SellerTerms,
    pub value: u64,
}

/// Funding transaction with one commitment per relationship, plus the
/// matching per-peer start-download map.
pub fn simple_contract(
    relationships: &[BuyerSellerRelationship],
) -> (Transaction, HashMap<Id, StartDownloadInformation>) {
    let mut commitments = Vec::new();
    let mut keys = Vec::new();
    for relationship in relationships {
        let buyer_contract_keypair = KeyPair::generate().unwrap();
        let buyer_final_pk_hash = KeyPair::generate().unwrap().pk.pubkey_hash();
        commitments.push(Commitment {
            value: Amount::from_sat(relationship.value),
            buyer_contract_pk: buyer_contract_keypair.pk,
            seller_contract_pk: relationship.seller_contract_pk,
            lock: relationship.seller_terms.min_lock,
        });
        keys.push((buyer_contract_keypair, buyer_final_pk_hash));
    }
    let funding_tx = create_funding_transaction(&commitments);
    let mut downloads = HashMap::new();
    for (output_index, (relationship, (keypair, pk_hash))) in
        relationships.iter().zip(keys).enumerate()
    {
        downloads.insert(
            relationship.peer_id,
            StartDownloadInformation {
                output_index: output_index as u32,
                buyer_contract_keypair: keypair,
                buyer_final_pk_hash: pk_hash,
                value: Amount::from_sat(relationship.value),
                seller_terms: relationship.seller_terms,
            },
        );
    }
    (funding_tx, downloads)
}

/// Takes a seller peer through announce/invite/join and hands the funding
/// transaction over; the session must be started with the speed test off.
pub fn seller_under_contract(
    session: &mut Session<Id>,
    spy: &Spy,
    peer: &mut SellerPeer,
    value: u64,
) {
    session.add_connection(peer.id, spy.sender(peer.id)).unwrap();
    session
        .process_message_on_connection(peer.id, ProtocolMessage::Sell(peer.terms))
        .unwrap();
    session
        .process_message_on_connection(peer.id, peer.joining_contract_message())
        .unwrap();
    let (funding_tx, downloads) = simple_contract(&[BuyerSellerRelationship {
        peer_id: peer.id,
        seller_contract_pk: peer.contract_keypair.pk,
        seller_terms: peer.terms,
        value,
    }]);
    session.start_downloading(&funding_tx, downloads).unwrap();
    let ready = find_ready(&spy.sent_on(peer.id)).expect("no Ready announced");
    peer.contract_announced(&ready);
}

//// Wire and event inspection helpers

pub fn find_ready(messages: &[ProtocolMessage]) -> Option<Ready> {
    messages.iter().find_map(|message| match message {
        ProtocolMessage::Ready(ready) => Some(*ready),
        _ => None,
    })
}

pub fn request_indexes(messages: &[ProtocolMessage]) -> Vec<u32> {
    messages
        .iter()
        .filter_map(|message| match message {
            ProtocolMessage::RequestFullPiece(request) => Some(request.piece_index),
            _ => None,
        })
        .collect()
}

pub fn payment_signatures(messages: &[ProtocolMessage]) -> Vec<Signature> {
    messages
        .iter()
        .filter_map(|message| match message {
            ProtocolMessage::Payment(payment) => Some(payment.signature),
            _ => None,
        })
        .collect()
}

pub fn count_full_pieces(messages: &[ProtocolMessage]) -> usize {
    messages
        .iter()
        .filter(|message| matches!(message, ProtocolMessage::FullPiece(_)))
        .count()
}

pub fn load_indexes(events: &[CallbackEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|event| match event {
            CallbackEvent::LoadPiece { piece_index, .. } => Some(*piece_index),
            _ => None,
        })
        .collect()
}

pub fn removals(events: &[CallbackEvent]) -> Vec<(Id, DisconnectCause)> {
    events
        .iter()
        .filter_map(|event| match event {
            CallbackEvent::RemovedConnection(id, cause) => Some((*id, *cause)),
            _ => None,
        })
        .collect()
}

/// A syntactically valid settlement signature from a key nobody funded.
pub fn invalid_payment_message() -> ProtocolMessage {
    let secp = Secp256k1::new();
    let rogue = KeyPair::generate().unwrap();
    let digest = Message::from_digest_slice(&[7u8; 32]).unwrap();
    ProtocolMessage::Payment(Payment {
        signature: secp.sign_ecdsa(&digest, &rogue.sk),
    })
}

pub fn full_piece(length: usize, byte: u8) -> ProtocolMessage {
    ProtocolMessage::FullPiece(pieceswap::protocol::messages::FullPiece {
        piece_data: PieceData(vec![byte; length]),
    })
}
