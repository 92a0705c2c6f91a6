//! Per-connection wire-protocol state machine.
//!
//! A hierarchical chart with a transient `ChooseMode` top state and one
//! top state per mode (Observe / Buy / Sell), each with its own ordered
//! sub-states. The chart is expressed as nested sum types and
//! [ConnectionMachine::process] is a total function from (state, input)
//! to (state, outputs): it never calls back into the session, it only
//! returns messages to put on the wire and notifications for the session
//! to act on.
//!
//! Wire messages that are illegal in the current state produce
//! [Notification::MessageOverflow], which the hosting session treats as
//! fatal for the connection. Session-driven inputs sent in the wrong
//! state are session bugs and abort.

pub mod events;

use std::collections::VecDeque;

use bitcoin::{Amount, OutPoint, PubkeyHash, PublicKey};

use crate::{
    channel::{KeyPair, Payee, Payor},
    protocol::messages::{
        BuyerTerms, FullPiece, Invite, JoiningContract, Payment, PieceData, ProtocolMessage, Ready,
        RequestFullPiece, SellerTerms, Speed,
    },
};

pub use events::{AnnouncedModeAndTerms, Input, Notification, Output};

/// Buy-mode sub-states. The `Downloading` composite tracks the request
/// pipeline explicitly: `requested` holds outstanding piece requests in
/// emission order and `validating` the piece whose data has arrived and
/// is with the client for validation.
#[derive(Debug)]
pub(crate) enum BuyerState {
    ReadyForInvitation,
    TestingSellerSpeed {
        expected_payload_size: u32,
    },
    InvitedSeller {
        terms: SellerTerms,
    },
    PreparingContract {
        terms: SellerTerms,
        payee_contract_pk: PublicKey,
        payee_final_pk_hash: PubkeyHash,
    },
    Downloading {
        payor: Payor,
        requested: VecDeque<u32>,
        validating: Option<u32>,
    },
}

#[derive(Debug)]
pub(crate) struct BuyerSide {
    pub(crate) state: BuyerState,
}

/// Sell-mode sub-states. Piece loading is owned by the session's delivery
/// pipeline, so the machine stays in `ReadyForPieceRequest` for the whole
/// exchange phase.
#[derive(Debug)]
pub(crate) enum SellerState {
    ReadyForInvitation,
    Invited,
    JoinedContract {
        contract_keypair: KeyPair,
        final_pk_hash: PubkeyHash,
    },
    ReadyForPieceRequest {
        payee: Payee,
    },
}

#[derive(Debug)]
pub(crate) struct SellerSide {
    pub(crate) terms: SellerTerms,
    pub(crate) max_piece_index: u32,
    pub(crate) state: SellerState,
}

#[derive(Debug)]
pub(crate) enum State {
    ChooseMode,
    Observe,
    Buy(BuyerSide),
    Sell(SellerSide),
}

/// The state machine for one peer connection.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: State,
    peer: AnnouncedModeAndTerms,
    max_speed_test_payload: u32,
}

impl ConnectionMachine {
    pub fn new(max_speed_test_payload: u32) -> ConnectionMachine {
        ConnectionMachine {
            state: State::ChooseMode,
            peer: AnnouncedModeAndTerms::None,
            max_speed_test_payload,
        }
    }

    /// Runs one input through the chart.
    pub fn process(&mut self, input: Input) -> Vec<Output> {
        match input {
            Input::Message(message) => self.process_message(message),
            Input::ObserveModeStarted => {
                self.state = State::Observe;
                vec![Output::Send(ProtocolMessage::Observe)]
            }
            Input::BuyModeStarted(terms) => {
                self.state = State::Buy(BuyerSide {
                    state: BuyerState::ReadyForInvitation,
                });
                vec![Output::Send(ProtocolMessage::Buy(terms))]
            }
            Input::SellModeStarted {
                terms,
                max_piece_index,
            } => {
                self.state = State::Sell(SellerSide {
                    terms,
                    max_piece_index,
                    state: SellerState::ReadyForInvitation,
                });
                vec![Output::Send(ProtocolMessage::Sell(terms))]
            }
            Input::UpdateBuyerTerms(terms) => self.on_update_buyer_terms(terms),
            Input::UpdateSellerTerms(terms) => self.on_update_seller_terms(terms),
            Input::InviteSeller => self.on_invite_seller(),
            Input::TestSellerSpeed { payload_size } => self.on_test_seller_speed(payload_size),
            Input::ContractPrepared {
                anchor,
                contract_keypair,
                final_pk_hash,
                value,
            } => self.on_contract_prepared(anchor, contract_keypair, final_pk_hash, value),
            Input::RequestPiece(index) => self.on_request_piece(index),
            Input::SendPayment => self.on_send_payment(),
            Input::Joined {
                contract_keypair,
                final_pk_hash,
            } => self.on_joined(contract_keypair, final_pk_hash),
            Input::PieceLoaded(piece_data) => self.on_piece_loaded(piece_data),
        }
    }

    pub fn announced_mode_and_terms_from_peer(&self) -> AnnouncedModeAndTerms {
        self.peer
    }

    /// Buyer side of the channel, present while downloading.
    pub fn payor(&self) -> Option<&Payor> {
        match &self.state {
            State::Buy(BuyerSide {
                state: BuyerState::Downloading { payor, .. },
                ..
            }) => Some(payor),
            _ => None,
        }
    }

    /// Seller side of the channel, present once the contract is prepared.
    pub fn payee(&self) -> Option<&Payee> {
        match &self.state {
            State::Sell(SellerSide {
                state: SellerState::ReadyForPieceRequest { payee },
                ..
            }) => Some(payee),
            _ => None,
        }
    }

    pub(crate) fn in_preparing_contract(&self) -> bool {
        matches!(
            self.state,
            State::Buy(BuyerSide {
                state: BuyerState::PreparingContract { .. },
                ..
            })
        )
    }

    /// Name of the innermost active state, for status and logging.
    pub fn inner_state_name(&self) -> &'static str {
        match &self.state {
            State::ChooseMode => "ChooseMode",
            State::Observe => "Observe",
            State::Buy(side) => match &side.state {
                BuyerState::ReadyForInvitation => "Buy/ReadyForInvitation",
                BuyerState::TestingSellerSpeed { .. } => "Buy/TestingSellerSpeed",
                BuyerState::InvitedSeller { .. } => "Buy/InvitedSeller",
                BuyerState::PreparingContract { .. } => "Buy/PreparingContract",
                BuyerState::Downloading {
                    requested,
                    validating,
                    ..
                } => {
                    if validating.is_some() {
                        "Buy/Downloading/WaitingForPieceValidation"
                    } else if requested.is_empty() {
                        "Buy/Downloading/WaitingForPiece"
                    } else {
                        "Buy/Downloading/WaitingForFullPiece"
                    }
                }
            },
            State::Sell(side) => match &side.state {
                SellerState::ReadyForInvitation => "Sell/ReadyForInvitation",
                SellerState::Invited => "Sell/Invited",
                SellerState::JoinedContract { .. } => "Sell/JoinedContract",
                SellerState::ReadyForPieceRequest { .. } => "Sell/ReadyForPieceRequest",
            },
        }
    }

    fn overflow(received: String) -> Vec<Output> {
        vec![Output::Notify(Notification::MessageOverflow(received))]
    }

    fn process_message(&mut self, message: ProtocolMessage) -> Vec<Output> {
        match message {
            ProtocolMessage::Observe => self.peer_announced(AnnouncedModeAndTerms::Observe),
            ProtocolMessage::Buy(terms) => self.peer_announced(AnnouncedModeAndTerms::Buy(terms)),
            ProtocolMessage::Sell(terms) => self.peer_announced(AnnouncedModeAndTerms::Sell(terms)),
            other => {
                if matches!(self.state, State::Buy(_)) {
                    self.buyer_message(other)
                } else if matches!(self.state, State::Sell(_)) {
                    self.seller_message(other)
                } else {
                    Self::overflow(other.to_string())
                }
            }
        }
    }

    /// Peer mode announcements are legal in every state; inside a contract
    /// a changed announcement breaks it.
    fn peer_announced(&mut self, announced: AnnouncedModeAndTerms) -> Vec<Output> {
        let previous = self.peer;
        self.peer = announced;
        let mut outputs = vec![Output::Notify(Notification::PeerAnnouncedModeAndTerms(
            announced,
        ))];
        match &mut self.state {
            State::Buy(side) => {
                let in_contract = !matches!(
                    side.state,
                    BuyerState::ReadyForInvitation | BuyerState::TestingSellerSpeed { .. }
                );
                if in_contract && announced != previous {
                    side.state = BuyerState::ReadyForInvitation;
                    outputs.push(Output::Notify(Notification::SellerInterruptedContract));
                }
            }
            State::Sell(side) => {
                let in_contract = !matches!(side.state, SellerState::ReadyForInvitation);
                if in_contract && announced != previous {
                    side.state = SellerState::ReadyForInvitation;
                    outputs.push(Output::Notify(Notification::PaymentInterrupted));
                }
            }
            State::ChooseMode | State::Observe => {}
        }
        outputs
    }

    fn buyer_message(&mut self, message: ProtocolMessage) -> Vec<Output> {
        let name = message.to_string();
        let side = match &mut self.state {
            State::Buy(side) => side,
            _ => unreachable!("buyer message dispatch outside buy mode"),
        };
        match message {
            ProtocolMessage::JoiningContract(joining) => {
                let terms = match &side.state {
                    BuyerState::InvitedSeller { terms } => *terms,
                    _ => return Self::overflow(name),
                };
                side.state = BuyerState::PreparingContract {
                    terms,
                    payee_contract_pk: joining.contract_pk,
                    payee_final_pk_hash: joining.final_pk_hash,
                };
                vec![Output::Notify(Notification::SellerJoined)]
            }
            ProtocolMessage::FullPiece(full_piece) => match &mut side.state {
                BuyerState::TestingSellerSpeed {
                    expected_payload_size,
                } => {
                    let delivered_expected_payload =
                        full_piece.piece_data.len() == *expected_payload_size as usize;
                    side.state = BuyerState::ReadyForInvitation;
                    vec![Output::Notify(Notification::SellerCompletedSpeedTest {
                        delivered_expected_payload,
                    })]
                }
                BuyerState::Downloading {
                    requested,
                    validating,
                    ..
                } if validating.is_none() && !requested.is_empty() => {
                    *validating = requested.pop_front();
                    vec![Output::Notify(Notification::ReceivedFullPiece(
                        full_piece.piece_data,
                    ))]
                }
                _ => Self::overflow(name),
            },
            _ => Self::overflow(name),
        }
    }

    fn seller_message(&mut self, message: ProtocolMessage) -> Vec<Output> {
        let name = message.to_string();
        let max_speed_test_payload = self.max_speed_test_payload;
        let side = match &mut self.state {
            State::Sell(side) => side,
            _ => unreachable!("seller message dispatch outside sell mode"),
        };
        match message {
            ProtocolMessage::Invite(_) => {
                if !matches!(side.state, SellerState::ReadyForInvitation) {
                    return Self::overflow(name);
                }
                side.state = SellerState::Invited;
                vec![Output::Notify(Notification::InvitedToJoinContract)]
            }
            ProtocolMessage::Speed(speed) => {
                // only a pre-contract probe within budget is honored
                if !matches!(side.state, SellerState::ReadyForInvitation)
                    || speed.payload_size > max_speed_test_payload
                {
                    return Self::overflow(name);
                }
                vec![
                    Output::Notify(Notification::BuyerRequestedSpeedTest {
                        payload_size: speed.payload_size,
                    }),
                    Output::Send(ProtocolMessage::FullPiece(FullPiece {
                        piece_data: PieceData::zeroes(speed.payload_size as usize),
                    })),
                ]
            }
            ProtocolMessage::Ready(ready) => {
                let (contract_keypair, final_pk_hash) = match &side.state {
                    SellerState::JoinedContract {
                        contract_keypair,
                        final_pk_hash,
                    } => (*contract_keypair, *final_pk_hash),
                    _ => return Self::overflow(name),
                };
                let payee = Payee::new(
                    side.terms.min_price,
                    side.terms.min_lock,
                    side.terms.settlement_fee,
                    ready.value,
                    ready.anchor,
                    contract_keypair,
                    final_pk_hash,
                    ready.contract_pk,
                    ready.final_pk_hash,
                );
                side.state = SellerState::ReadyForPieceRequest { payee };
                vec![Output::Notify(Notification::ContractPrepared {
                    value: ready.value,
                    anchor: ready.anchor,
                    payor_contract_pk: ready.contract_pk,
                    payor_final_pk_hash: ready.final_pk_hash,
                })]
            }
            ProtocolMessage::RequestFullPiece(request) => {
                if !matches!(side.state, SellerState::ReadyForPieceRequest { .. }) {
                    return Self::overflow(name);
                }
                if request.piece_index > side.max_piece_index {
                    vec![Output::Notify(Notification::InvalidPieceRequested(
                        request.piece_index,
                    ))]
                } else {
                    vec![Output::Notify(Notification::PieceRequested(
                        request.piece_index,
                    ))]
                }
            }
            ProtocolMessage::Payment(payment) => {
                let payee = match &mut side.state {
                    SellerState::ReadyForPieceRequest { payee } => payee,
                    _ => return Self::overflow(name),
                };
                match payee.register_payment(&payment.signature) {
                    Ok(true) => vec![Output::Notify(Notification::ValidPayment {
                        amount_paid: payee.amount_paid(),
                    })],
                    _ => vec![Output::Notify(Notification::InvalidPayment)],
                }
            }
            _ => Self::overflow(name),
        }
    }

    fn buyer_side(&mut self, context: &'static str) -> &mut BuyerSide {
        match &mut self.state {
            State::Buy(side) => side,
            _ => panic!("{} outside buy mode", context),
        }
    }

    fn seller_side(&mut self, context: &'static str) -> &mut SellerSide {
        match &mut self.state {
            State::Sell(side) => side,
            _ => panic!("{} outside sell mode", context),
        }
    }

    fn on_update_buyer_terms(&mut self, terms: BuyerTerms) -> Vec<Output> {
        let side = self.buyer_side("UpdateBuyerTerms");
        // renegotiation breaks any contract or pending test
        side.state = BuyerState::ReadyForInvitation;
        vec![Output::Send(ProtocolMessage::Buy(terms))]
    }

    fn on_update_seller_terms(&mut self, terms: SellerTerms) -> Vec<Output> {
        let side = self.seller_side("UpdateSellerTerms");
        side.terms = terms;
        side.state = SellerState::ReadyForInvitation;
        vec![Output::Send(ProtocolMessage::Sell(terms))]
    }

    fn on_invite_seller(&mut self) -> Vec<Output> {
        let peer_terms = self.peer.sell_terms();
        let side = self.buyer_side("InviteSeller");
        assert!(
            matches!(side.state, BuyerState::ReadyForInvitation),
            "InviteSeller outside ReadyForInvitation"
        );
        let terms = peer_terms.expect("inviting a peer that has not announced sell terms");
        side.state = BuyerState::InvitedSeller { terms };
        vec![Output::Send(ProtocolMessage::Invite(Invite))]
    }

    fn on_test_seller_speed(&mut self, payload_size: u32) -> Vec<Output> {
        let side = self.buyer_side("TestSellerSpeed");
        assert!(
            matches!(side.state, BuyerState::ReadyForInvitation),
            "TestSellerSpeed outside ReadyForInvitation"
        );
        side.state = BuyerState::TestingSellerSpeed {
            expected_payload_size: payload_size,
        };
        vec![Output::Send(ProtocolMessage::Speed(Speed { payload_size }))]
    }

    fn on_contract_prepared(
        &mut self,
        anchor: OutPoint,
        contract_keypair: KeyPair,
        final_pk_hash: PubkeyHash,
        value: Amount,
    ) -> Vec<Output> {
        let side = self.buyer_side("ContractPrepared");
        let (terms, payee_contract_pk, payee_final_pk_hash) = match &side.state {
            BuyerState::PreparingContract {
                terms,
                payee_contract_pk,
                payee_final_pk_hash,
            } => (*terms, *payee_contract_pk, *payee_final_pk_hash),
            _ => panic!("ContractPrepared outside PreparingContract"),
        };
        let payor = Payor::new(
            terms.min_price,
            terms.min_lock,
            terms.settlement_fee,
            value,
            anchor,
            contract_keypair,
            final_pk_hash,
            payee_contract_pk,
            payee_final_pk_hash,
        );
        side.state = BuyerState::Downloading {
            payor,
            requested: VecDeque::new(),
            validating: None,
        };
        vec![Output::Send(ProtocolMessage::Ready(Ready {
            value,
            anchor,
            contract_pk: contract_keypair.pk,
            final_pk_hash,
        }))]
    }

    fn on_request_piece(&mut self, index: u32) -> Vec<Output> {
        let side = self.buyer_side("RequestPiece");
        match &mut side.state {
            BuyerState::Downloading { requested, .. } => {
                requested.push_back(index);
                vec![Output::Send(ProtocolMessage::RequestFullPiece(
                    RequestFullPiece { piece_index: index },
                ))]
            }
            _ => panic!("RequestPiece outside Downloading"),
        }
    }

    fn on_send_payment(&mut self) -> Vec<Output> {
        let side = self.buyer_side("SendPayment");
        match &mut side.state {
            BuyerState::Downloading {
                payor,
                requested,
                validating,
            } => {
                if validating.take().is_none() {
                    // paying without an arrival: the front request is the
                    // piece being politely compensated
                    requested.pop_front();
                }
                match payor.make_payment() {
                    Ok(signature) => vec![Output::Send(ProtocolMessage::Payment(Payment {
                        signature,
                    }))],
                    Err(e) => {
                        log::error!("could not produce settlement signature: {}", e);
                        Vec::new()
                    }
                }
            }
            _ => panic!("SendPayment outside Downloading"),
        }
    }

    fn on_joined(&mut self, contract_keypair: KeyPair, final_pk_hash: PubkeyHash) -> Vec<Output> {
        let side = self.seller_side("Joined");
        assert!(
            matches!(side.state, SellerState::Invited),
            "Joined outside Invited"
        );
        side.state = SellerState::JoinedContract {
            contract_keypair,
            final_pk_hash,
        };
        vec![Output::Send(ProtocolMessage::JoiningContract(
            JoiningContract {
                contract_pk: contract_keypair.pk,
                final_pk_hash,
            },
        ))]
    }

    fn on_piece_loaded(&mut self, piece_data: PieceData) -> Vec<Output> {
        let side = self.seller_side("PieceLoaded");
        assert!(
            matches!(side.state, SellerState::ReadyForPieceRequest { .. }),
            "PieceLoaded outside ReadyForPieceRequest"
        );
        vec![Output::Send(ProtocolMessage::FullPiece(FullPiece {
            piece_data,
        }))]
    }
}
