//! The per-torrent session controller.
//!
//! A [Session] multiplexes many peer connections, each carrying an
//! independent buy/sell/observe protocol instance, and hosts exactly one
//! mode object (Observing / Buying / Selling) that owns the
//! cross-connection policy. The session is not thread-safe: the host
//! serializes every entry point (inbound messages, client calls and a
//! coarse [Session::tick]) and every call runs to completion
//! synchronously, invoking client callbacks inline.

pub mod callbacks;
pub mod error;
pub mod status;

mod buying;
mod connection;
mod observing;
mod piece;
mod pipeline;
mod seller;
mod selling;
mod speed_test;

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bitcoin::Transaction;

use crate::{
    machine::{ConnectionMachine, Input},
    protocol::messages::{BuyerTerms, PieceData, ProtocolMessage, SellerTerms},
};

use callbacks::{BuyingCallbacks, ObservingCallbacks, SellingCallbacks};
use connection::Connection;
use error::SessionError;
use pipeline::PieceDeliveryPipeline;

pub use buying::{StartDownloadInformation, MAX_CONCURRENT_REQUESTS};
pub use connection::SendMessage;
pub use piece::{Piece, PieceInformation, PieceState};
pub use selling::{MAX_OUTSTANDING_PAYMENTS, MAX_PIECES_TO_PRELOAD};
pub use speed_test::SpeedTestPolicy;

/// Identity of a peer connection: any cheaply copyable, hashable value
/// the host chooses (an integer, an address).
pub trait ConnectionId: Copy + Eq + Hash + Debug + 'static {}

impl<T: Copy + Eq + Hash + Debug + 'static> ConnectionId for T {}

/// Time source the session reads through; injectable for tests.
pub type Clock = Rc<dyn Fn() -> Instant>;

/// The role a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Observing,
    Buying,
    Selling,
}

/// Lifecycle state. `Stopped` implies zero connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Started,
    Paused,
}

/// Buyer-side download progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyingState {
    SendingInvitations,
    Downloading,
    DownloadCompleted,
}

/// Why a connection was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The local client asked for it.
    Client,
    SellerHasInterruptedContract,
    SellerSentInvalidPiece,
    SellerServicingPieceHasTimedOut,
    SellerMessageOverflow,
    SellerFailedSpeedTest,
    BuyerSentInvalidPayment,
    BuyerMessageOverflow,
    BuyerInterruptedPayment,
}

/// Everything a mode object needs from the session for one dispatch.
pub(crate) struct Ctx<'a, Id> {
    pub(crate) connections: &'a mut HashMap<Id, Connection<Id>>,
    pub(crate) session_state: SessionState,
    pub(crate) policy: &'a SpeedTestPolicy,
    pub(crate) now: Instant,
}

enum ModeState<Id: ConnectionId> {
    NotSet,
    Observing(observing::Observing<Id>),
    Buying(buying::Buying<Id>),
    Selling(selling::Selling<Id>),
}

/// One per-torrent session.
pub struct Session<Id: ConnectionId> {
    state: SessionState,
    connections: HashMap<Id, Connection<Id>>,
    mode: ModeState<Id>,
    speed_test_policy: SpeedTestPolicy,
    clock: Clock,
}

impl<Id: ConnectionId> Session<Id> {
    /// A stopped session with no mode chosen.
    pub fn new() -> Session<Id> {
        Session::with_clock(Rc::new(Instant::now))
    }

    pub fn with_clock(clock: Clock) -> Session<Id> {
        Session {
            state: SessionState::Stopped,
            connections: HashMap::new(),
            mode: ModeState::NotSet,
            speed_test_policy: SpeedTestPolicy::default(),
            clock,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> Option<SessionMode> {
        match self.mode {
            ModeState::NotSet => None,
            ModeState::Observing(_) => Some(SessionMode::Observing),
            ModeState::Buying(_) => Some(SessionMode::Buying),
            ModeState::Selling(_) => Some(SessionMode::Selling),
        }
    }

    pub fn number_of_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn speed_test_policy(&self) -> &SpeedTestPolicy {
        &self.speed_test_policy
    }

    pub fn speed_test_policy_mut(&mut self) -> &mut SpeedTestPolicy {
        &mut self.speed_test_policy
    }

    //// Mode transitions

    pub fn to_observe_mode(&mut self, callbacks: ObservingCallbacks<Id>) {
        self.leave_current_mode();
        self.mode = ModeState::Observing(observing::Observing::new(callbacks));
        log::info!("session mode: observing");
        self.announce_mode();
    }

    pub fn to_buy_mode(
        &mut self,
        terms: BuyerTerms,
        piece_information: Vec<PieceInformation>,
        callbacks: BuyingCallbacks<Id>,
        max_time_to_service_piece: Duration,
    ) {
        self.leave_current_mode();
        self.mode = ModeState::Buying(buying::Buying::new(
            terms,
            &piece_information,
            callbacks,
            max_time_to_service_piece,
        ));
        log::info!("session mode: buying, {} piece(s)", piece_information.len());
        self.announce_mode();
        // a started session looks for sellers among the known peers
        let now = (self.clock)();
        if self.state == SessionState::Started {
            if let ModeState::Buying(buying) = &mut self.mode {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                buying.started(&mut ctx);
            }
        }
    }

    pub fn to_sell_mode(
        &mut self,
        terms: SellerTerms,
        max_piece_index: u32,
        callbacks: SellingCallbacks<Id>,
    ) {
        self.leave_current_mode();
        self.mode = ModeState::Selling(selling::Selling::new(terms, max_piece_index, callbacks));
        log::info!("session mode: selling, max piece index {}", max_piece_index);
        self.announce_mode();
    }

    //// Lifecycle

    /// Starts a stopped or paused session.
    pub fn start(&mut self) -> Result<(), SessionError<Id>> {
        if matches!(self.mode, ModeState::NotSet) {
            return Err(SessionError::ModeIncompatibleOperation(
                "choose a mode before starting",
            ));
        }
        if self.state == SessionState::Started {
            return Err(SessionError::StateIncompatibleOperation(
                "session already started",
            ));
        }
        self.state = SessionState::Started;
        log::info!("session started");
        let now = (self.clock)();
        if let ModeState::Buying(buying) = &mut self.mode {
            let mut ctx = Ctx {
                connections: &mut self.connections,
                session_state: self.state,
                policy: &self.speed_test_policy,
                now,
            };
            buying.started(&mut ctx);
        }
        Ok(())
    }

    /// Keeps connections but suppresses new invitations and piece
    /// requests. Payments for already-delivered pieces are still honored.
    pub fn pause(&mut self) -> Result<(), SessionError<Id>> {
        if self.state != SessionState::Started {
            return Err(SessionError::StateIncompatibleOperation(
                "cannot pause while already paused/stopped",
            ));
        }
        self.state = SessionState::Paused;
        log::info!("session paused");
        Ok(())
    }

    /// Removes every connection with cause `Client` and stops.
    pub fn stop(&mut self) -> Result<(), SessionError<Id>> {
        if self.state == SessionState::Stopped {
            return Err(SessionError::StateIncompatibleOperation(
                "session already stopped",
            ));
        }
        let now = (self.clock)();
        match &mut self.mode {
            ModeState::NotSet => {}
            ModeState::Observing(observing) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                observing.stop(&mut ctx);
            }
            ModeState::Buying(buying) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                buying.stop(&mut ctx);
            }
            ModeState::Selling(selling) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                selling.stop(&mut ctx);
            }
        }
        self.state = SessionState::Stopped;
        debug_assert!(self.connections.is_empty());
        log::info!("session stopped");
        Ok(())
    }

    /// Coarse timeout hook the host calls on its own cadence.
    pub fn tick(&mut self) {
        let now = (self.clock)();
        match &mut self.mode {
            ModeState::Buying(buying) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                buying.tick(&mut ctx);
            }
            ModeState::Selling(selling) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                selling.tick(&mut ctx);
            }
            _ => {}
        }
    }

    //// Connection management

    /// Adds a connection and announces the current mode and terms on it.
    /// Returns the new connection count.
    pub fn add_connection(
        &mut self,
        id: Id,
        send: SendMessage,
    ) -> Result<usize, SessionError<Id>> {
        if self.state == SessionState::Stopped {
            return Err(SessionError::StateIncompatibleOperation(
                "cannot add a connection while stopped",
            ));
        }
        let input = match self.mode_started_input() {
            Some(input) => input,
            None => {
                return Err(SessionError::ModeIncompatibleOperation(
                    "choose a mode before adding connections",
                ))
            }
        };
        if self.connections.contains_key(&id) {
            return Err(SessionError::ConnectionAlreadyExists(id));
        }
        let machine = ConnectionMachine::new(self.speed_test_policy.max_payload_size());
        let mut connection = Connection::new(id, machine, send);
        // the first thing on the wire is our announcement
        connection.process(input);
        self.connections.insert(id, connection);
        log::info!(
            "connection {:?} added ({} connection(s))",
            id,
            self.connections.len()
        );
        Ok(self.connections.len())
    }

    /// Client-initiated removal, cause `Client`.
    pub fn remove_connection(&mut self, id: Id) -> Result<(), SessionError<Id>> {
        // checking for stopped explicitly improves feedback: when stopped,
        // every connection is already gone
        if self.state == SessionState::Stopped {
            return Err(SessionError::StateIncompatibleOperation(
                "cannot remove a connection while stopped, all connections are removed",
            ));
        }
        if !self.connections.contains_key(&id) {
            return Err(SessionError::ConnectionDoesNotExist(id));
        }
        let now = (self.clock)();
        match &mut self.mode {
            ModeState::NotSet => {}
            ModeState::Observing(observing) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                observing.remove_connection(&mut ctx, id, DisconnectCause::Client);
            }
            ModeState::Buying(buying) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                buying.remove_connection(&mut ctx, id, DisconnectCause::Client);
            }
            ModeState::Selling(selling) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                selling.remove_connection(&mut ctx, id, DisconnectCause::Client);
            }
        }
        Ok(())
    }

    /// Feeds one decoded wire message to the connection's machine and
    /// dispatches whatever it raises to the active mode.
    pub fn process_message_on_connection(
        &mut self,
        id: Id,
        message: ProtocolMessage,
    ) -> Result<(), SessionError<Id>> {
        let notifications = match self.connections.get_mut(&id) {
            Some(connection) => connection.process(Input::Message(message)),
            None => return Err(SessionError::ConnectionDoesNotExist(id)),
        };
        self.dispatch_notifications(id, notifications);
        Ok(())
    }

    //// Buying

    /// Hands over the signed funding transaction and the per-seller
    /// commitments; on success the session starts downloading.
    pub fn start_downloading(
        &mut self,
        contract_tx: &Transaction,
        downloads: HashMap<Id, StartDownloadInformation>,
    ) -> Result<(), SessionError<Id>> {
        let now = (self.clock)();
        let state = self.state;
        match &mut self.mode {
            ModeState::Buying(buying) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: state,
                    policy: &self.speed_test_policy,
                    now,
                };
                buying.start_downloading(&mut ctx, contract_tx, downloads)
            }
            _ => Err(SessionError::ModeIncompatibleOperation(
                "start_downloading requires buy mode",
            )),
        }
    }

    /// New buyer terms. Live sellers are politely compensated and dropped;
    /// invitation starts over. Funds committed to the previous contract
    /// stay locked until the host settles them.
    pub fn update_buyer_terms(&mut self, terms: BuyerTerms) -> Result<(), SessionError<Id>> {
        let now = (self.clock)();
        let state = self.state;
        match &mut self.mode {
            ModeState::Buying(buying) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: state,
                    policy: &self.speed_test_policy,
                    now,
                };
                buying.update_terms(&mut ctx, terms);
                Ok(())
            }
            _ => Err(SessionError::ModeIncompatibleOperation(
                "buyer terms require buy mode",
            )),
        }
    }

    /// Piece completed through an out-of-band source.
    pub fn piece_downloaded(&mut self, index: u32) -> Result<(), SessionError<Id>> {
        match &mut self.mode {
            ModeState::Buying(buying) => buying.piece_downloaded(index),
            _ => Err(SessionError::ModeIncompatibleOperation(
                "piece_downloaded requires buy mode",
            )),
        }
    }

    //// Selling

    /// New seller terms. Live contracts are broken; their earnings are
    /// claimed first.
    pub fn update_seller_terms(&mut self, terms: SellerTerms) -> Result<(), SessionError<Id>> {
        let now = (self.clock)();
        let state = self.state;
        match &mut self.mode {
            ModeState::Selling(selling) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: state,
                    policy: &self.speed_test_policy,
                    now,
                };
                selling.update_terms(&mut ctx, terms);
                Ok(())
            }
            _ => Err(SessionError::ModeIncompatibleOperation(
                "seller terms require sell mode",
            )),
        }
    }

    /// Data for a piece the client was asked to load. Arrival does not
    /// have to be in request order.
    pub fn piece_loaded(
        &mut self,
        id: Id,
        data: PieceData,
        index: u32,
    ) -> Result<(), SessionError<Id>> {
        if !self.connections.contains_key(&id) {
            return Err(SessionError::ConnectionDoesNotExist(id));
        }
        let now = (self.clock)();
        let state = self.state;
        match &mut self.mode {
            ModeState::Selling(selling) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: state,
                    policy: &self.speed_test_policy,
                    now,
                };
                selling.piece_loaded(&mut ctx, id, data, index);
                Ok(())
            }
            _ => Err(SessionError::ModeIncompatibleOperation(
                "piece_loaded requires sell mode",
            )),
        }
    }

    //// Status

    pub fn status(&self) -> status::Session<Id> {
        let connections = self
            .connections
            .values()
            .map(|connection| {
                let payee = connection.machine.payee();
                // the pipeline owns the loading phase on the selling side
                let servicing = connection.pipeline.len()
                    > connection.pipeline.number_waiting_for_payment();
                let state_name = if payee.is_some() && servicing {
                    "Sell/LoadingPiece"
                } else {
                    connection.machine.inner_state_name()
                };
                status::Connection {
                    id: connection.id,
                    state_name,
                    announced_mode_and_terms_from_peer: connection
                        .machine
                        .announced_mode_and_terms_from_peer(),
                    payor: connection.machine.payor().cloned(),
                    payee: payee.cloned(),
                    speed_test_latency: connection.speed_test_duration(),
                }
            })
            .collect();
        status::Session {
            mode: self.mode(),
            state: self.state,
            connections,
            buying: match &self.mode {
                ModeState::Buying(buying) => Some(buying.status()),
                _ => None,
            },
            selling: match &self.mode {
                ModeState::Selling(selling) => Some(selling.status()),
                _ => None,
            },
        }
    }

    //// Internals

    fn mode_started_input(&self) -> Option<Input> {
        match &self.mode {
            ModeState::NotSet => None,
            ModeState::Observing(_) => Some(Input::ObserveModeStarted),
            ModeState::Buying(buying) => Some(Input::BuyModeStarted(buying.terms())),
            ModeState::Selling(selling) => Some(Input::SellModeStarted {
                terms: selling.terms(),
                max_piece_index: selling.max_piece_index(),
            }),
        }
    }

    /// Announces the (new) mode on every connection; pipelines from the
    /// previous mode are meaningless and reset.
    fn announce_mode(&mut self) {
        let input = match self.mode_started_input() {
            Some(input) => input,
            None => return,
        };
        for connection in self.connections.values_mut() {
            connection.pipeline = PieceDeliveryPipeline::new();
            connection.process(input.clone());
        }
    }

    fn leave_current_mode(&mut self) {
        let now = (self.clock)();
        match &mut self.mode {
            ModeState::Buying(buying) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                buying.leaving(&mut ctx);
            }
            ModeState::Selling(selling) => {
                let mut ctx = Ctx {
                    connections: &mut self.connections,
                    session_state: self.state,
                    policy: &self.speed_test_policy,
                    now,
                };
                selling.leaving(&mut ctx);
            }
            _ => {}
        }
    }

    /// Routes machine notifications to the active mode. Returns false as
    /// soon as a handler drops the connection; remaining notifications
    /// are discarded with it.
    fn dispatch_notifications(
        &mut self,
        id: Id,
        notifications: Vec<crate::machine::Notification>,
    ) -> bool {
        let now = (self.clock)();
        for notification in notifications {
            let mut ctx = Ctx {
                connections: &mut self.connections,
                session_state: self.state,
                policy: &self.speed_test_policy,
                now,
            };
            let live = match &mut self.mode {
                ModeState::NotSet => true,
                ModeState::Observing(observing) => observing.handle(&mut ctx, id, notification),
                ModeState::Buying(buying) => buying.handle(&mut ctx, id, notification),
                ModeState::Selling(selling) => selling.handle(&mut ctx, id, notification),
            };
            if !live {
                return false;
            }
        }
        true
    }
}

impl<Id: ConnectionId> Default for Session<Id> {
    fn default() -> Session<Id> {
        Session::new()
    }
}
