//! Observe-mode end-to-end scenarios.

mod test_framework;

use pieceswap::machine::AnnouncedModeAndTerms;
use pieceswap::protocol::messages::ProtocolMessage;
use pieceswap::session::{error::SessionError, DisconnectCause, Session, SessionMode, SessionState};

use test_framework::*;

#[test]
fn test_observe_handshake() {
    let spy = Spy::new();
    let (_, clock) = test_clock();
    let mut session: Session<Id> = Session::with_clock(clock);
    session.to_observe_mode(spy.observing_callbacks());
    session.start().unwrap();

    assert_eq!(session.add_connection(1, spy.sender(1)).unwrap(), 1);
    assert_eq!(spy.sent_on(1), vec![ProtocolMessage::Observe]);

    session
        .process_message_on_connection(1, ProtocolMessage::Sell(seller_terms()))
        .unwrap();
    let status = session.status();
    assert_eq!(status.mode, Some(SessionMode::Observing));
    assert_eq!(
        status.connection(1).unwrap().announced_mode_and_terms_from_peer,
        AnnouncedModeAndTerms::Sell(seller_terms())
    );

    session.remove_connection(1).unwrap();
    assert_eq!(
        spy.drain_events(),
        vec![CallbackEvent::RemovedConnection(1, DisconnectCause::Client)]
    );
    assert_eq!(session.number_of_connections(), 0);
}

#[test]
fn test_lifecycle_guards() {
    let spy = Spy::new();
    let mut session: Session<Id> = Session::new();

    // no mode chosen yet
    assert!(matches!(
        session.start(),
        Err(SessionError::ModeIncompatibleOperation(_))
    ));

    session.to_observe_mode(spy.observing_callbacks());

    // stopped sessions hold no connections
    assert!(matches!(
        session.add_connection(1, spy.sender(1)),
        Err(SessionError::StateIncompatibleOperation(_))
    ));
    assert!(matches!(
        session.stop(),
        Err(SessionError::StateIncompatibleOperation(_))
    ));

    session.start().unwrap();
    assert!(session.start().is_err());

    session.add_connection(1, spy.sender(1)).unwrap();
    assert!(matches!(
        session.add_connection(1, spy.sender(1)),
        Err(SessionError::ConnectionAlreadyExists(1))
    ));
    assert!(matches!(
        session.remove_connection(9),
        Err(SessionError::ConnectionDoesNotExist(9))
    ));

    session.pause().unwrap();
    assert!(session.pause().is_err());
    // paused sessions still accept connections
    session.add_connection(2, spy.sender(2)).unwrap();

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.number_of_connections(), 0);
    // connection removal order is unspecified between connections
    let removed = removals(&spy.drain_events());
    assert_eq!(removed.len(), 2);
    assert!(removed.contains(&(1, DisconnectCause::Client)));
    assert!(removed.contains(&(2, DisconnectCause::Client)));
}

#[test]
fn test_buying_call_on_observing_session_is_rejected() {
    let spy = Spy::new();
    let mut session: Session<Id> = Session::new();
    session.to_observe_mode(spy.observing_callbacks());
    session.start().unwrap();

    assert!(matches!(
        session.update_buyer_terms(buyer_terms()),
        Err(SessionError::ModeIncompatibleOperation(_))
    ));
    assert!(matches!(
        session.piece_downloaded(0),
        Err(SessionError::ModeIncompatibleOperation(_))
    ));
}
