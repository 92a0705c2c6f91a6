//! One peer connection: the wire state machine plus the seller-side
//! delivery pipeline and speed-test bookkeeping.

use std::time::{Duration, Instant};

use crate::{
    machine::{ConnectionMachine, Input, Notification, Output},
    protocol::messages::ProtocolMessage,
};

use super::pipeline::PieceDeliveryPipeline;

/// Transport output slot for one connection.
pub type SendMessage = Box<dyn FnMut(ProtocolMessage)>;

pub(crate) struct Connection<Id> {
    pub(crate) id: Id,
    pub(crate) machine: ConnectionMachine,
    pub(crate) pipeline: PieceDeliveryPipeline,
    send: SendMessage,
    // buyer: when the test request went out / the payload came back
    // seller: when the test request arrived
    pub(crate) started_speed_test_at: Option<Instant>,
    pub(crate) completed_speed_test_at: Option<Instant>,
}

impl<Id: Copy + std::fmt::Debug> Connection<Id> {
    pub(crate) fn new(id: Id, machine: ConnectionMachine, send: SendMessage) -> Connection<Id> {
        Connection {
            id,
            machine,
            pipeline: PieceDeliveryPipeline::new(),
            send,
            started_speed_test_at: None,
            completed_speed_test_at: None,
        }
    }

    /// Runs one input through the machine. Outbound messages go straight
    /// to the transport in emission order; session-facing notifications
    /// come back to the caller for dispatch.
    pub(crate) fn process(&mut self, input: Input) -> Vec<Notification> {
        let outputs = self.machine.process(input);
        let mut notifications = Vec::new();
        for output in outputs {
            match output {
                Output::Send(message) => {
                    log::trace!("connection {:?} ==> {}", self.id, message);
                    (self.send)(message);
                }
                Output::Notify(notification) => notifications.push(notification),
            }
        }
        notifications
    }

    pub(crate) fn starting_speed_test(&mut self, now: Instant) {
        self.started_speed_test_at = Some(now);
        self.completed_speed_test_at = None;
    }

    pub(crate) fn completed_speed_test(&mut self, now: Instant) {
        self.completed_speed_test_at = Some(now);
    }

    pub(crate) fn has_completed_speed_test(&self) -> bool {
        self.completed_speed_test_at.is_some()
    }

    /// Time the test payload took to deliver, once completed.
    pub(crate) fn speed_test_duration(&self) -> Option<Duration> {
        match (self.started_speed_test_at, self.completed_speed_test_at) {
            (Some(started), Some(completed)) => Some(completed.duration_since(started)),
            _ => None,
        }
    }
}
