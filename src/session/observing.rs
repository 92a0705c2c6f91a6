//! Observing mode: accepts connections and relays peer announcements,
//! nothing else.

use crate::machine::{AnnouncedModeAndTerms, Notification};

use super::{callbacks::ObservingCallbacks, Ctx, DisconnectCause};

pub(crate) struct Observing<Id> {
    callbacks: ObservingCallbacks<Id>,
}

impl<Id: super::ConnectionId> Observing<Id> {
    pub(crate) fn new(callbacks: ObservingCallbacks<Id>) -> Observing<Id> {
        Observing { callbacks }
    }

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
            Notification::MessageOverflow(received) => {
                log::error!("connection {:?}: unexpected {} while observing", id, received);
                let cause = match ctx
                    .connections
                    .get(&id)
                    .map(|c| c.machine.announced_mode_and_terms_from_peer())
                {
                    Some(AnnouncedModeAndTerms::Buy(_)) => DisconnectCause::BuyerMessageOverflow,
                    _ => DisconnectCause::SellerMessageOverflow,
                };
                self.remove_connection(ctx, id, cause);
                false
            }
            other => {
                log::warn!(
                    "connection {:?}: ignoring notification {:?} while observing",
                    id,
                    other
                );
                true
            }
        }
    }

    pub(crate) fn remove_connection(&mut self, ctx: &mut Ctx<Id>, id: Id, cause: DisconnectCause) {
        if ctx.connections.remove(&id).is_some() {
            log::info!("connection {:?} removed: {:?}", id, cause);
            (self.callbacks.removed_connection)(id, cause);
        }
    }

    pub(crate) fn stop(&mut self, ctx: &mut Ctx<Id>) {
        let ids: Vec<Id> = ctx.connections.keys().copied().collect();
        for id in ids {
            self.remove_connection(ctx, id, DisconnectCause::Client);
        }
    }
}
