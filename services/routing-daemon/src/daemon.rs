//! The message loop.
//!
//! One task owns the bus, the router and the reconcile clock. Each iteration
//! waits for a message for at most the time left until the next reconcile
//! tick, disposes of whatever arrived, then runs the tick if it is due.

use std::time::Duration;

use lbr_reconcile::ReconcileClock;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, InboundMessage, MessageBus};
use crate::router::EventRouter;

/// What happened to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed, or permanently unprocessable.
    Ack,
    /// Not applied; the broker should redeliver it.
    Nack,
    /// Left alone (no message id to answer with).
    Drop,
}

pub struct Daemon<B> {
    bus: B,
    router: EventRouter,
    clock: ReconcileClock,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl<B: MessageBus> Daemon<B> {
    pub fn new(bus: B, router: EventRouter, interval: Duration) -> Self {
        Self {
            bus,
            router,
            clock: ReconcileClock::new(interval, now()),
        }
    }

    /// Decode and route one message, deciding its disposition.
    pub async fn handle_message(&mut self, message: &InboundMessage) -> Disposition {
        let Some(message_id) = message.message_id.as_deref() else {
            warn!(
                destination = ?message.destination,
                "Message has no message-id; dropping it"
            );
            return Disposition::Drop;
        };

        let event = match lbr_events::decode(&message.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(message_id, error = %e, "Discarding undecodable message");
                return Disposition::Ack;
            }
        };

        let summary = event.summary();
        debug!(message_id, event = %summary, "Received event");

        match self.router.route(&event).await {
            Ok(()) => Disposition::Ack,
            Err(e) if e.is_retryable() => {
                error!(
                    message_id,
                    event = %summary,
                    error = %e,
                    "Handling event failed; requesting redelivery"
                );
                Disposition::Nack
            }
            Err(e) => {
                warn!(
                    message_id,
                    event = %summary,
                    error = %e,
                    "Event cannot be applied; discarding it"
                );
                Disposition::Ack
            }
        }
    }

    /// Run the reconcile tick if an interval has elapsed since the last one.
    pub async fn reconcile_if_due(&mut self) {
        if !self.clock.is_due(now()) {
            return;
        }

        let pending = self.router.controller().pending();
        debug!(pending, "Reconciling");
        if let Err(e) = self.router.reconcile().await {
            error!(error = %e, "Reconciliation failed");
        }
        self.clock.mark(now());
    }

    async fn dispose(&mut self, message: &InboundMessage, disposition: Disposition) {
        let result = match disposition {
            Disposition::Ack => self.bus.ack(message).await,
            Disposition::Nack => self.bus.nack(message).await,
            Disposition::Drop => return,
        };

        if let Err(e) = result {
            warn!(
                message_id = ?message.message_id,
                disposition = ?disposition,
                error = %e,
                "Answering message failed; broker will redeliver"
            );
        }
    }

    /// Loop until `shutdown` flips to true, then close the bus.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.clock.interval().as_secs(),
            strategy = %self.router.controller().strategy(),
            "Listening for routing events"
        );

        while !*shutdown.borrow() {
            let wait = self.clock.remaining(now());

            let received = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = self.bus.receive(wait) => received,
            };

            match received {
                Ok(Some(message)) => {
                    let disposition = self.handle_message(&message).await;
                    self.dispose(&message, disposition).await;
                }
                Ok(None) => {}
                Err(BusError::Closed) => {
                    error!("Message bus closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Receiving from message bus failed");
                }
            }

            self.reconcile_if_due().await;
        }

        info!("Shutting down");
        self.bus.close().await;
    }
}
