use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use benchlink_codec::Packet;
use futures_util::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::consumer::PacketConsumer;

/// Fans decoded packets out to consumers, then to broadcast subscribers.
pub(crate) struct Dispatcher {
    consumers: Vec<Arc<dyn PacketConsumer>>,
    broadcast: broadcast::Sender<Packet>,
}

impl Dispatcher {
    pub(crate) fn new(consumers: Vec<Arc<dyn PacketConsumer>>, capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity);
        Self {
            consumers,
            broadcast,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.broadcast.subscribe()
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Deliver `packet` to every consumer in registration order.
    pub(crate) async fn dispatch(&self, packet: Packet) {
        for consumer in &self.consumers {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| consumer.on_packet(&packet)));
            let outcome = match call {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(consumer = consumer.name(), error = %e, "consumer failed, continuing");
                }
                Err(_) => {
                    warn!(consumer = consumer.name(), "consumer panicked, continuing");
                }
            }
        }
        // No subscribers is not an error.
        let _ = self.broadcast.send(packet);
    }

    /// Dispose every consumer in registration order.
    pub(crate) async fn dispose(&self) {
        for consumer in &self.consumers {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| consumer.dispose()));
            let outcome = match call {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            if outcome.is_err() {
                warn!(consumer = consumer.name(), "consumer panicked during dispose");
            } else {
                debug!(consumer = consumer.name(), "consumer disposed");
            }
        }
    }
}
