use crate::core::kernel::codec::{InboundFrame, WsCodec};
use crate::core::kernel::correlator::Correlator;
use crate::core::kernel::registry::SubscriptionRegistry;
use crate::core::types::{StreamEvent, SubscriptionId};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

/// What the router did with one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Acknowledgement handed to its waiter
    Acknowledged(u64),
    /// Acknowledgement nobody was waiting for (late or unknown id)
    UnmatchedAck(u64),
    /// Data frame delivered to one subscription
    Delivered(SubscriptionId),
    /// The subscription's handler panicked; the frame is dropped and routing
    /// continues
    HandlerPanicked(SubscriptionId),
    /// Data frame for a topic with no active subscription
    Unrouted(String),
    /// Frame without a stream name, or ignored by the codec
    Ignored,
    /// Frame that could not be decoded
    Malformed,
}

/// Read-path dispatcher for one connection.
///
/// Decodes each inbound message and hands it to exactly one consumer: the
/// correlator for control replies, or the handler of the subscription whose
/// topic set contains the frame's stream name. Must be driven from a single
/// task so delivery order matches wire order.
pub struct StreamRouter<C: WsCodec> {
    codec: Arc<C>,
    registry: Arc<SubscriptionRegistry>,
    correlator: Arc<Correlator>,
}

impl<C: WsCodec> StreamRouter<C> {
    pub fn new(
        codec: Arc<C>,
        registry: Arc<SubscriptionRegistry>,
        correlator: Arc<Correlator>,
    ) -> Self {
        Self {
            codec,
            registry,
            correlator,
        }
    }

    pub fn handle_message(&self, message: &Message) -> RouteOutcome {
        match self.codec.decode_message(message) {
            Ok(Some(frame)) => self.route(frame),
            Ok(None) => RouteOutcome::Ignored,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                RouteOutcome::Malformed
            }
        }
    }

    pub fn route(&self, frame: InboundFrame) -> RouteOutcome {
        match frame {
            InboundFrame::Ack(ack) => {
                let id = ack.id;
                if self.correlator.resolve(id, ack.outcome) {
                    trace!(id, "Control acknowledgement delivered");
                    RouteOutcome::Acknowledged(id)
                } else {
                    debug!(id, "Acknowledgement without a waiter, dropping");
                    RouteOutcome::UnmatchedAck(id)
                }
            }
            InboundFrame::Data { stream, payload } => {
                match self.registry.active_handler(&stream) {
                    Some((id, handler)) => {
                        // Registry lock is already released here
                        let event = StreamEvent::new(stream, payload);
                        match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                            Ok(()) => RouteOutcome::Delivered(id),
                            Err(_) => {
                                warn!(
                                    subscription = %id,
                                    stream = %event.topic,
                                    "Subscription handler panicked, dropping frame"
                                );
                                RouteOutcome::HandlerPanicked(id)
                            }
                        }
                    }
                    None => {
                        trace!(stream = %stream, "No active subscription for stream");
                        RouteOutcome::Unrouted(stream)
                    }
                }
            }
            InboundFrame::Other(value) => {
                trace!(frame = %value, "Ignoring frame without stream name");
                RouteOutcome::Ignored
            }
        }
    }
}
