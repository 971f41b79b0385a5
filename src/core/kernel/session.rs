use crate::core::config::ClientOptions;
use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::{ControlMethod, ControlRequest, WsCodec};
use crate::core::kernel::correlator::Correlator;
use crate::core::kernel::registry::{FrameHandler, SubscriptionInfo, SubscriptionRegistry};
use crate::core::kernel::router::StreamRouter;
use crate::core::kernel::ws::{WsConnector, WsSink, WsStream};
use crate::core::types::SubscriptionId;
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One shared socket multiplexing many logical subscriptions.
///
/// A single reader task decodes and routes inbound frames in wire order; a
/// writer task drains the outbound queue. Subscribe and unsubscribe calls wait
/// on their own acknowledgement without ever blocking the reader.
pub struct StreamSession<C: WsCodec> {
    exchange_name: String,
    codec: Arc<C>,
    registry: Arc<SubscriptionRegistry>,
    correlator: Arc<Correlator>,
    outbound: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    response_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: WsCodec> StreamSession<C> {
    /// Connect and start the reader and writer tasks
    #[instrument(skip(connector, codec, options, exchange_name), fields(exchange = %exchange_name))]
    pub async fn connect(
        connector: &dyn WsConnector,
        url: &str,
        codec: C,
        options: &ClientOptions,
        exchange_name: &str,
    ) -> Result<Self, ExchangeError> {
        let (sink, stream) = connector.connect(url).await?;
        Ok(Self::start(sink, stream, codec, options, exchange_name))
    }

    /// Drive an already connected socket
    pub fn start(
        sink: WsSink,
        stream: WsStream,
        codec: C,
        options: &ClientOptions,
        exchange_name: &str,
    ) -> Self {
        let codec = Arc::new(codec);
        let registry = Arc::new(SubscriptionRegistry::new());
        let correlator = Arc::new(Correlator::new());
        let shutdown = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(options.outbound_buffer.max(1));

        let router = StreamRouter::new(codec.clone(), registry.clone(), correlator.clone());
        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            shutdown.clone(),
            correlator.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            stream,
            router,
            outbound.clone(),
            shutdown.clone(),
            correlator.clone(),
        ));

        Self {
            exchange_name: exchange_name.to_string(),
            codec,
            registry,
            correlator,
            outbound,
            shutdown,
            response_timeout: options.socket_response_timeout,
            tasks: Mutex::new(vec![writer, reader]),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.registry.info(id)
    }

    /// Subscribe `handler` to `topics` and wait for the server's acknowledgement.
    ///
    /// The subscription receives frames only once acknowledged. Cancelling
    /// `cancel` abandons the wait; the entry is removed and no UNSUBSCRIBE is
    /// sent even if the SUBSCRIBE frame already went out.
    #[instrument(skip(self, handler, cancel), fields(exchange = %self.exchange_name))]
    pub async fn subscribe(
        &self,
        topics: Vec<String>,
        handler: FrameHandler,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError> {
        if self.is_closed() {
            return Err(ExchangeError::ConnectionClosed);
        }
        if cancel.is_cancelled() {
            return Err(ExchangeError::Cancelled(
                "subscribe cancelled before sending".to_string(),
            ));
        }

        let sub_id = self.registry.allocate_id();
        let request_id = self.correlator.next_id();
        self.registry
            .insert_pending(sub_id, topics.clone(), handler, request_id)?;
        let pending = self.correlator.register(request_id);

        let request = ControlRequest {
            id: request_id,
            method: ControlMethod::Subscribe,
            topics,
        };
        if let Err(e) = self.send_control(&request).await {
            self.registry.remove(sub_id);
            return Err(e);
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.registry.remove(sub_id);
                debug!(subscription = %sub_id, request_id, "Subscribe cancelled while awaiting acknowledgement");
                return Err(ExchangeError::Cancelled(format!(
                    "subscribe request {} cancelled",
                    request_id
                )));
            }
            outcome = pending.wait(self.response_timeout) => outcome,
        };

        match outcome {
            Ok(()) => {
                if self.registry.activate(sub_id) {
                    info!(subscription = %sub_id, request_id, topics = ?request.topics, "Subscription active");
                    Ok(sub_id)
                } else {
                    Err(ExchangeError::Cancelled(format!(
                        "{} was removed before its acknowledgement",
                        sub_id
                    )))
                }
            }
            Err(e) => {
                self.registry.remove(sub_id);
                warn!(subscription = %sub_id, request_id, error = %e, "Subscription failed");
                Err(e)
            }
        }
    }

    /// Tear down one subscription.
    ///
    /// Local bookkeeping is removed first, so no frame is delivered to the
    /// handler after this is called. A missing acknowledgement is logged and
    /// treated as success; a server rejection is returned after local removal.
    #[instrument(skip(self), fields(exchange = %self.exchange_name))]
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ExchangeError> {
        let Some(info) = self.registry.remove(id) else {
            debug!(subscription = %id, "Unsubscribe for unknown subscription");
            return Ok(());
        };
        info!(subscription = %id, topics = ?info.topics, "Subscription removed");
        self.send_unsubscribe(info.topics).await
    }

    /// Tear down every subscription, pending or active. Returns how many were
    /// removed; remote failures are logged, not returned.
    #[instrument(skip(self), fields(exchange = %self.exchange_name))]
    pub async fn unsubscribe_all(&self) -> Result<usize, ExchangeError> {
        let drained = self.registry.drain();
        let count = drained.len();
        if count == 0 {
            return Ok(0);
        }

        let results = join_all(
            drained
                .into_iter()
                .map(|info| self.send_unsubscribe(info.topics)),
        )
        .await;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Unsubscribe rejected during unsubscribe_all");
            }
        }

        info!(count, "All subscriptions removed");
        Ok(count)
    }

    /// Shut the connection down. Pending acknowledgements fail with
    /// `ConnectionClosed` and all subscriptions are dropped.
    #[instrument(skip(self), fields(exchange = %self.exchange_name))]
    pub async fn close(&self) -> Result<(), ExchangeError> {
        self.shutdown.cancel();
        self.registry.drain();
        self.correlator.fail_all();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Socket task ended abnormally");
            }
        }
        info!("Connection closed");
        Ok(())
    }

    async fn send_unsubscribe(&self, topics: Vec<String>) -> Result<(), ExchangeError> {
        if self.is_closed() {
            return Ok(());
        }

        let request_id = self.correlator.next_id();
        let pending = self.correlator.register(request_id);
        let request = ControlRequest {
            id: request_id,
            method: ControlMethod::Unsubscribe,
            topics,
        };
        match self.send_control(&request).await {
            Ok(()) => {}
            Err(ExchangeError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        }

        match pending.wait(self.response_timeout).await {
            Ok(()) => Ok(()),
            Err(ExchangeError::SubscriptionTimeout { id, timeout_ms }) => {
                warn!(
                    request_id = id,
                    timeout_ms,
                    topics = ?request.topics,
                    "No acknowledgement for unsubscribe, local state already removed"
                );
                Ok(())
            }
            Err(ExchangeError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_control(&self, request: &ControlRequest) -> Result<(), ExchangeError> {
        let message = self.codec.encode_control(request)?;
        debug!(request_id = request.id, method = %request.method, "Sending control frame");
        self.outbound
            .send(message)
            .await
            .map_err(|_| ExchangeError::ConnectionClosed)
    }
}

impl<C: WsCodec> Drop for StreamSession<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
    correlator: Arc<Correlator>,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            next = outbound.recv() => match next {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        warn!(error = %e, "Socket write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
    shutdown.cancel();
    correlator.fail_all();
}

async fn read_loop<C: WsCodec>(
    mut stream: WsStream,
    router: StreamRouter<C>,
    outbound: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    correlator: Arc<Correlator>,
) {
    // Runs on every exit, unwinding included
    let _closing = ClosingGuard {
        shutdown: shutdown.clone(),
        correlator,
    };
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Ping(data))) => {
                if outbound.try_send(Message::Pong(data)).is_err() {
                    warn!("Failed to queue pong response");
                }
            }
            Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                info!(frame = ?frame, "Server closed the connection");
                break;
            }
            Some(Ok(message)) => {
                router.handle_message(&message);
            }
            Some(Err(e)) => {
                warn!(error = %e, "Socket read failed");
                break;
            }
            None => break,
        }
    }
}

/// Marks the connection closed and fails pending waiters when dropped
struct ClosingGuard {
    shutdown: CancellationToken,
    correlator: Arc<Correlator>,
}

impl Drop for ClosingGuard {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.correlator.fail_all();
    }
}
