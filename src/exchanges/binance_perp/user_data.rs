use crate::core::errors::ExchangeError;
use crate::core::types::StreamEvent;
use crate::exchanges::binance_perp::types::{
    BinancePerpAccountConfigUpdate, BinancePerpAccountUpdate, BinancePerpListenKeyExpired,
    BinancePerpMarginCall, BinancePerpOrderTradeUpdate,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

pub const ACCOUNT_CONFIG_UPDATE: &str = "ACCOUNT_CONFIG_UPDATE";
pub const MARGIN_CALL: &str = "MARGIN_CALL";
pub const ACCOUNT_UPDATE: &str = "ACCOUNT_UPDATE";
pub const ORDER_TRADE_UPDATE: &str = "ORDER_TRADE_UPDATE";
pub const LISTEN_KEY_EXPIRED: &str = "listenKeyExpired";

/// Private account event, selected by the `e` tag of the payload
#[derive(Debug, Clone)]
pub enum UserDataEvent {
    AccountConfigUpdate(BinancePerpAccountConfigUpdate),
    MarginCall(BinancePerpMarginCall),
    AccountUpdate(BinancePerpAccountUpdate),
    OrderTradeUpdate(BinancePerpOrderTradeUpdate),
    ListenKeyExpired(BinancePerpListenKeyExpired),
    /// Tag this client does not know; carried for forward compatibility
    Unknown { event_type: String, payload: Value },
}

impl UserDataEvent {
    /// Decode the inner `data` object of an account frame.
    ///
    /// Only the arm named by the tag is attempted, so a malformed payload for
    /// one event type never affects another.
    pub fn decode(data: &Value) -> Result<Self, ExchangeError> {
        let event_type = data.get("e").and_then(Value::as_str).ok_or_else(|| {
            ExchangeError::DeserializationError("Account event without 'e' tag".to_string())
        })?;

        match event_type {
            ACCOUNT_CONFIG_UPDATE => decode_arm(event_type, data).map(Self::AccountConfigUpdate),
            MARGIN_CALL => decode_arm(event_type, data).map(Self::MarginCall),
            ACCOUNT_UPDATE => decode_arm(event_type, data).map(Self::AccountUpdate),
            ORDER_TRADE_UPDATE => decode_arm(event_type, data).map(Self::OrderTradeUpdate),
            LISTEN_KEY_EXPIRED => decode_arm(event_type, data).map(Self::ListenKeyExpired),
            other => Ok(Self::Unknown {
                event_type: other.to_string(),
                payload: data.clone(),
            }),
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::AccountConfigUpdate(_) => ACCOUNT_CONFIG_UPDATE,
            Self::MarginCall(_) => MARGIN_CALL,
            Self::AccountUpdate(_) => ACCOUNT_UPDATE,
            Self::OrderTradeUpdate(_) => ORDER_TRADE_UPDATE,
            Self::ListenKeyExpired(_) => LISTEN_KEY_EXPIRED,
            Self::Unknown { event_type, .. } => event_type,
        }
    }
}

fn decode_arm<T: DeserializeOwned>(event_type: &str, data: &Value) -> Result<T, ExchangeError> {
    T::deserialize(data).map_err(|e| {
        ExchangeError::DeserializationError(format!("Failed to parse {}: {}", event_type, e))
    })
}

type Callback<T> = Box<dyn Fn(StreamEvent<T>) + Send + Sync>;

/// Caller callbacks for the account channel; any of them may be left unset
#[derive(Default)]
pub struct UserDataHandlers {
    on_config_update: Option<Callback<BinancePerpAccountConfigUpdate>>,
    on_margin_call: Option<Callback<BinancePerpMarginCall>>,
    on_account_update: Option<Callback<BinancePerpAccountUpdate>>,
    on_order_update: Option<Callback<BinancePerpOrderTradeUpdate>>,
    on_listen_key_expired: Option<Callback<BinancePerpListenKeyExpired>>,
}

impl UserDataHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_config_update(
        mut self,
        f: impl Fn(StreamEvent<BinancePerpAccountConfigUpdate>) + Send + Sync + 'static,
    ) -> Self {
        self.on_config_update = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_margin_call(
        mut self,
        f: impl Fn(StreamEvent<BinancePerpMarginCall>) + Send + Sync + 'static,
    ) -> Self {
        self.on_margin_call = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_account_update(
        mut self,
        f: impl Fn(StreamEvent<BinancePerpAccountUpdate>) + Send + Sync + 'static,
    ) -> Self {
        self.on_account_update = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_order_update(
        mut self,
        f: impl Fn(StreamEvent<BinancePerpOrderTradeUpdate>) + Send + Sync + 'static,
    ) -> Self {
        self.on_order_update = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_listen_key_expired(
        mut self,
        f: impl Fn(StreamEvent<BinancePerpListenKeyExpired>) + Send + Sync + 'static,
    ) -> Self {
        self.on_listen_key_expired = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for UserDataHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDataHandlers")
            .field("on_config_update", &self.on_config_update.is_some())
            .field("on_margin_call", &self.on_margin_call.is_some())
            .field("on_account_update", &self.on_account_update.is_some())
            .field("on_order_update", &self.on_order_update.is_some())
            .field("on_listen_key_expired", &self.on_listen_key_expired.is_some())
            .finish()
    }
}

/// Lifecycle of the account channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDataState {
    /// No listen key subscription acknowledged yet
    Unauthenticated,
    /// Listen key active, events flowing
    Subscribed,
    /// Server announced the listen key expired; renew and resubscribe
    Expired,
}

/// Result of dispatching one account frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The callback for this tag ran
    Delivered(String),
    /// Known tag, but the caller registered no callback for it
    NoHandler(String),
    /// Unrecognised tag; logged and dropped
    Unknown(String),
    /// Payload failed to decode; logged and dropped
    Malformed,
    /// Frame arrived after the listen key expired
    Ignored,
}

/// Routes account frames to the caller's callbacks by event tag
#[derive(Debug)]
pub struct UserDataDispatcher {
    handlers: UserDataHandlers,
    state: Mutex<UserDataState>,
}

impl UserDataDispatcher {
    pub fn new(handlers: UserDataHandlers) -> Self {
        Self {
            handlers,
            state: Mutex::new(UserDataState::Unauthenticated),
        }
    }

    pub fn state(&self) -> UserDataState {
        *self.state.lock()
    }

    /// Record the acknowledgement of the listen-key subscription
    pub fn mark_subscribed(&self) {
        let mut state = self.state.lock();
        if *state == UserDataState::Unauthenticated {
            *state = UserDataState::Subscribed;
        }
    }

    /// Decode one frame and fire at most one callback
    pub fn dispatch(&self, frame: &StreamEvent<serde_json::Value>) -> DispatchOutcome {
        if self.state() == UserDataState::Expired {
            debug!(topic = %frame.topic, "Dropping account frame after listen key expiry");
            return DispatchOutcome::Ignored;
        }
        // A frame can only arrive once the subscription is live
        self.mark_subscribed();

        let event = match UserDataEvent::decode(&frame.data) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, payload = %frame.data, "Couldn't deserialize account event");
                return DispatchOutcome::Malformed;
            }
        };

        let tag = event.event_type().to_string();
        let fired = match event {
            UserDataEvent::AccountConfigUpdate(data) => {
                fire(self.handlers.on_config_update.as_ref(), frame, data)
            }
            UserDataEvent::MarginCall(data) => fire(self.handlers.on_margin_call.as_ref(), frame, data),
            UserDataEvent::AccountUpdate(data) => {
                fire(self.handlers.on_account_update.as_ref(), frame, data)
            }
            UserDataEvent::OrderTradeUpdate(data) => {
                fire(self.handlers.on_order_update.as_ref(), frame, data)
            }
            UserDataEvent::ListenKeyExpired(data) => {
                *self.state.lock() = UserDataState::Expired;
                info!(topic = %frame.topic, "Listen key expired");
                fire(self.handlers.on_listen_key_expired.as_ref(), frame, data)
            }
            UserDataEvent::Unknown { event_type, .. } => {
                debug!(event_type = %event_type, "Received unknown user data event");
                return DispatchOutcome::Unknown(event_type);
            }
        };

        if fired {
            DispatchOutcome::Delivered(tag)
        } else {
            DispatchOutcome::NoHandler(tag)
        }
    }
}

fn fire<T>(callback: Option<&Callback<T>>, frame: &StreamEvent<Value>, data: T) -> bool {
    match callback {
        Some(callback) => {
            callback(frame.with_data(data));
            true
        }
        None => false,
    }
}
