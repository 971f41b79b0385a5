use crate::core::errors::{ExchangeError, UNKNOWN_ERROR_CODE};
use crate::core::kernel::signer::{canonical_params, ParameterPosition, SignedRequest, Signer};
use crate::core::kernel::time_sync::{ServerClock, TimeSyncState};
use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{instrument, trace, warn};

/// How a request is authenticated
#[derive(Clone, Copy)]
pub enum Signing<'a> {
    /// No signature; the API-key header is still attached when configured
    Unsigned,
    /// Timestamped and signed, using `clock` to keep the offset fresh
    Signed(&'a dyn ServerClock),
}

impl Signing<'_> {
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed(_))
    }
}

/// REST client trait for making HTTP requests
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Send a request and return the JSON body
    ///
    /// # Arguments
    /// * `method` - HTTP method; decides whether parameters go in the query or the body
    /// * `endpoint` - The API endpoint path
    /// * `params` - Unordered request parameters
    /// * `signing` - Whether and how to sign
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &HashMap<String, String>,
        signing: Signing<'_>,
    ) -> Result<Value, ExchangeError>;

    /// Send a request with strongly-typed response
    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: &HashMap<String, String>,
        signing: Signing<'_>,
    ) -> Result<T, ExchangeError> {
        let value = self.request(method, endpoint, params, signing).await?;
        serde_json::from_value(value).map_err(|e| {
            ExchangeError::DeserializationError(format!("Failed to deserialize JSON: {}", e))
        })
    }
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Exchange name for logging and tracing
    pub exchange_name: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl RestClientConfig {
    pub fn new(base_url: String, exchange_name: String) -> Self {
        Self {
            base_url,
            exchange_name,
            timeout_seconds: 30,
            user_agent: "LotusX/1.0".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    time_sync: Option<Arc<TimeSyncState>>,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
            time_sync: None,
        }
    }

    /// Set the signer for authenticated requests
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Share a clock-offset state with other clients of the same account
    pub fn with_time_sync(mut self, time_sync: Arc<TimeSyncState>) -> Self {
        self.time_sync = Some(time_sync);
        self
    }

    pub fn build(self) -> Result<ReqwestRest, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(self.config.timeout_seconds))
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| {
                ExchangeError::ConfigurationError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
            time_sync: self
                .time_sync
                .unwrap_or_else(|| Arc::new(TimeSyncState::disabled())),
        })
    }
}

/// Implementation of `RestClient` using reqwest
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    time_sync: Arc<TimeSyncState>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .field("time_sync", &self.time_sync)
            .finish_non_exhaustive()
    }
}

/// Error body returned by the server on a rejected request
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i32,
    msg: String,
}

impl ReqwestRest {
    pub fn time_sync(&self) -> &Arc<TimeSyncState> {
        &self.time_sync
    }

    fn build_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.config.base_url, path_and_query)
    }

    fn unsigned_request(
        method: &Method,
        endpoint: &str,
        params: &HashMap<String, String>,
    ) -> SignedRequest {
        let ordered = canonical_params(params);
        let (query, body) = match ParameterPosition::for_method(method) {
            ParameterPosition::InUri => (ordered, Vec::new()),
            ParameterPosition::InBody => (Vec::new(), ordered),
        };
        SignedRequest {
            method: method.clone(),
            endpoint: endpoint.to_string(),
            query,
            body,
            headers: HashMap::new(),
            signature: None,
        }
    }

    /// Handle the response and extract JSON
    #[instrument(skip(self, response), fields(exchange = %self.config.exchange_name, status = %response.status()))]
    async fn handle_response(&self, response: Response) -> Result<Value, ExchangeError> {
        let status = response.status();
        let response_text = response.text().await.map_err(|e| {
            ExchangeError::NetworkError(format!("Failed to read response body: {}", e))
        })?;

        trace!("Response body: {}", response_text);

        if status.is_success() {
            if response_text.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&response_text).map_err(|e| {
                ExchangeError::DeserializationError(format!("Failed to parse JSON response: {}", e))
            })
        } else {
            match serde_json::from_str::<ErrorBody>(&response_text) {
                Ok(body) => Err(ExchangeError::ApiError {
                    code: body.code,
                    message: body.msg,
                }),
                Err(_) if status.is_server_error() => Err(ExchangeError::ApiError {
                    code: UNKNOWN_ERROR_CODE,
                    message: response_text,
                }),
                Err(_) => Err(ExchangeError::ApiError {
                    code: status.as_u16() as i32,
                    message: response_text,
                }),
            }
        }
    }

    async fn send(&self, prepared: &SignedRequest) -> Result<Value, ExchangeError> {
        let url = self.build_url(&prepared.path_and_query());
        let mut request = self.client.request(prepared.method.clone(), &url);

        for (key, value) in &prepared.headers {
            request = request.header(key, value);
        }

        // Sent verbatim; the signature covers exactly these bytes
        if !prepared.body.is_empty() {
            request = request
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(prepared.body_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::NetworkError(format!("Request failed: {}", e)))?;

        self.handle_response(response).await
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    #[instrument(skip(self, params, signing), fields(exchange = %self.config.exchange_name, method = %method, endpoint = %endpoint, signed = signing.is_signed()))]
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &HashMap<String, String>,
        signing: Signing<'_>,
    ) -> Result<Value, ExchangeError> {
        let Signing::Signed(clock) = signing else {
            let prepared = match &self.signer {
                Some(signer) => signer.sign_request(&method, endpoint, params, false, 0)?,
                None => Self::unsigned_request(&method, endpoint, params),
            };
            return self.send(&prepared).await;
        };

        let signer = self.signer.as_ref().ok_or_else(|| {
            ExchangeError::AuthError("Authentication required but no signer provided".to_string())
        })?;

        let lease = self.time_sync.lease(clock).await?;
        let prepared =
            signer.sign_request(&method, endpoint, params, true, lease.timestamp_ms())?;

        match self.send(&prepared).await {
            Err(e) if e.is_stale_timestamp() => {
                if self.time_sync.invalidate(lease.epoch) {
                    warn!(offset_ms = lease.offset_ms, "Request timestamp rejected as stale");
                }
                Err(e)
            }
            other => other,
        }
    }
}
