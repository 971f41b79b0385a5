use crate::core::config::Credentials;
use crate::core::errors::ExchangeError;
use crate::core::kernel::signer::{
    canonical_params, encode_params, hmac_sha256_hex, ParameterPosition, SignedRequest,
};
use crate::core::kernel::Signer;
use reqwest::Method;
use std::collections::HashMap;

pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// HMAC-SHA256 signer for the USD-M futures API.
///
/// Signed requests get `timestamp` (unless the caller set one) and the optional
/// `recvWindow`, are sorted by key, and carry `signature` as the last parameter
/// of whichever half, query or body, the method puts them in.
pub struct BinancePerpSigner {
    credentials: Credentials,
    receive_window_ms: Option<u64>,
}

impl BinancePerpSigner {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            receive_window_ms: None,
        }
    }

    #[must_use]
    pub fn with_receive_window(mut self, receive_window_ms: Option<u64>) -> Self {
        self.receive_window_ms = receive_window_ms;
        self
    }
}

impl std::fmt::Debug for BinancePerpSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinancePerpSigner")
            .field("credentials", &self.credentials)
            .field("receive_window_ms", &self.receive_window_ms)
            .finish()
    }
}

impl Signer for BinancePerpSigner {
    fn sign_request(
        &self,
        method: &Method,
        endpoint: &str,
        params: &HashMap<String, String>,
        signed: bool,
        timestamp: i64,
    ) -> Result<SignedRequest, ExchangeError> {
        let mut headers = HashMap::new();
        headers.insert(
            API_KEY_HEADER.to_string(),
            self.credentials.api_key().to_string(),
        );

        let mut ordered = if signed {
            let mut params = params.clone();
            params
                .entry("timestamp".to_string())
                .or_insert_with(|| timestamp.to_string());
            if let Some(window) = self.receive_window_ms {
                params.insert("recvWindow".to_string(), window.to_string());
            }
            canonical_params(&params)
        } else {
            canonical_params(params)
        };

        let signature = if signed {
            let payload = encode_params(&ordered);
            let signature = hmac_sha256_hex(self.credentials.secret_key(), &payload)?;
            ordered.push(("signature".to_string(), signature.clone()));
            Some(signature)
        } else {
            None
        };

        let (query, body) = match ParameterPosition::for_method(method) {
            ParameterPosition::InUri => (ordered, Vec::new()),
            ParameterPosition::InBody => (Vec::new(), ordered),
        };

        Ok(SignedRequest {
            method: method.clone(),
            endpoint: endpoint.to_string(),
            query,
            body,
            headers,
            signature,
        })
    }
}
