use crate::core::errors::ExchangeError;
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};

/// Where a request's parameters travel on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterPosition {
    InUri,
    InBody,
}

impl ParameterPosition {
    /// GET and DELETE carry parameters in the query string, everything else in
    /// a form-encoded body.
    pub fn for_method(method: &Method) -> Self {
        if *method == Method::GET || *method == Method::DELETE {
            Self::InUri
        } else {
            Self::InBody
        }
    }
}

/// Output of the signer: parameters split by placement plus headers.
///
/// `query` and `body` are already in their transmission order; the transport
/// must send [`SignedRequest::query_string`] and [`SignedRequest::body_string`]
/// verbatim, since the signature covers exactly those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: Method,
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub body: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub signature: Option<String>,
}

impl SignedRequest {
    pub fn query_string(&self) -> String {
        encode_params(&self.query)
    }

    pub fn body_string(&self) -> String {
        encode_params(&self.body)
    }

    /// Endpoint with the encoded query appended
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?{}", self.endpoint, self.query_string())
        }
    }
}

/// Signer trait for request authentication
///
/// Implementations are pure: identical inputs always produce an identical
/// [`SignedRequest`]. The caller supplies the timestamp so no clock is read here.
pub trait Signer: Send + Sync {
    /// Split and sign a request
    ///
    /// # Arguments
    /// * `method` - HTTP method, decides parameter placement
    /// * `endpoint` - API endpoint path
    /// * `params` - Unordered request parameters
    /// * `signed` - Whether the endpoint requires a signature
    /// * `timestamp` - Milliseconds since epoch, already offset-corrected
    fn sign_request(
        &self,
        method: &Method,
        endpoint: &str,
        params: &HashMap<String, String>,
        signed: bool,
        timestamp: i64,
    ) -> Result<SignedRequest, ExchangeError>;
}

/// Sort parameters into canonical (lexicographic key) order
pub fn canonical_params(params: &HashMap<String, String>) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .collect()
}

/// Form-encode parameters in the order given
pub fn encode_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex-encoded HMAC-SHA256 of `payload` keyed with `secret`
pub fn hmac_sha256_hex(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::AuthError(format!("Invalid secret key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_position_by_method() {
        assert_eq!(
            ParameterPosition::for_method(&Method::GET),
            ParameterPosition::InUri
        );
        assert_eq!(
            ParameterPosition::for_method(&Method::DELETE),
            ParameterPosition::InUri
        );
        assert_eq!(
            ParameterPosition::for_method(&Method::POST),
            ParameterPosition::InBody
        );
        assert_eq!(
            ParameterPosition::for_method(&Method::PUT),
            ParameterPosition::InBody
        );
    }

    #[test]
    fn test_canonical_params_sorted() {
        let mut params = HashMap::new();
        params.insert("timestamp".to_string(), "1".to_string());
        params.insert("symbol".to_string(), "BTCUSDT".to_string());
        params.insert("side".to_string(), "BUY".to_string());

        let keys: Vec<_> = canonical_params(&params)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["side", "symbol", "timestamp"]);
    }

    #[test]
    fn test_encode_params_escapes_values() {
        let params = vec![
            ("symbol".to_string(), "BTCUSDT".to_string()),
            ("note".to_string(), "a b&c".to_string()),
        ];
        assert_eq!(encode_params(&params), "symbol=BTCUSDT&note=a%20b%26c");
    }

    #[test]
    fn test_hmac_known_vector() {
        // Example from the Binance API documentation
        let payload = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        assert_eq!(
            hmac_sha256_hex(secret, payload).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_path_and_query() {
        let request = SignedRequest {
            method: Method::GET,
            endpoint: "/fapi/v1/openOrders".to_string(),
            query: vec![("symbol".to_string(), "BTCUSDT".to_string())],
            body: Vec::new(),
            headers: HashMap::new(),
            signature: None,
        };
        assert_eq!(request.path_and_query(), "/fapi/v1/openOrders?symbol=BTCUSDT");
    }
}
