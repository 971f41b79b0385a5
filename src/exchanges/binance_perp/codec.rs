use crate::core::errors::{ExchangeError, UNKNOWN_ERROR_CODE};
use crate::core::kernel::codec::{AckError, ControlAck, ControlRequest, InboundFrame};
use crate::core::kernel::WsCodec;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

/// Combined-stream dialect of the futures socket
#[derive(Debug, Clone, Copy, Default)]
pub struct BinancePerpCodec;

impl WsCodec for BinancePerpCodec {
    fn encode_control(&self, request: &ControlRequest) -> Result<Message, ExchangeError> {
        let frame = json!({
            "method": request.method.to_string(),
            "params": request.topics,
            "id": request.id
        });
        Ok(Message::Text(frame.to_string()))
    }

    fn decode_message(&self, message: &Message) -> Result<Option<InboundFrame>, ExchangeError> {
        let value: Value = match message {
            Message::Text(text) => serde_json::from_str(text),
            Message::Binary(data) => serde_json::from_slice(data),
            _ => return Ok(None), // Ignore other message types
        }
        .map_err(|e| ExchangeError::DeserializationError(format!("Failed to parse JSON: {}", e)))?;

        decode_value(value).map(Some)
    }
}

fn decode_value(value: Value) -> Result<InboundFrame, ExchangeError> {
    let Some(object) = value.as_object() else {
        return Ok(InboundFrame::Other(value));
    };

    // Control replies carry the request id and either `result` or `error`
    if let Some(id) = object.get("id").and_then(Value::as_u64) {
        if object.contains_key("result") || object.contains_key("error") {
            return Ok(InboundFrame::Ack(ControlAck {
                id,
                outcome: ack_outcome(object.get("result"), object.get("error")),
            }));
        }
    }

    // Combined stream format
    if let Some(stream) = object.get("stream").and_then(Value::as_str) {
        let data = object.get("data").ok_or_else(|| {
            ExchangeError::DeserializationError(format!(
                "Missing data field in stream message for '{}'",
                stream
            ))
        })?;
        return Ok(InboundFrame::Data {
            stream: stream.to_string(),
            payload: data.clone(),
        });
    }

    Ok(InboundFrame::Other(value))
}

fn ack_outcome(result: Option<&Value>, error: Option<&Value>) -> Result<(), AckError> {
    if let Some(error) = error.filter(|e| !e.is_null()) {
        return Err(server_error(error));
    }
    match result {
        None | Some(Value::Null) => Ok(()),
        Some(result) if result.get("code").is_some() => Err(server_error(result)),
        Some(other) => Err(AckError {
            code: UNKNOWN_ERROR_CODE,
            message: format!("Unexpected acknowledgement result: {}", other),
        }),
    }
}

fn server_error(value: &Value) -> AckError {
    let code = value
        .get("code")
        .and_then(Value::as_i64)
        .map_or(UNKNOWN_ERROR_CODE, |c| c as i32);
    let message = value
        .get("msg")
        .and_then(Value::as_str)
        .map_or_else(|| value.to_string(), str::to_string);
    AckError { code, message }
}
