//! Binary encoding of predict requests and responses using bincode.
//!
//! The messages carry the same fields as the JSON form (`x` + `filter` on the
//! way in, `result` on the way out) and can express every [`Value`] variant,
//! including tensors of any element type with their raw bytes.
//!
//! [`Value`]: crate::types::Value

use super::PredictRequest;
use crate::error::{Result, ServingError};
use crate::types::RecordBatch;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct PredictResponseMessage {
    result: RecordBatch,
}

pub fn decode_request(body: &[u8]) -> Result<PredictRequest> {
    bincode::deserialize::<PredictRequest>(body)
        .map_err(|e| ServingError::MalformedPayload(format!("invalid binary request: {}", e)))
}

pub fn encode_request(request: &PredictRequest) -> Result<Vec<u8>> {
    bincode::serialize(request)
        .map_err(|e| ServingError::Internal(format!("binary encoding failed: {}", e)))
}

pub fn encode_response(result: &RecordBatch) -> Result<Vec<u8>> {
    let message = PredictResponseMessage {
        result: result.clone(),
    };
    bincode::serialize(&message)
        .map_err(|e| ServingError::Internal(format!("binary encoding failed: {}", e)))
}

pub fn decode_response(body: &[u8]) -> Result<RecordBatch> {
    bincode::deserialize::<PredictResponseMessage>(body)
        .map(|message| message.result)
        .map_err(|e| ServingError::MalformedPayload(format!("invalid binary response: {}", e)))
}
