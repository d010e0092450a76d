//! JSON encoding of predict requests and responses.
//!
//! Request: `{"X": <table>, "filter": ["col", ...]}`, response:
//! `{"result": <table>}`, where a table is either an array of objects
//! (records) or `{"columns": [...], "data": [[...], ...]}` (split).
//! Tensors are written as `{"dtype", "shape", "data"}` with flat row-major
//! data; bare nested arrays are also accepted on input, with the nesting
//! giving the shape. Non-finite floats are written as `"NaN"`,
//! `"Infinity"` or `"-Infinity"`, wrapped as `{"float": ...}` in a plain cell.

use super::PredictRequest;
use crate::error::{Result, ServingError};
use crate::types::value::element_count;
use crate::types::{ElementType, Record, RecordBatch, Tensor, Value};
use serde_json::{Map, Number, Value as Json};

const KEY_X: &str = "X";
const KEY_FILTER: &str = "filter";
const KEY_RESULT: &str = "result";
const KEY_COLUMNS: &str = "columns";
const KEY_DATA: &str = "data";
const KEY_DTYPE: &str = "dtype";
const KEY_SHAPE: &str = "shape";
const KEY_FLOAT: &str = "float";

const NAN: &str = "NaN";
const INFINITY: &str = "Infinity";
const NEG_INFINITY: &str = "-Infinity";

pub fn decode_request(body: &[u8]) -> Result<PredictRequest> {
    let mut root = parse_object(body)?;
    let x = root
        .remove(KEY_X)
        .ok_or_else(|| ServingError::MalformedPayload(format!("missing '{}' field", KEY_X)))?;
    let filter = match root.remove(KEY_FILTER) {
        None | Some(Json::Null) => None,
        Some(Json::Array(items)) => Some(
            items
                .into_iter()
                .map(|item| match item {
                    Json::String(s) => Ok(s),
                    other => Err(ServingError::MalformedPayload(format!(
                        "filter entries must be strings, got {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        Some(other) => {
            return Err(ServingError::MalformedPayload(format!(
                "'filter' must be an array of column names, got {}",
                other
            )))
        }
    };
    Ok(PredictRequest {
        x: table_from_json(x)?,
        filter,
    })
}

pub fn encode_request(request: &PredictRequest) -> Result<Vec<u8>> {
    let mut root = Map::new();
    root.insert(KEY_X.to_string(), table_to_json(&request.x));
    if let Some(filter) = &request.filter {
        root.insert(
            KEY_FILTER.to_string(),
            Json::Array(filter.iter().cloned().map(Json::String).collect()),
        );
    }
    to_bytes(&Json::Object(root))
}

pub fn encode_response(result: &RecordBatch) -> Result<Vec<u8>> {
    let mut root = Map::new();
    root.insert(KEY_RESULT.to_string(), table_to_json(result));
    to_bytes(&Json::Object(root))
}

pub fn decode_response(body: &[u8]) -> Result<RecordBatch> {
    let mut root = parse_object(body)?;
    let result = root
        .remove(KEY_RESULT)
        .ok_or_else(|| ServingError::MalformedPayload(format!("missing '{}' field", KEY_RESULT)))?;
    table_from_json(result)
}

fn parse_object(body: &[u8]) -> Result<Map<String, Json>> {
    match serde_json::from_slice::<Json>(body) {
        Ok(Json::Object(map)) => Ok(map),
        Ok(other) => Err(ServingError::MalformedPayload(format!(
            "expected a JSON object, got {}",
            kind_of(&other)
        ))),
        Err(e) => Err(ServingError::MalformedPayload(format!("invalid JSON: {}", e))),
    }
}

fn to_bytes(json: &Json) -> Result<Vec<u8>> {
    serde_json::to_vec(json).map_err(|e| ServingError::Internal(format!("JSON encoding failed: {}", e)))
}

/// Parse a table in either layout
pub fn table_from_json(json: Json) -> Result<RecordBatch> {
    match json {
        Json::Array(rows) => {
            let records = rows
                .into_iter()
                .enumerate()
                .map(|(i, row)| match row {
                    Json::Object(fields) => fields
                        .into_iter()
                        .map(|(k, v)| value_from_json(v).map(|v| (k, v)))
                        .collect::<Result<Record>>(),
                    other => Err(ServingError::MalformedPayload(format!(
                        "record {} must be an object, got {}",
                        i,
                        kind_of(&other)
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(RecordBatch::Records(records))
        }
        Json::Object(mut map) => {
            let columns = match map.remove(KEY_COLUMNS) {
                Some(Json::Array(cols)) => cols
                    .into_iter()
                    .map(|c| match c {
                        Json::String(s) => Ok(s),
                        other => Err(ServingError::MalformedPayload(format!(
                            "column names must be strings, got {}",
                            other
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => {
                    return Err(ServingError::MalformedPayload(
                        "split table needs a 'columns' array".to_string(),
                    ))
                }
            };
            let data = match map.remove(KEY_DATA) {
                Some(Json::Array(rows)) => rows
                    .into_iter()
                    .enumerate()
                    .map(|(i, row)| match row {
                        Json::Array(cells) => cells
                            .into_iter()
                            .map(value_from_json)
                            .collect::<Result<Vec<Value>>>(),
                        other => Err(ServingError::MalformedPayload(format!(
                            "data row {} must be an array, got {}",
                            i,
                            kind_of(&other)
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => {
                    return Err(ServingError::MalformedPayload(
                        "split table needs a 'data' array".to_string(),
                    ))
                }
            };
            RecordBatch::split(columns, data)
        }
        other => Err(ServingError::MalformedPayload(format!(
            "table must be an array of records or a columns/data object, got {}",
            kind_of(&other)
        ))),
    }
}

/// Render a table in its own layout
pub fn table_to_json(batch: &RecordBatch) -> Json {
    match batch {
        RecordBatch::Records(rows) => Json::Array(
            rows.iter()
                .map(|row| {
                    Json::Object(
                        row.iter()
                            .map(|(k, v)| (k.clone(), value_to_json(v)))
                            .collect(),
                    )
                })
                .collect(),
        ),
        RecordBatch::Split { columns, data } => {
            let mut map = Map::new();
            map.insert(
                KEY_COLUMNS.to_string(),
                Json::Array(columns.iter().cloned().map(Json::String).collect()),
            );
            map.insert(
                KEY_DATA.to_string(),
                Json::Array(
                    data.iter()
                        .map(|row| Json::Array(row.iter().map(value_to_json).collect()))
                        .collect(),
                ),
            );
            Json::Object(map)
        }
    }
}

pub fn value_from_json(json: Json) -> Result<Value> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(b)),
        Json::Number(n) => Ok(number_to_value(&n)),
        Json::String(s) => Ok(Value::String(s)),
        Json::Array(_) => tensor_from_json(&json).map(Value::Tensor),
        Json::Object(map) => tagged_from_json(map),
    }
}

pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number((*i).into()),
        Value::Float(f) => match Number::from_f64(*f) {
            Some(n) => Json::Number(n),
            None => {
                let mut map = Map::new();
                map.insert(KEY_FLOAT.to_string(), non_finite_to_json(*f));
                Json::Object(map)
            }
        },
        Value::String(s) => Json::String(s.clone()),
        Value::Tensor(t) => tensor_to_json(t),
    }
}

fn number_to_value(n: &Number) -> Value {
    match n.as_i64() {
        Some(i) => Value::Int(i),
        None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
    }
}

/// Finite floats as numbers, the others as `"NaN"`, `"Infinity"` or `"-Infinity"`
fn float_to_json(f: f64) -> Json {
    match Number::from_f64(f) {
        Some(n) => Json::Number(n),
        None => non_finite_to_json(f),
    }
}

fn non_finite_to_json(f: f64) -> Json {
    let text = if f.is_nan() {
        NAN
    } else if f > 0.0 {
        INFINITY
    } else {
        NEG_INFINITY
    };
    Json::String(text.to_string())
}

fn float_from_json(json: &Json) -> Option<f64> {
    match json {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => match s.as_str() {
            NAN => Some(f64::NAN),
            INFINITY => Some(f64::INFINITY),
            NEG_INFINITY => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

/// Object cells: a typed tensor `{"dtype", "shape", "data"}` or a
/// non-finite float `{"float": "NaN"}`
fn tagged_from_json(mut map: Map<String, Json>) -> Result<Value> {
    if map.len() == 1 {
        if let Some(f) = map.get(KEY_FLOAT).and_then(float_from_json) {
            return Ok(Value::Float(f));
        }
    }
    match (map.remove(KEY_DTYPE), map.remove(KEY_SHAPE), map.remove(KEY_DATA)) {
        (Some(Json::String(dtype)), Some(shape), Some(Json::Array(data))) if map.is_empty() => {
            typed_tensor_from_json(&dtype, shape, &data).map(Value::Tensor)
        }
        _ => Err(ServingError::MalformedPayload(
            "object cells must be typed tensors {\"dtype\", \"shape\", \"data\"} or {\"float\": ...}"
                .to_string(),
        )),
    }
}

fn typed_tensor_from_json(dtype: &str, shape: Json, data: &[Json]) -> Result<Tensor> {
    let dtype = ElementType::parse(dtype)
        .ok_or_else(|| ServingError::MalformedPayload(format!("unknown tensor dtype '{}'", dtype)))?;
    let shape: Vec<i64> = serde_json::from_value(shape)
        .map_err(|e| ServingError::MalformedPayload(format!("invalid tensor shape: {}", e)))?;
    let count = element_count(&shape)?;
    if data.len() != count {
        return Err(ServingError::MalformedPayload(format!(
            "tensor of shape {:?} needs {} elements, got {}",
            shape,
            count,
            data.len()
        )));
    }

    let bad = |json: &Json| {
        ServingError::MalformedPayload(format!("invalid {} tensor element {}", dtype, json))
    };
    if dtype == ElementType::Bool {
        let values = data
            .iter()
            .map(|j| j.as_bool().ok_or_else(|| bad(j)))
            .collect::<Result<Vec<_>>>()?;
        return Tensor::from_bool(shape, &values);
    }
    if dtype.is_integer() {
        let values = data
            .iter()
            .map(|j| j.as_i64().ok_or_else(|| bad(j)))
            .collect::<Result<Vec<_>>>()?;
        return match dtype {
            ElementType::Int32 => {
                let narrowed = values
                    .iter()
                    .zip(data)
                    .map(|(&v, j)| i32::try_from(v).map_err(|_| bad(j)))
                    .collect::<Result<Vec<_>>>()?;
                Tensor::from_i32(shape, &narrowed)
            }
            _ => Tensor::from_i64(shape, &values),
        };
    }
    let values = data
        .iter()
        .map(|j| float_from_json(j).ok_or_else(|| bad(j)))
        .collect::<Result<Vec<_>>>()?;
    match dtype {
        ElementType::Float32 => {
            let narrowed: Vec<f32> = values.iter().map(|&v| v as f32).collect();
            Tensor::from_f32(shape, &narrowed)
        }
        _ => Tensor::from_f64(shape, &values),
    }
}

/// Leaf kinds seen while flattening a nested array
enum Leaves {
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Bools(Vec<bool>),
}

/// Untyped nested arrays, accepted on input only
fn tensor_from_json(json: &Json) -> Result<Tensor> {
    // Shape comes from following the first element down each level.
    let mut shape = Vec::new();
    let mut cursor = json;
    while let Json::Array(items) = cursor {
        shape.push(items.len() as i64);
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }

    let mut leaves = Vec::new();
    flatten(json, &shape, 0, &mut leaves)?;

    let classified = if leaves.iter().all(|l| l.is_boolean()) && !leaves.is_empty() {
        Leaves::Bools(leaves.iter().filter_map(|l| l.as_bool()).collect())
    } else if leaves.iter().all(|l| l.is_i64()) && !leaves.is_empty() {
        Leaves::Ints(leaves.iter().filter_map(|l| l.as_i64()).collect())
    } else {
        let floats = leaves
            .iter()
            .map(|l| match l {
                Json::Null => Ok(f64::NAN),
                other => float_from_json(other).ok_or_else(|| {
                    ServingError::MalformedPayload(format!(
                        "tensor elements must be numbers, got {}",
                        kind_of(other)
                    ))
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        Leaves::Floats(floats)
    };

    match classified {
        Leaves::Ints(v) => Tensor::from_i64(shape, &v),
        Leaves::Floats(v) => Tensor::from_f64(shape, &v),
        Leaves::Bools(v) => Tensor::from_bool(shape, &v),
    }
}

fn flatten<'a>(json: &'a Json, shape: &[i64], depth: usize, out: &mut Vec<&'a Json>) -> Result<()> {
    if depth == shape.len() {
        if json.is_array() || json.is_object() {
            return Err(ServingError::MalformedPayload(
                "tensor is not rectangular".to_string(),
            ));
        }
        out.push(json);
        return Ok(());
    }
    match json {
        Json::Array(items) if items.len() as i64 == shape[depth] => {
            for item in items {
                flatten(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        _ => Err(ServingError::MalformedPayload(format!(
            "tensor is not rectangular: expected {} elements at depth {}",
            shape[depth], depth
        ))),
    }
}

/// Typed form `{"dtype": "float32", "shape": [1, 10], "data": [...]}` with
/// row-major flat data, so the element type and rank survive the trip
fn tensor_to_json(tensor: &Tensor) -> Json {
    let data: Vec<Json> = match tensor.dtype() {
        ElementType::Int32 | ElementType::Int64 => tensor
            .to_i64_vec()
            .into_iter()
            .map(|v| Json::Number(v.into()))
            .collect(),
        ElementType::Bool => tensor.to_bool_vec().into_iter().map(Json::Bool).collect(),
        ElementType::Float32 => tensor
            .to_f32_vec()
            .into_iter()
            .map(|v| float_to_json(v as f64))
            .collect(),
        ElementType::Float64 => tensor.to_f64_vec().into_iter().map(float_to_json).collect(),
    };

    let mut map = Map::new();
    map.insert(KEY_DTYPE.to_string(), Json::String(tensor.dtype().as_str().to_string()));
    map.insert(
        KEY_SHAPE.to_string(),
        Json::Array(tensor.shape().iter().map(|&d| Json::Number(d.into())).collect()),
    );
    map.insert(KEY_DATA.to_string(), Json::Array(data));
    Json::Object(map)
}

fn kind_of(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
