//! Input preparation for model evaluation.
//!
//! Request rows arrive with loosely typed cells (JSON numbers, strings,
//! tensors). Before a model sees them they are checked against its input
//! schema and converted to the exact types the model declares.

use crate::error::{Result, ServingError};
use crate::types::value::element_count;
use crate::types::{ElementType, FieldSpec, Record, Tensor, Value};

/// Converts request rows into typed model inputs.
///
/// Fields are processed in input-schema order; columns the schema does not
/// name are dropped and absent columns become missing values.
pub struct FeatureExtractor {
    fields: Vec<FieldSpec>,
}

impl FeatureExtractor {
    /// Create a new feature extractor for an input schema.
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Reject a batch that carries none of the input fields at all.
    pub fn check_coverage(&self, rows: &[Record]) -> Result<()> {
        if rows.is_empty() || self.fields.is_empty() {
            return Ok(());
        }
        let covered = rows
            .iter()
            .any(|row| self.fields.iter().any(|f| row.contains_key(&f.name)));
        if covered {
            Ok(())
        } else {
            Err(ServingError::SchemaMismatch(format!(
                "request carries none of the input fields {:?}",
                self.feature_names()
            )))
        }
    }

    /// Extract the typed input fields from a row.
    pub fn extract(&self, row: &Record) -> Result<Record> {
        self.fields
            .iter()
            .map(|field| {
                let value = match row.get(&field.name) {
                    Some(v) => coerce(field, v)?,
                    None => Value::Null,
                };
                Ok::<_, ServingError>((field.name.clone(), value))
            })
            .collect()
    }

    /// Get the number of input fields.
    pub fn feature_count(&self) -> usize {
        self.fields.len()
    }

    /// Get input field names in schema order.
    pub fn feature_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// Coerce a cell to a field's declared data type
pub fn coerce(field: &FieldSpec, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = || {
        ServingError::SchemaMismatch(format!(
            "field '{}' expects {}, got {} {}",
            field.name,
            field.data_type,
            value.type_name(),
            describe(value)
        ))
    };

    let coerced = match field.data_type.as_str() {
        "double" | "float" => match value {
            Value::Int(i) => Value::Float(*i as f64),
            Value::Float(f) => Value::Float(*f),
            Value::String(s) => Value::Float(s.trim().parse::<f64>().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        },
        "integer" => match value {
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::Int(*f as i64),
            Value::String(s) => {
                let s = s.trim();
                match s.parse::<i64>() {
                    Ok(i) => Value::Int(i),
                    Err(_) => match s.parse::<f64>() {
                        Ok(f) if f.fract() == 0.0 => Value::Int(f as i64),
                        _ => return Err(mismatch()),
                    },
                }
            }
            _ => return Err(mismatch()),
        },
        "boolean" => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::Int(0) => Value::Bool(false),
            Value::Int(1) => Value::Bool(true),
            Value::String(s) => match s.trim() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(mismatch()),
            },
            _ => return Err(mismatch()),
        },
        "string" => match value {
            Value::String(s) => Value::String(s.clone()),
            Value::Int(i) => Value::String(i.to_string()),
            Value::Float(f) => Value::String(format_number(*f)),
            Value::Bool(b) => Value::String(b.to_string()),
            _ => return Err(mismatch()),
        },
        other => {
            return Err(ServingError::SchemaMismatch(format!(
                "field '{}' has unsupported type {}",
                field.name, other
            )))
        }
    };

    if !field.values.is_empty() && !field.values.iter().any(|v| same_category(&coerced, v)) {
        return Err(ServingError::SchemaMismatch(format!(
            "field '{}' does not accept {}; valid values are {:?}",
            field.name,
            describe(&coerced),
            field.values
        )));
    }

    Ok(coerced)
}

/// Bring a cell into the element type and shape of a tensor input
pub fn conform_tensor(name: &str, dtype: ElementType, shape: &[i64], value: &Value) -> Result<Tensor> {
    let tensor = match value {
        Value::Tensor(t) => t.clone(),
        Value::Float(f) => Tensor::from_f64(vec![1], &[*f])?,
        Value::Int(i) => Tensor::from_i64(vec![1], &[*i])?,
        Value::Bool(b) => Tensor::from_bool(vec![1], &[*b])?,
        Value::Null => {
            return Err(ServingError::SchemaMismatch(format!(
                "missing required input '{}'",
                name
            )))
        }
        Value::String(_) => {
            return Err(ServingError::SchemaMismatch(format!(
                "input '{}' expects tensor({}), got string",
                name,
                dtype.onnx_name()
            )))
        }
    };

    if (dtype == ElementType::Bool) != (tensor.dtype() == ElementType::Bool) {
        return Err(ServingError::SchemaMismatch(format!(
            "input '{}' expects tensor({}), got tensor({})",
            name,
            dtype.onnx_name(),
            tensor.dtype().onnx_name()
        )));
    }

    let target_shape = resolve_shape(name, shape, &tensor)?;
    tensor.cast(dtype).reshape(target_shape)
}

/// Fill in dynamic dimensions of a declared shape for the given tensor
fn resolve_shape(name: &str, declared: &[i64], tensor: &Tensor) -> Result<Vec<i64>> {
    if declared.is_empty() {
        return Ok(tensor.shape().to_vec());
    }
    let mismatch = || {
        ServingError::SchemaMismatch(format!(
            "input '{}' expects shape {:?}, got {:?}",
            name,
            declared,
            tensor.shape()
        ))
    };

    let dynamic = declared.iter().filter(|&&d| d < 0).count();
    if dynamic == 0 {
        if element_count(declared)? != tensor.len() {
            return Err(mismatch());
        }
        return Ok(declared.to_vec());
    }

    // Same rank with every static dimension agreeing: keep the tensor's shape.
    if tensor.shape().len() == declared.len()
        && declared
            .iter()
            .zip(tensor.shape())
            .all(|(&d, &t)| d < 0 || d == t)
    {
        return Ok(tensor.shape().to_vec());
    }

    if dynamic == 1 {
        let fixed: Vec<i64> = declared.iter().copied().filter(|&d| d >= 0).collect();
        let fixed_count = element_count(&fixed)?;
        if fixed_count > 0 && tensor.len() % fixed_count == 0 {
            let inferred = (tensor.len() / fixed_count) as i64;
            return Ok(declared
                .iter()
                .map(|&d| if d < 0 { inferred } else { d })
                .collect());
        }
    }

    Err(mismatch())
}

fn same_category(value: &Value, category: &str) -> bool {
    match value {
        Value::Int(_) | Value::Float(_) => match (value.as_f64(), category.trim().parse::<f64>()) {
            (Some(v), Ok(c)) => v == c,
            _ => false,
        },
        Value::String(s) => s == category,
        Value::Bool(b) => b.to_string() == category,
        Value::Null | Value::Tensor(_) => false,
    }
}

fn format_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Tensor(t) => format!("tensor{:?}", t.shape()),
    }
}
