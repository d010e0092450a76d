//! Model input/output field descriptions

use serde::{Deserialize, Serialize};

/// One named input or output of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    /// Column name
    pub name: String,
    /// PMML data type (`double`, `string`, ...) or ONNX type (`tensor(float)`)
    #[serde(rename = "type")]
    pub data_type: String,
    /// PMML operational type (`continuous`, `categorical`, `ordinal`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optype: Option<String>,
    /// Tensor shape, -1 for dynamic dimensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<i64>>,
    /// Valid categories of a categorical field
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            optype: None,
            shape: None,
            values: Vec::new(),
        }
    }

    pub fn with_optype(mut self, optype: impl Into<String>) -> Self {
        self.optype = Some(optype.into());
        self
    }

    pub fn with_shape(mut self, shape: Vec<i64>) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn with_values(mut self, values: Vec<String>) -> Self {
        self.values = values;
        self
    }
}
