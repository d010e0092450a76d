//! ONNX tensor models on ONNX Runtime

use crate::error::{Result, ServingError};
use crate::feature_extractor::conform_tensor;
use crate::models::{Evaluator, LoadedModel};
use crate::types::{ElementType, FieldSpec, Record, Tensor, Value};
use ort::memory::Allocator;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::tensor::TensorElementType;
use ort::value::{DowncastableTarget, DynMapValueType, DynSequenceValueType, DynValue, ValueType};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// A tensor input declared by the graph
#[derive(Debug, Clone)]
struct TensorInput {
    name: String,
    dtype: ElementType,
    shape: Vec<i64>,
}

/// Evaluator owning one ONNX Runtime session
pub struct OnnxModel {
    /// Runs need exclusive access to the session
    session: Mutex<Session>,
    inputs: Vec<TensorInput>,
    input_schema: Vec<FieldSpec>,
    output_schema: Vec<FieldSpec>,
}

impl OnnxModel {
    /// Build a session from artifact bytes
    pub fn from_bytes(artifact: &[u8], onnx_threads: usize) -> Result<Self> {
        let failed =
            |e: String| ServingError::InvalidArtifact(format!("ONNX model could not be loaded: {}", e));
        let session = Session::builder()
            .map_err(|e| failed(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| failed(e.to_string()))?
            .with_intra_threads(onnx_threads)
            .map_err(|e| failed(e.to_string()))?
            .commit_from_memory(artifact)
            .map_err(|e| failed(e.to_string()))?;

        let mut inputs = Vec::with_capacity(session.inputs.len());
        let mut input_schema = Vec::with_capacity(session.inputs.len());
        for input in &session.inputs {
            let (dtype, shape) = match &input.input_type {
                ValueType::Tensor { ty, shape, .. } => {
                    let dtype = element_type(*ty).ok_or_else(|| {
                        ServingError::InvalidArtifact(format!(
                            "input '{}' has unsupported element type {:?}",
                            input.name, ty
                        ))
                    })?;
                    (dtype, shape.iter().copied().collect::<Vec<i64>>())
                }
                other => {
                    return Err(ServingError::InvalidArtifact(format!(
                        "input '{}' is not a tensor ({:?})",
                        input.name, other
                    )))
                }
            };
            input_schema.push(
                FieldSpec::new(input.name.clone(), format!("tensor({})", dtype.onnx_name()))
                    .with_shape(shape.clone()),
            );
            inputs.push(TensorInput {
                name: input.name.clone(),
                dtype,
                shape,
            });
        }

        let output_schema = session
            .outputs
            .iter()
            .map(|output| match &output.output_type {
                ValueType::Tensor { ty, shape, .. } => {
                    let name = element_type(*ty).map(|t| t.onnx_name()).unwrap_or("unknown");
                    FieldSpec::new(output.name.clone(), format!("tensor({})", name))
                        .with_shape(shape.iter().copied().collect())
                }
                // ZipMap class probabilities are delivered as a float tensor.
                ValueType::Sequence(_) => FieldSpec::new(output.name.clone(), "tensor(float)"),
                other => FieldSpec::new(output.name.clone(), format!("{:?}", other)),
            })
            .collect::<Vec<_>>();

        info!(
            inputs = inputs.len(),
            outputs = output_schema.len(),
            threads = onnx_threads,
            "ONNX session created"
        );

        Ok(Self {
            session: Mutex::new(session),
            inputs,
            input_schema,
            output_schema,
        })
    }

    fn evaluate_row(&self, row: &Record) -> Result<Record> {
        let mut feeds: Vec<(String, DynValue)> = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let cell = row.get(&input.name).unwrap_or(&Value::Null);
            let tensor = conform_tensor(&input.name, input.dtype, &input.shape, cell)?;
            feeds.push((input.name.clone(), to_ort_value(&tensor)?));
        }

        let mut session = self.session.lock();
        let outputs = session
            .run(feeds)
            .map_err(|e| ServingError::Evaluation(format!("ONNX run failed: {}", e)))?;

        let mut result = Record::with_capacity(self.output_schema.len());
        for field in &self.output_schema {
            let value = match outputs.get(field.name.as_str()) {
                Some(output) => extract_output(&field.name, &output)?,
                None => Value::Null,
            };
            result.insert(field.name.clone(), value);
        }
        Ok(result)
    }
}

impl Evaluator for OnnxModel {
    fn evaluate(&self, rows: &[Record]) -> Result<Vec<Record>> {
        if !rows.is_empty() {
            let missing: Vec<&str> = self
                .inputs
                .iter()
                .filter(|i| rows.iter().all(|r| !r.contains_key(&i.name)))
                .map(|i| i.name.as_str())
                .collect();
            if !missing.is_empty() {
                return Err(ServingError::SchemaMismatch(format!(
                    "request is missing required inputs {:?}",
                    missing
                )));
            }
        }
        rows.iter().map(|row| self.evaluate_row(row)).collect()
    }
}

/// Load an ONNX artifact and derive its schema from the session
pub fn load(artifact: &[u8], onnx_threads: usize) -> Result<LoadedModel> {
    let model = OnnxModel::from_bytes(artifact, onnx_threads)?;
    Ok(LoadedModel {
        model_type: "ONNX".to_string(),
        function: None,
        input_schema: model.input_schema.clone(),
        output_schema: model.output_schema.clone(),
        evaluator: Box::new(model),
    })
}

fn element_type(ty: TensorElementType) -> Option<ElementType> {
    Some(match ty {
        TensorElementType::Float32 => ElementType::Float32,
        TensorElementType::Float64 => ElementType::Float64,
        TensorElementType::Int32 => ElementType::Int32,
        TensorElementType::Int64 => ElementType::Int64,
        TensorElementType::Bool => ElementType::Bool,
        _ => return None,
    })
}

fn to_ort_value(tensor: &Tensor) -> Result<DynValue> {
    use ort::value::Tensor as OrtTensor;

    let shape = tensor.shape().to_vec();
    Ok(match tensor.dtype() {
        ElementType::Float32 => OrtTensor::from_array((shape, tensor.to_f32_vec()))?.into_dyn(),
        ElementType::Float64 => OrtTensor::from_array((shape, tensor.to_f64_vec()))?.into_dyn(),
        ElementType::Int32 => OrtTensor::from_array((shape, tensor.to_i32_vec()))?.into_dyn(),
        ElementType::Int64 => OrtTensor::from_array((shape, tensor.to_i64_vec()))?.into_dyn(),
        ElementType::Bool => OrtTensor::from_array((shape, tensor.to_bool_vec()))?.into_dyn(),
    })
}

/// Convert a session output into a cell.
/// Handles plain tensors and seq(map(int64, float)) outputs of ZipMap classifiers.
fn extract_output(name: &str, output: &DynValue) -> Result<Value> {
    if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
        return Ok(Value::Tensor(Tensor::from_f32(dims(shape), data)?));
    }
    if let Ok((shape, data)) = output.try_extract_tensor::<f64>() {
        return Ok(Value::Tensor(Tensor::from_f64(dims(shape), data)?));
    }
    if let Ok((shape, data)) = output.try_extract_tensor::<i64>() {
        return Ok(Value::Tensor(Tensor::from_i64(dims(shape), data)?));
    }
    if let Ok((shape, data)) = output.try_extract_tensor::<i32>() {
        return Ok(Value::Tensor(Tensor::from_i32(dims(shape), data)?));
    }
    if let Ok((shape, data)) = output.try_extract_tensor::<bool>() {
        return Ok(Value::Tensor(Tensor::from_bool(dims(shape), data)?));
    }

    let dtype = output.dtype();
    if DynSequenceValueType::can_downcast(&dtype) {
        return extract_sequence_map(name, output);
    }

    warn!(output = %name, dtype = ?dtype, "Unsupported ONNX output type, returning null");
    Ok(Value::Null)
}

fn dims(shape: &ort::tensor::Shape) -> Vec<i64> {
    shape.iter().copied().collect()
}

/// Class probabilities from a sequence of class-id maps, one row per map,
/// columns ordered by class id
fn extract_sequence_map(name: &str, output: &DynValue) -> Result<Value> {
    let allocator = Allocator::default();

    let sequence = output
        .downcast_ref::<DynSequenceValueType>()
        .map_err(|e| ServingError::Evaluation(format!("output '{}' is not a sequence: {}", name, e)))?;
    let maps = sequence
        .try_extract_sequence::<DynMapValueType>(&allocator)
        .map_err(|e| ServingError::Evaluation(format!("output '{}' is not a sequence of maps: {}", name, e)))?;

    let mut data = Vec::new();
    let mut classes = 0usize;
    for map_value in &maps {
        let mut kv_pairs = map_value
            .try_extract_key_values::<i64, f32>()
            .map_err(|e| ServingError::Evaluation(format!("output '{}' map is not int64 -> float: {}", name, e)))?;
        kv_pairs.sort_by_key(|(class_id, _)| *class_id);
        classes = kv_pairs.len();
        data.extend(kv_pairs.into_iter().map(|(_, p)| p));
    }

    debug!(output = %name, rows = maps.len(), classes = classes, "Extracted from seq(map)");
    Ok(Value::Tensor(Tensor::from_f32(vec![maps.len() as i64, classes as i64], &data)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_mapping() {
        assert_eq!(element_type(TensorElementType::Float32), Some(ElementType::Float32));
        assert_eq!(element_type(TensorElementType::Int64), Some(ElementType::Int64));
        assert_eq!(element_type(TensorElementType::String), None);
    }

    /// Reshape to [1, 784] then keep the first ten pixels
    const FIRST_PIXELS: &[u8] = include_bytes!("../../tests/fixtures/mnist.onnx");

    fn image(pixels: &[f32]) -> Record {
        let image = Tensor::from_f32(vec![1, 1, 28, 28], pixels).unwrap();
        [("Input3".to_string(), Value::Tensor(image))].into_iter().collect()
    }

    #[test]
    fn test_schema_comes_from_session() {
        let loaded = load(FIRST_PIXELS, 1).unwrap();
        assert_eq!(loaded.model_type, "ONNX");
        assert_eq!(loaded.input_schema.len(), 1);
        assert_eq!(loaded.input_schema[0].name, "Input3");
        assert_eq!(loaded.input_schema[0].data_type, "tensor(float)");
        assert_eq!(loaded.input_schema[0].shape, Some(vec![1, 1, 28, 28]));
        assert_eq!(loaded.output_schema[0].name, "Plus214_Output_0");
        assert_eq!(loaded.output_schema[0].shape, Some(vec![1, 10]));
    }

    #[test]
    fn test_evaluate_runs_the_graph() {
        let loaded = load(FIRST_PIXELS, 1).unwrap();

        let mut pixels: Vec<f32> = (0..784).map(|i| (i % 7) as f32 / 10.0).collect();
        pixels[4] = 0.9;
        // Outside the first ten, so it never reaches the output
        pixels[400] = 1.0;

        let rows = vec![image(&pixels), image(&vec![0.0; 784])];
        let outputs = loaded.evaluator.evaluate(&rows).unwrap();
        assert_eq!(outputs.len(), 2);

        let Value::Tensor(scores) = &outputs[0]["Plus214_Output_0"] else {
            panic!("expected a tensor, got {:?}", outputs[0]);
        };
        assert_eq!(scores.dtype(), ElementType::Float32);
        assert_eq!(scores.shape(), &[1, 10]);
        assert_eq!(scores.to_f32_vec(), pixels[..10].to_vec());
        assert_eq!(scores.argmax(), Some(4));
    }

    #[test]
    fn test_evaluate_rejects_missing_input() {
        let loaded = load(FIRST_PIXELS, 1).unwrap();
        let row: Record = [("pixels".to_string(), Value::Float(1.0))].into_iter().collect();
        let err = loaded.evaluator.evaluate(&[row]).unwrap_err();
        assert!(matches!(err, ServingError::SchemaMismatch(_)), "{:?}", err);
    }

    #[test]
    fn test_garbage_artifact_is_invalid() {
        let err = load(b"definitely not a protobuf graph", 1).unwrap_err();
        assert!(matches!(err, ServingError::InvalidArtifact(_)));
    }
}
