//! PMML tree models and tree ensembles.
//!
//! A document is parsed once at deploy time into a [`PmmlModel`], which then
//! scores rows without touching the XML again.

pub mod parser;
pub mod predicate;
pub mod tree;

use crate::error::{Result, ServingError};
use crate::feature_extractor::FeatureExtractor;
use crate::models::aggregator::{MultipleModelMethod, ScoreAggregator};
use crate::models::{Evaluator, LoadedModel};
use crate::types::{FieldSpec, Record, Value};
use indexmap::IndexMap;
use predicate::{Predicate, Truth};
use tree::TreeModel;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningFunction {
    Classification,
    Regression,
}

impl MiningFunction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "classification" => Some(MiningFunction::Classification),
            "regression" => Some(MiningFunction::Regression),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MiningFunction::Classification => "classification",
            MiningFunction::Regression => "regression",
        }
    }
}

/// Outcome of scoring one row
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Null,
    Classification {
        label: String,
        probabilities: IndexMap<String, f64>,
    },
    Regression(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataField {
    pub name: String,
    pub optype: String,
    pub data_type: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUsage {
    Active,
    Target,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MiningField {
    pub name: String,
    pub usage: FieldUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFeature {
    PredictedValue,
    Probability,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputField {
    pub name: String,
    pub feature: ResultFeature,
    /// Category for `probability` outputs
    pub value: Option<String>,
    pub data_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: Option<String>,
    pub weight: f64,
    pub predicate: Predicate,
    pub model: ModelElement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MiningModel {
    pub function: MiningFunction,
    pub method: MultipleModelMethod,
    pub segments: Vec<Segment>,
}

impl MiningModel {
    fn predict(&self, inputs: &Record, categories: &[String]) -> Result<Prediction> {
        let aggregator = ScoreAggregator::new(self.method);
        let mut votes = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            if segment.predicate.evaluate(inputs) != Truth::True {
                continue;
            }
            trace!(segment = segment.id.as_deref().unwrap_or("-"), "Segment predicate matched");
            votes.push((segment.weight, segment.model.predict(inputs, categories)?));
            if aggregator.method() == MultipleModelMethod::SelectFirst {
                break;
            }
        }
        aggregator.combine(&votes, categories)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelElement {
    Tree(TreeModel),
    Mining(MiningModel),
}

impl ModelElement {
    pub fn element_name(&self) -> &'static str {
        match self {
            ModelElement::Tree(_) => "TreeModel",
            ModelElement::Mining(_) => "MiningModel",
        }
    }

    pub fn function(&self) -> MiningFunction {
        match self {
            ModelElement::Tree(t) => t.function,
            ModelElement::Mining(m) => m.function,
        }
    }

    pub fn predict(&self, inputs: &Record, categories: &[String]) -> Result<Prediction> {
        match self {
            ModelElement::Tree(t) => t.predict(inputs, categories),
            ModelElement::Mining(m) => m.predict(inputs, categories),
        }
    }

    fn collect_labels(&self, out: &mut Vec<String>) {
        match self {
            ModelElement::Tree(t) => t.collect_labels(out),
            ModelElement::Mining(m) => m.segments.iter().for_each(|s| s.model.collect_labels(out)),
        }
    }
}

/// Parsed PMML document, restricted to what scoring needs
#[derive(Debug, Clone, PartialEq)]
pub struct PmmlDocument {
    pub version: String,
    pub data_dictionary: Vec<DataField>,
    pub mining_schema: Vec<MiningField>,
    pub output: Vec<OutputField>,
    pub model: ModelElement,
}

/// Target field of the top-level model
#[derive(Debug, Clone)]
struct Target {
    name: String,
    data_type: String,
}

/// Evaluator for a parsed PMML document
pub struct PmmlModel {
    model: ModelElement,
    extractor: FeatureExtractor,
    target: Target,
    categories: Vec<String>,
    outputs: Vec<OutputField>,
    input_schema: Vec<FieldSpec>,
    output_schema: Vec<FieldSpec>,
}

impl PmmlModel {
    pub fn from_document(doc: PmmlDocument) -> Result<Self> {
        let lookup = |name: &str| {
            doc.data_dictionary
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| {
                    ServingError::InvalidArtifact(format!(
                        "mining field '{}' is not in the DataDictionary",
                        name
                    ))
                })
        };

        let mut input_schema = Vec::new();
        for field in doc.mining_schema.iter().filter(|f| f.usage == FieldUsage::Active) {
            let data = lookup(&field.name)?;
            let values = if data.optype == "continuous" {
                Vec::new()
            } else {
                data.values.clone()
            };
            input_schema.push(
                FieldSpec::new(data.name.clone(), data.data_type.clone())
                    .with_optype(data.optype.clone())
                    .with_values(values),
            );
        }

        let function = doc.model.function();
        let target = match doc.mining_schema.iter().find(|f| f.usage == FieldUsage::Target) {
            Some(field) => {
                let data = lookup(&field.name)?;
                Target {
                    name: data.name.clone(),
                    data_type: data.data_type.clone(),
                }
            }
            None => Target {
                name: "target".to_string(),
                data_type: match function {
                    MiningFunction::Classification => "string".to_string(),
                    MiningFunction::Regression => "double".to_string(),
                },
            },
        };

        let categories = match function {
            MiningFunction::Regression => Vec::new(),
            MiningFunction::Classification => {
                let declared = doc
                    .data_dictionary
                    .iter()
                    .find(|f| f.name == target.name)
                    .map(|f| f.values.clone())
                    .unwrap_or_default();
                if declared.is_empty() {
                    let mut labels = Vec::new();
                    doc.model.collect_labels(&mut labels);
                    labels
                } else {
                    declared
                }
            }
        };

        let outputs = if doc.output.is_empty() {
            default_outputs(function, &target, &categories)
        } else {
            doc.output.clone()
        };

        let output_schema = outputs
            .iter()
            .map(|o| match o.feature {
                ResultFeature::PredictedValue => {
                    let optype = match function {
                        MiningFunction::Classification => "categorical",
                        MiningFunction::Regression => "continuous",
                    };
                    let data_type = o.data_type.clone().unwrap_or_else(|| target.data_type.clone());
                    FieldSpec::new(o.name.clone(), data_type)
                        .with_optype(optype)
                        .with_values(categories.clone())
                }
                ResultFeature::Probability => FieldSpec::new(o.name.clone(), "double").with_optype("continuous"),
            })
            .collect();

        debug!(
            model = doc.model.element_name(),
            pmml_version = %doc.version,
            function = function.as_str(),
            inputs = input_schema.len(),
            categories = categories.len(),
            "PMML document prepared"
        );

        Ok(Self {
            extractor: FeatureExtractor::new(input_schema.clone()),
            model: doc.model,
            target,
            categories,
            outputs,
            input_schema,
            output_schema,
        })
    }

    fn render(&self, prediction: &Prediction) -> Record {
        self.outputs
            .iter()
            .map(|o| {
                let value = match (o.feature, prediction) {
                    (_, Prediction::Null) => Value::Null,
                    (ResultFeature::PredictedValue, Prediction::Regression(score)) => Value::Float(*score),
                    (ResultFeature::PredictedValue, Prediction::Classification { label, .. }) => {
                        typed_label(label, o.data_type.as_deref().unwrap_or(&self.target.data_type))
                    }
                    (ResultFeature::Probability, Prediction::Classification { label, probabilities }) => {
                        let category = o.value.as_deref().unwrap_or(label);
                        Value::Float(probabilities.get(category).copied().unwrap_or(0.0))
                    }
                    (ResultFeature::Probability, Prediction::Regression(_)) => Value::Null,
                };
                (o.name.clone(), value)
            })
            .collect()
    }
}

impl Evaluator for PmmlModel {
    fn evaluate(&self, rows: &[Record]) -> Result<Vec<Record>> {
        self.extractor.check_coverage(rows)?;
        rows.iter()
            .map(|row| {
                let inputs = self.extractor.extract(row)?;
                let prediction = self.model.predict(&inputs, &self.categories)?;
                Ok(self.render(&prediction))
            })
            .collect()
    }
}

/// Parse a PMML artifact and build its evaluator
pub fn load(artifact: &[u8]) -> Result<LoadedModel> {
    let xml = std::str::from_utf8(artifact)
        .map_err(|e| ServingError::InvalidArtifact(format!("PMML is not valid UTF-8: {}", e)))?;
    let doc = parser::parse(xml)?;
    let model_type = doc.model.element_name().to_string();
    let function = doc.model.function().as_str().to_string();
    let model = PmmlModel::from_document(doc)?;

    Ok(LoadedModel {
        model_type,
        function: Some(function),
        input_schema: model.input_schema.clone(),
        output_schema: model.output_schema.clone(),
        evaluator: Box::new(model),
    })
}

fn default_outputs(function: MiningFunction, target: &Target, categories: &[String]) -> Vec<OutputField> {
    let mut outputs = vec![OutputField {
        name: format!("predicted_{}", target.name),
        feature: ResultFeature::PredictedValue,
        value: None,
        data_type: None,
    }];
    if function == MiningFunction::Classification {
        outputs.extend(categories.iter().map(|c| OutputField {
            name: format!("probability_{}", c),
            feature: ResultFeature::Probability,
            value: Some(c.clone()),
            data_type: Some("double".to_string()),
        }));
    }
    outputs
}

fn typed_label(label: &str, data_type: &str) -> Value {
    match data_type {
        "integer" => label.trim().parse::<i64>().map(Value::Int).unwrap_or_else(|_| Value::from(label)),
        "double" | "float" => label.trim().parse::<f64>().map(Value::Float).unwrap_or_else(|_| Value::from(label)),
        "boolean" => match label.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::from(label),
        },
        _ => Value::from(label),
    }
}
