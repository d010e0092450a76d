//! PMML document parsing

use super::predicate::{BooleanOperator, Operator, Predicate};
use super::tree::{MissingValueStrategy, Node, NoTrueChildStrategy, ScoreDistribution, TreeModel};
use super::{
    DataField, FieldUsage, MiningField, MiningFunction, MiningModel, ModelElement, OutputField,
    PmmlDocument, ResultFeature, Segment,
};
use crate::error::{Result, ServingError};
use crate::models::aggregator::MultipleModelMethod;

type XmlNode<'a, 'input> = roxmltree::Node<'a, 'input>;

const MODEL_ELEMENTS: &[&str] = &[
    "AnomalyDetectionModel",
    "AssociationModel",
    "BaselineModel",
    "BayesianNetworkModel",
    "ClusteringModel",
    "GaussianProcessModel",
    "GeneralRegressionModel",
    "MiningModel",
    "NaiveBayesModel",
    "NearestNeighborModel",
    "NeuralNetwork",
    "RegressionModel",
    "RuleSetModel",
    "Scorecard",
    "SequenceModel",
    "SupportVectorMachineModel",
    "TextModel",
    "TimeSeriesModel",
    "TreeModel",
];

const PREDICATES: &[&str] = &[
    "True",
    "False",
    "SimplePredicate",
    "CompoundPredicate",
    "SimpleSetPredicate",
];

pub fn parse(xml: &str) -> Result<PmmlDocument> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| invalid(format!("malformed XML: {}", e)))?;
    let root = doc.root_element();
    if root.tag_name().name() != "PMML" {
        return Err(invalid(format!(
            "root element is <{}>, expected <PMML>",
            root.tag_name().name()
        )));
    }

    let data_dictionary = match child(root, "DataDictionary") {
        Some(node) => parse_data_dictionary(node)?,
        None => return Err(invalid("missing DataDictionary")),
    };

    let model_node = find_model(root)?;
    let model = parse_model(model_node)?;
    let mining_schema = parse_mining_schema(model_node)?;
    let output = match child(model_node, "Output") {
        Some(node) => parse_output(node)?,
        None => Vec::new(),
    };

    Ok(PmmlDocument {
        version: root.attribute("version").unwrap_or_default().to_string(),
        data_dictionary,
        mining_schema,
        output,
        model,
    })
}

fn parse_data_dictionary(node: XmlNode) -> Result<Vec<DataField>> {
    children(node, "DataField")
        .map(|field| {
            let name = required(field, "name")?;
            let data_type = normalize_data_type(field.attribute("dataType").unwrap_or("string"))
                .ok_or_else(|| {
                    invalid(format!(
                        "DataField '{}' has unsupported dataType '{}'",
                        name,
                        field.attribute("dataType").unwrap_or_default()
                    ))
                })?;
            let values = children(field, "Value")
                .filter(|v| matches!(v.attribute("property"), None | Some("valid")))
                .map(|v| required(v, "value").map(str::to_string))
                .collect::<Result<Vec<String>>>()?;

            Ok(DataField {
                name: name.to_string(),
                optype: field.attribute("optype").unwrap_or("continuous").to_string(),
                data_type: data_type.to_string(),
                values,
            })
        })
        .collect()
}

fn normalize_data_type(data_type: &str) -> Option<&'static str> {
    Some(match data_type {
        "string" => "string",
        "integer" => "integer",
        "float" => "float",
        "double" => "double",
        "boolean" => "boolean",
        _ => return None,
    })
}

fn parse_mining_schema(model: XmlNode) -> Result<Vec<MiningField>> {
    let schema = child(model, "MiningSchema").ok_or_else(|| {
        invalid(format!("<{}> has no MiningSchema", model.tag_name().name()))
    })?;
    children(schema, "MiningField")
        .map(|field| {
            let usage = match field.attribute("usageType").unwrap_or("active") {
                "active" => FieldUsage::Active,
                "target" | "predicted" => FieldUsage::Target,
                _ => FieldUsage::Other,
            };
            Ok(MiningField {
                name: required(field, "name")?.to_string(),
                usage,
            })
        })
        .collect()
}

fn parse_output(node: XmlNode) -> Result<Vec<OutputField>> {
    children(node, "OutputField")
        .map(|field| {
            let name = required(field, "name")?;
            let feature = match field.attribute("feature").unwrap_or("predictedValue") {
                "predictedValue" => ResultFeature::PredictedValue,
                "probability" => ResultFeature::Probability,
                other => {
                    return Err(invalid(format!(
                        "OutputField '{}' uses unsupported feature '{}'",
                        name, other
                    )))
                }
            };
            Ok(OutputField {
                name: name.to_string(),
                feature,
                value: field.attribute("value").map(str::to_string),
                data_type: field
                    .attribute("dataType")
                    .and_then(normalize_data_type)
                    .map(str::to_string),
            })
        })
        .collect()
}

fn find_model<'a, 'input>(parent: XmlNode<'a, 'input>) -> Result<XmlNode<'a, 'input>> {
    parent
        .children()
        .find(|c| c.is_element() && MODEL_ELEMENTS.contains(&c.tag_name().name()))
        .ok_or_else(|| invalid(format!("<{}> contains no model element", parent.tag_name().name())))
}

fn parse_model(node: XmlNode) -> Result<ModelElement> {
    match node.tag_name().name() {
        "TreeModel" => parse_tree_model(node).map(ModelElement::Tree),
        "MiningModel" => parse_mining_model(node).map(ModelElement::Mining),
        other => Err(invalid(format!("unsupported model element <{}>", other))),
    }
}

fn parse_function(node: XmlNode) -> Result<MiningFunction> {
    let name = required(node, "functionName")?;
    MiningFunction::parse(name)
        .ok_or_else(|| invalid(format!("unsupported functionName '{}'", name)))
}

fn parse_tree_model(node: XmlNode) -> Result<TreeModel> {
    let function = parse_function(node)?;
    let missing_value_strategy = match node.attribute("missingValueStrategy") {
        None => MissingValueStrategy::default(),
        Some(s) => MissingValueStrategy::parse(s)
            .ok_or_else(|| invalid(format!("unsupported missingValueStrategy '{}'", s)))?,
    };
    let no_true_child_strategy = match node.attribute("noTrueChildStrategy") {
        None => NoTrueChildStrategy::default(),
        Some(s) => NoTrueChildStrategy::parse(s)
            .ok_or_else(|| invalid(format!("unsupported noTrueChildStrategy '{}'", s)))?,
    };
    let root = child(node, "Node").ok_or_else(|| invalid("TreeModel has no root Node"))?;
    let root = parse_node(root)?;

    if function == MiningFunction::Regression {
        check_numeric_scores(&root)?;
    }

    Ok(TreeModel {
        function,
        missing_value_strategy,
        no_true_child_strategy,
        root,
    })
}

fn check_numeric_scores(node: &Node) -> Result<()> {
    if let Some(score) = &node.score {
        if score.trim().parse::<f64>().is_err() {
            return Err(invalid(format!("regression score '{}' is not numeric", score)));
        }
    }
    node.children.iter().try_for_each(check_numeric_scores)
}

fn parse_node(node: XmlNode) -> Result<Node> {
    let distribution = children(node, "ScoreDistribution")
        .map(|d| {
            Ok(ScoreDistribution {
                value: required(d, "value")?.to_string(),
                record_count: number(d, "recordCount")?.unwrap_or(0.0),
                probability: number(d, "probability")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let children = children(node, "Node").map(parse_node).collect::<Result<Vec<_>>>()?;

    Ok(Node {
        id: node.attribute("id").map(str::to_string),
        score: node.attribute("score").map(str::to_string),
        predicate: parse_predicate(node)?,
        default_child: node.attribute("defaultChild").map(str::to_string),
        distribution,
        children,
    })
}

fn parse_mining_model(node: XmlNode) -> Result<MiningModel> {
    let function = parse_function(node)?;
    let segmentation = child(node, "Segmentation").ok_or_else(|| invalid("MiningModel has no Segmentation"))?;
    let method_name = required(segmentation, "multipleModelMethod")?;
    let method = MultipleModelMethod::parse(method_name)
        .ok_or_else(|| invalid(format!("unsupported multipleModelMethod '{}'", method_name)))?;
    if !method.supports(function) {
        return Err(invalid(format!(
            "multipleModelMethod '{}' is not defined for {}",
            method_name,
            function.as_str()
        )));
    }

    let segments = children(segmentation, "Segment")
        .map(|segment| {
            let model = parse_model(find_model(segment)?)?;
            Ok(Segment {
                id: segment.attribute("id").map(str::to_string),
                weight: number(segment, "weight")?.unwrap_or(1.0),
                predicate: parse_predicate(segment)?,
                model,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if segments.is_empty() {
        return Err(invalid("Segmentation has no segments"));
    }

    Ok(MiningModel {
        function,
        method,
        segments,
    })
}

/// Parse the predicate held by a `Node` or `Segment`
fn parse_predicate(parent: XmlNode) -> Result<Predicate> {
    let node = parent
        .children()
        .find(|c| c.is_element() && PREDICATES.contains(&c.tag_name().name()))
        .ok_or_else(|| invalid(format!("<{}> has no predicate", parent.tag_name().name())))?;
    parse_predicate_element(node)
}

fn parse_predicate_element(node: XmlNode) -> Result<Predicate> {
    match node.tag_name().name() {
        "True" => Ok(Predicate::True),
        "False" => Ok(Predicate::False),
        "SimplePredicate" => {
            let operator_name = required(node, "operator")?;
            let operator = Operator::parse(operator_name)
                .ok_or_else(|| invalid(format!("unsupported operator '{}'", operator_name)))?;
            let value = node.attribute("value").map(str::to_string);
            if value.is_none() && !matches!(operator, Operator::IsMissing | Operator::IsNotMissing) {
                return Err(invalid(format!("operator '{}' needs a value", operator_name)));
            }
            Ok(Predicate::Simple {
                field: required(node, "field")?.to_string(),
                operator,
                value,
            })
        }
        "CompoundPredicate" => {
            let operator_name = required(node, "booleanOperator")?;
            let operator = BooleanOperator::parse(operator_name)
                .ok_or_else(|| invalid(format!("unsupported booleanOperator '{}'", operator_name)))?;
            let predicates = node
                .children()
                .filter(|c| c.is_element() && PREDICATES.contains(&c.tag_name().name()))
                .map(parse_predicate_element)
                .collect::<Result<Vec<_>>>()?;
            if predicates.is_empty() {
                return Err(invalid("CompoundPredicate has no predicates"));
            }
            Ok(Predicate::Compound {
                operator,
                predicates,
            })
        }
        "SimpleSetPredicate" => {
            let is_in = match required(node, "booleanOperator")? {
                "isIn" => true,
                "isNotIn" => false,
                other => return Err(invalid(format!("unsupported set operator '{}'", other))),
            };
            let array = child(node, "Array").ok_or_else(|| invalid("SimpleSetPredicate has no Array"))?;
            Ok(Predicate::Set {
                field: required(node, "field")?.to_string(),
                is_in,
                values: parse_array(array.text().unwrap_or_default()),
            })
        }
        other => Err(invalid(format!("unsupported predicate <{}>", other))),
    }
}

/// Split the content of an `Array` element; double quotes group tokens
/// containing spaces and `\"` escapes a quote inside them.
pub fn parse_array(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' if chars.peek() == Some(&'"') => {
                        token.push('"');
                        chars.next();
                    }
                    '"' => break,
                    _ => token.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    tokens
}

fn child<'a, 'input>(node: XmlNode<'a, 'input>, name: &str) -> Option<XmlNode<'a, 'input>> {
    node.children().find(|c| c.is_element() && c.tag_name().name() == name)
}

fn children<'a, 'input: 'a>(
    node: XmlNode<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = XmlNode<'a, 'input>> + 'a {
    node.children()
        .filter(move |c| c.is_element() && c.tag_name().name() == name)
}

fn required<'a>(node: XmlNode<'a, '_>, attribute: &str) -> Result<&'a str> {
    node.attribute(attribute).ok_or_else(|| {
        invalid(format!(
            "<{}> is missing attribute '{}'",
            node.tag_name().name(),
            attribute
        ))
    })
}

fn number(node: XmlNode, attribute: &str) -> Result<Option<f64>> {
    node.attribute(attribute)
        .map(|s| {
            s.trim().parse::<f64>().map_err(|_| {
                invalid(format!(
                    "<{}> attribute '{}' is not a number: '{}'",
                    node.tag_name().name(),
                    attribute,
                    s
                ))
            })
        })
        .transpose()
}

fn invalid(message: impl Into<String>) -> ServingError {
    ServingError::InvalidArtifact(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_array_tokens() {
        assert_eq!(parse_array("a b  c"), vec!["a", "b", "c"]);
        assert_eq!(
            parse_array(r#""New York" Boston "say \"hi\"""#),
            vec!["New York", "Boston", "say \"hi\""]
        );
        assert!(parse_array("   ").is_empty());
    }

    #[test]
    fn test_parse_tree_with_set_predicate() {
        let xml = r#"<?xml version="1.0"?>
<PMML xmlns="http://www.dmg.org/PMML-4_3" version="4.3">
  <DataDictionary numberOfFields="2">
    <DataField name="city" optype="categorical" dataType="string">
      <Value value="Paris"/><Value value="Rome"/><Value value="Oslo"/>
      <Value value="?" property="missing"/>
    </DataField>
    <DataField name="warm" optype="categorical" dataType="string">
      <Value value="yes"/><Value value="no"/>
    </DataField>
  </DataDictionary>
  <TreeModel functionName="classification" missingValueStrategy="lastPrediction">
    <MiningSchema>
      <MiningField name="city"/>
      <MiningField name="warm" usageType="target"/>
    </MiningSchema>
    <Node score="no">
      <True/>
      <Node score="yes">
        <SimpleSetPredicate field="city" booleanOperator="isIn">
          <Array n="2" type="string">Paris Rome</Array>
        </SimpleSetPredicate>
      </Node>
      <Node score="no"><True/></Node>
    </Node>
  </TreeModel>
</PMML>"#;

        let doc = parse(xml).unwrap();
        assert_eq!(doc.version, "4.3");
        assert_eq!(doc.data_dictionary[0].values, vec!["Paris", "Rome", "Oslo"]);
        assert_eq!(doc.mining_schema[1].usage, FieldUsage::Target);
        match &doc.model {
            ModelElement::Tree(tree) => {
                assert_eq!(tree.missing_value_strategy, MissingValueStrategy::LastPrediction);
                assert_eq!(tree.root.children.len(), 2);
                assert!(matches!(tree.root.children[0].predicate, Predicate::Set { is_in: true, .. }));
            }
            other => panic!("unexpected model {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_documents() {
        assert!(matches!(parse("not xml"), Err(ServingError::InvalidArtifact(_))));
        assert!(matches!(parse("<Model/>"), Err(ServingError::InvalidArtifact(_))));
        let no_model = r#"<PMML version="4.4"><DataDictionary/></PMML>"#;
        assert!(matches!(parse(no_model), Err(ServingError::InvalidArtifact(_))));
        let bad_method = r#"<PMML version="4.4"><DataDictionary/>
            <MiningModel functionName="classification"><MiningSchema/>
              <Segmentation multipleModelMethod="median"/>
            </MiningModel></PMML>"#;
        assert!(matches!(parse(bad_method), Err(ServingError::InvalidArtifact(_))));
    }
}
