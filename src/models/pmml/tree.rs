//! Decision tree walk

use super::predicate::{Predicate, Truth};
use super::{MiningFunction, Prediction};
use crate::error::{Result, ServingError};
use crate::types::Record;
use indexmap::IndexMap;

/// What to do when a child predicate cannot be decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingValueStrategy {
    /// Treat the predicate as false and try the next sibling
    #[default]
    None,
    /// Stop and return the current node
    LastPrediction,
    /// Stop and return no prediction
    NullPrediction,
    /// Follow the node's `defaultChild`
    DefaultChild,
}

impl MissingValueStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "none" => MissingValueStrategy::None,
            "lastPrediction" => MissingValueStrategy::LastPrediction,
            "nullPrediction" => MissingValueStrategy::NullPrediction,
            "defaultChild" => MissingValueStrategy::DefaultChild,
            _ => return None,
        })
    }
}

/// What to do when no child predicate is true
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoTrueChildStrategy {
    #[default]
    ReturnNullPrediction,
    ReturnLastPrediction,
}

impl NoTrueChildStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "returnNullPrediction" => NoTrueChildStrategy::ReturnNullPrediction,
            "returnLastPrediction" => NoTrueChildStrategy::ReturnLastPrediction,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreDistribution {
    pub value: String,
    pub record_count: f64,
    pub probability: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: Option<String>,
    pub score: Option<String>,
    pub predicate: Predicate,
    pub default_child: Option<String>,
    pub distribution: Vec<ScoreDistribution>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeModel {
    pub function: MiningFunction,
    pub missing_value_strategy: MissingValueStrategy,
    pub no_true_child_strategy: NoTrueChildStrategy,
    pub root: Node,
}

impl TreeModel {
    /// Score one row of prepared inputs
    pub fn predict(&self, inputs: &Record, categories: &[String]) -> Result<Prediction> {
        match self.find_leaf(inputs) {
            Some(node) => node_prediction(node, self.function, categories),
            None => Ok(Prediction::Null),
        }
    }

    fn find_leaf<'a>(&'a self, inputs: &Record) -> Option<&'a Node> {
        if self.root.predicate.evaluate(inputs) != Truth::True {
            return None;
        }
        let mut current = &self.root;
        loop {
            if current.children.is_empty() {
                return Some(current);
            }
            let mut next = None;
            for child in &current.children {
                match child.predicate.evaluate(inputs) {
                    Truth::True => {
                        next = Some(child);
                        break;
                    }
                    Truth::False => {}
                    Truth::Unknown => match self.missing_value_strategy {
                        MissingValueStrategy::None => {}
                        MissingValueStrategy::LastPrediction => return Some(current),
                        MissingValueStrategy::NullPrediction => return None,
                        MissingValueStrategy::DefaultChild => {
                            let default = current.default_child.as_deref().and_then(|id| {
                                current.children.iter().find(|c| c.id.as_deref() == Some(id))
                            });
                            match default {
                                Some(d) => {
                                    next = Some(d);
                                    break;
                                }
                                None => return Some(current),
                            }
                        }
                    },
                }
            }
            match next {
                Some(child) => current = child,
                None => {
                    return match self.no_true_child_strategy {
                        NoTrueChildStrategy::ReturnNullPrediction => None,
                        NoTrueChildStrategy::ReturnLastPrediction => Some(current),
                    }
                }
            }
        }
    }

    /// Every label a node can produce, in document order
    pub fn collect_labels(&self, out: &mut Vec<String>) {
        collect_node_labels(&self.root, out);
    }
}

fn collect_node_labels(node: &Node, out: &mut Vec<String>) {
    for label in node.score.iter().chain(node.distribution.iter().map(|d| &d.value)) {
        if !out.contains(label) {
            out.push(label.clone());
        }
    }
    for child in &node.children {
        collect_node_labels(child, out);
    }
}

fn node_prediction(node: &Node, function: MiningFunction, categories: &[String]) -> Result<Prediction> {
    match function {
        MiningFunction::Regression => match &node.score {
            Some(score) => score.trim().parse::<f64>().map(Prediction::Regression).map_err(|_| {
                ServingError::Evaluation(format!("regression score '{}' is not numeric", score))
            }),
            None => Ok(Prediction::Null),
        },
        MiningFunction::Classification => {
            let mut probabilities: IndexMap<String, f64> =
                categories.iter().map(|c| (c.clone(), 0.0)).collect();
            let total: f64 = node.distribution.iter().map(|d| d.record_count).sum();
            for d in &node.distribution {
                let p = d
                    .probability
                    .unwrap_or(if total > 0.0 { d.record_count / total } else { 0.0 });
                *probabilities.entry(d.value.clone()).or_insert(0.0) += p;
            }

            let label = match &node.score {
                Some(score) => score.clone(),
                None => match probabilities
                    .iter()
                    .fold(None::<(&String, f64)>, |best, (k, &p)| match best {
                        Some((_, b)) if p <= b => best,
                        _ => Some((k, p)),
                    }) {
                    Some((k, _)) if !node.distribution.is_empty() => k.clone(),
                    _ => return Ok(Prediction::Null),
                },
            };

            // A leaf without a distribution is certain of its own score.
            if node.distribution.is_empty() {
                probabilities.insert(label.clone(), 1.0);
            }

            Ok(Prediction::Classification { label, probabilities })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::predicate::Operator;
    use super::*;
    use crate::types::Value;

    fn leaf(id: &str, score: &str, predicate: Predicate, counts: &[(&str, f64)]) -> Node {
        Node {
            id: Some(id.to_string()),
            score: Some(score.to_string()),
            predicate,
            default_child: None,
            distribution: counts
                .iter()
                .map(|(v, c)| ScoreDistribution {
                    value: v.to_string(),
                    record_count: *c,
                    probability: None,
                })
                .collect(),
            children: Vec::new(),
        }
    }

    fn lt(field: &str, value: &str) -> Predicate {
        Predicate::Simple {
            field: field.into(),
            operator: Operator::LessThan,
            value: Some(value.into()),
        }
    }

    fn ge(field: &str, value: &str) -> Predicate {
        Predicate::Simple {
            field: field.into(),
            operator: Operator::GreaterOrEqual,
            value: Some(value.into()),
        }
    }

    fn stump(missing: MissingValueStrategy, no_true: NoTrueChildStrategy) -> TreeModel {
        let mut root = leaf("0", "b", Predicate::True, &[("a", 2.0), ("b", 6.0)]);
        root.children = vec![
            leaf("1", "a", lt("x", "0.5"), &[("a", 2.0), ("b", 0.0)]),
            leaf("2", "b", ge("x", "1.5"), &[("a", 0.0), ("b", 6.0)]),
        ];
        root.default_child = Some("2".into());
        TreeModel {
            function: MiningFunction::Classification,
            missing_value_strategy: missing,
            no_true_child_strategy: no_true,
            root,
        }
    }

    fn row(x: Option<f64>) -> Record {
        let mut r = Record::new();
        r.insert("x".into(), x.map(Value::Float).unwrap_or(Value::Null));
        r
    }

    fn label(p: Prediction) -> Option<String> {
        match p {
            Prediction::Classification { label, .. } => Some(label),
            _ => None,
        }
    }

    #[test]
    fn test_walk_to_leaf_with_probabilities() {
        let tree = stump(MissingValueStrategy::None, NoTrueChildStrategy::ReturnNullPrediction);
        let categories = vec!["a".to_string(), "b".to_string()];
        match tree.predict(&row(Some(0.1)), &categories).unwrap() {
            Prediction::Classification { label, probabilities } => {
                assert_eq!(label, "a");
                assert_eq!(probabilities["a"], 1.0);
                assert_eq!(probabilities["b"], 0.0);
            }
            other => panic!("unexpected prediction {:?}", other),
        }
    }

    #[test]
    fn test_no_true_child_strategies() {
        let categories = vec!["a".to_string(), "b".to_string()];
        let null = stump(MissingValueStrategy::None, NoTrueChildStrategy::ReturnNullPrediction);
        assert_eq!(null.predict(&row(Some(1.0)), &categories).unwrap(), Prediction::Null);

        let last = stump(MissingValueStrategy::None, NoTrueChildStrategy::ReturnLastPrediction);
        assert_eq!(label(last.predict(&row(Some(1.0)), &categories).unwrap()), Some("b".into()));
    }

    #[test]
    fn test_missing_value_strategies() {
        let categories = vec!["a".to_string(), "b".to_string()];
        let last = stump(MissingValueStrategy::LastPrediction, NoTrueChildStrategy::ReturnNullPrediction);
        assert_eq!(label(last.predict(&row(None), &categories).unwrap()), Some("b".into()));

        let null = stump(MissingValueStrategy::NullPrediction, NoTrueChildStrategy::ReturnLastPrediction);
        assert_eq!(null.predict(&row(None), &categories).unwrap(), Prediction::Null);

        let default = stump(MissingValueStrategy::DefaultChild, NoTrueChildStrategy::ReturnNullPrediction);
        match default.predict(&row(None), &categories).unwrap() {
            Prediction::Classification { label, probabilities } => {
                assert_eq!(label, "b");
                assert_eq!(probabilities["b"], 1.0);
            }
            other => panic!("unexpected prediction {:?}", other),
        }
    }

    #[test]
    fn test_regression_leaf() {
        let mut root = leaf("0", "1.0", Predicate::True, &[]);
        root.children = vec![leaf("1", "3.25", Predicate::True, &[])];
        let tree = TreeModel {
            function: MiningFunction::Regression,
            missing_value_strategy: MissingValueStrategy::None,
            no_true_child_strategy: NoTrueChildStrategy::ReturnNullPrediction,
            root,
        };
        assert_eq!(tree.predict(&row(None), &[]).unwrap(), Prediction::Regression(3.25));
    }
}
