//! PMML predicates with three-valued logic for missing inputs

use crate::types::{Record, Value};
use std::cmp::Ordering;

/// Result of evaluating a predicate; `Unknown` when a needed input is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl From<bool> for Truth {
    fn from(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    IsMissing,
    IsNotMissing,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "equal" => Operator::Equal,
            "notEqual" => Operator::NotEqual,
            "lessThan" => Operator::LessThan,
            "lessOrEqual" => Operator::LessOrEqual,
            "greaterThan" => Operator::GreaterThan,
            "greaterOrEqual" => Operator::GreaterOrEqual,
            "isMissing" => Operator::IsMissing,
            "isNotMissing" => Operator::IsNotMissing,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOperator {
    And,
    Or,
    Xor,
    Surrogate,
}

impl BooleanOperator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "and" => BooleanOperator::And,
            "or" => BooleanOperator::Or,
            "xor" => BooleanOperator::Xor,
            "surrogate" => BooleanOperator::Surrogate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    True,
    False,
    Simple {
        field: String,
        operator: Operator,
        value: Option<String>,
    },
    Compound {
        operator: BooleanOperator,
        predicates: Vec<Predicate>,
    },
    Set {
        field: String,
        is_in: bool,
        values: Vec<String>,
    },
}

impl Predicate {
    pub fn evaluate(&self, inputs: &Record) -> Truth {
        match self {
            Predicate::True => Truth::True,
            Predicate::False => Truth::False,
            Predicate::Simple {
                field,
                operator,
                value,
            } => evaluate_simple(lookup(inputs, field), *operator, value.as_deref()),
            Predicate::Compound {
                operator,
                predicates,
            } => evaluate_compound(*operator, predicates, inputs),
            Predicate::Set {
                field,
                is_in,
                values,
            } => match lookup(inputs, field) {
                None => Truth::Unknown,
                Some(v) => {
                    let found = values.iter().any(|candidate| compare(v, candidate) == Some(Ordering::Equal));
                    Truth::from(found == *is_in)
                }
            },
        }
    }
}

fn lookup<'a>(inputs: &'a Record, field: &str) -> Option<&'a Value> {
    inputs.get(field).filter(|v| !v.is_null())
}

fn evaluate_simple(input: Option<&Value>, operator: Operator, value: Option<&str>) -> Truth {
    match operator {
        Operator::IsMissing => return Truth::from(input.is_none()),
        Operator::IsNotMissing => return Truth::from(input.is_some()),
        _ => {}
    }
    let (input, value) = match (input, value) {
        (Some(i), Some(v)) => (i, v),
        _ => return Truth::Unknown,
    };
    let ordering = match compare(input, value) {
        Some(o) => o,
        // Incomparable values (e.g. text against a numeric threshold) never match.
        None => return Truth::from(operator == Operator::NotEqual),
    };
    Truth::from(match operator {
        Operator::Equal => ordering == Ordering::Equal,
        Operator::NotEqual => ordering != Ordering::Equal,
        Operator::LessThan => ordering == Ordering::Less,
        Operator::LessOrEqual => ordering != Ordering::Greater,
        Operator::GreaterThan => ordering == Ordering::Greater,
        Operator::GreaterOrEqual => ordering != Ordering::Less,
        Operator::IsMissing | Operator::IsNotMissing => unreachable!("handled above"),
    })
}

fn evaluate_compound(operator: BooleanOperator, predicates: &[Predicate], inputs: &Record) -> Truth {
    let mut results = predicates.iter().map(|p| p.evaluate(inputs));
    match operator {
        BooleanOperator::And => {
            let mut unknown = false;
            for r in results {
                match r {
                    Truth::False => return Truth::False,
                    Truth::Unknown => unknown = true,
                    Truth::True => {}
                }
            }
            if unknown {
                Truth::Unknown
            } else {
                Truth::True
            }
        }
        BooleanOperator::Or => {
            let mut unknown = false;
            for r in results {
                match r {
                    Truth::True => return Truth::True,
                    Truth::Unknown => unknown = true,
                    Truth::False => {}
                }
            }
            if unknown {
                Truth::Unknown
            } else {
                Truth::False
            }
        }
        BooleanOperator::Xor => {
            let mut parity = false;
            for r in results {
                match r {
                    Truth::Unknown => return Truth::Unknown,
                    Truth::True => parity = !parity,
                    Truth::False => {}
                }
            }
            Truth::from(parity)
        }
        BooleanOperator::Surrogate => results
            .find(|r| *r != Truth::Unknown)
            .unwrap_or(Truth::Unknown),
    }
}

/// Compare an input value with a literal from the model document
pub fn compare(input: &Value, literal: &str) -> Option<Ordering> {
    match input {
        Value::Int(_) | Value::Float(_) => {
            let lhs = input.as_f64()?;
            let rhs = literal.trim().parse::<f64>().ok()?;
            lhs.partial_cmp(&rhs)
        }
        Value::Bool(b) => {
            let rhs = match literal.trim() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => return None,
            };
            Some(b.cmp(&rhs))
        }
        Value::String(s) => Some(s.as_str().cmp(literal)),
        Value::Null | Value::Tensor(_) => None,
    }
}
