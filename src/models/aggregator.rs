//! Score aggregation for segmented tree ensembles

use crate::error::{Result, ServingError};
use crate::models::pmml::{MiningFunction, Prediction};
use indexmap::IndexMap;

/// How the predictions of a `Segmentation` are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipleModelMethod {
    MajorityVote,
    WeightedMajorityVote,
    Average,
    WeightedAverage,
    Median,
    Sum,
    Max,
    SelectFirst,
}

impl MultipleModelMethod {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "majorityVote" => MultipleModelMethod::MajorityVote,
            "weightedMajorityVote" => MultipleModelMethod::WeightedMajorityVote,
            "average" => MultipleModelMethod::Average,
            "weightedAverage" => MultipleModelMethod::WeightedAverage,
            "median" => MultipleModelMethod::Median,
            "sum" => MultipleModelMethod::Sum,
            "max" => MultipleModelMethod::Max,
            "selectFirst" => MultipleModelMethod::SelectFirst,
            _ => return None,
        })
    }

    /// Whether the method is defined for the given mining function
    pub fn supports(&self, function: MiningFunction) -> bool {
        use MultipleModelMethod::*;
        match function {
            MiningFunction::Classification => !matches!(self, Median | Sum),
            MiningFunction::Regression => !matches!(self, MajorityVote | WeightedMajorityVote),
        }
    }
}

/// Combines segment predictions into the ensemble prediction.
pub struct ScoreAggregator {
    method: MultipleModelMethod,
}

impl ScoreAggregator {
    pub fn new(method: MultipleModelMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> MultipleModelMethod {
        self.method
    }

    /// Combine `(weight, prediction)` pairs from the segments whose predicate
    /// held. Null predictions do not take part; no predictions gives null.
    pub fn combine(&self, votes: &[(f64, Prediction)], categories: &[String]) -> Result<Prediction> {
        if self.method == MultipleModelMethod::SelectFirst {
            return Ok(votes.first().map(|(_, p)| p.clone()).unwrap_or(Prediction::Null));
        }

        let votes: Vec<&(f64, Prediction)> = votes.iter().filter(|(_, p)| *p != Prediction::Null).collect();
        let first = match votes.first() {
            Some((_, p)) => p,
            None => return Ok(Prediction::Null),
        };

        match first {
            Prediction::Regression(_) => {
                let scores = votes
                    .iter()
                    .map(|(w, p)| match p {
                        Prediction::Regression(s) => Ok((*w, *s)),
                        _ => Err(mixed_segments()),
                    })
                    .collect::<Result<Vec<(f64, f64)>>>()?;
                self.combine_scores(&scores).map(Prediction::Regression)
            }
            _ => {
                let labels = votes
                    .iter()
                    .map(|(w, p)| match p {
                        Prediction::Classification { label, probabilities } => {
                            Ok((*w, label.as_str(), probabilities))
                        }
                        _ => Err(mixed_segments()),
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.combine_labels(&labels, categories)
            }
        }
    }

    fn combine_scores(&self, scores: &[(f64, f64)]) -> Result<f64> {
        match self.method {
            MultipleModelMethod::Average => {
                Ok(scores.iter().map(|(_, s)| s).sum::<f64>() / scores.len() as f64)
            }
            MultipleModelMethod::WeightedAverage => Ok(weighted_average(scores)),
            MultipleModelMethod::Median => {
                let values: Vec<f64> = scores.iter().map(|(_, s)| *s).collect();
                Ok(Self::median_score(&values))
            }
            MultipleModelMethod::Sum => Ok(scores.iter().map(|(_, s)| s).sum()),
            MultipleModelMethod::Max => Ok(Self::max_score(scores.iter().map(|(_, s)| *s))),
            other => Err(ServingError::Evaluation(format!(
                "{:?} cannot combine regression segments",
                other
            ))),
        }
    }

    fn combine_labels(
        &self,
        votes: &[(f64, &str, &IndexMap<String, f64>)],
        categories: &[String],
    ) -> Result<Prediction> {
        let mut tally: IndexMap<String, f64> = categories.iter().map(|c| (c.clone(), 0.0)).collect();

        match self.method {
            MultipleModelMethod::MajorityVote | MultipleModelMethod::WeightedMajorityVote => {
                let weighted = self.method == MultipleModelMethod::WeightedMajorityVote;
                for (w, label, _) in votes {
                    *tally.entry(label.to_string()).or_insert(0.0) += if weighted { *w } else { 1.0 };
                }
                let total: f64 = tally.values().sum();
                if total > 0.0 {
                    tally.values_mut().for_each(|v| *v /= total);
                }
            }
            MultipleModelMethod::Average | MultipleModelMethod::WeightedAverage => {
                let weighted = self.method == MultipleModelMethod::WeightedAverage;
                let mut total_weight = 0.0;
                for (w, _, probabilities) in votes {
                    let w = if weighted { *w } else { 1.0 };
                    total_weight += w;
                    for (category, p) in probabilities.iter() {
                        *tally.entry(category.clone()).or_insert(0.0) += p * w;
                    }
                }
                if total_weight > 0.0 {
                    tally.values_mut().for_each(|v| *v /= total_weight);
                }
            }
            MultipleModelMethod::Max => {
                // The most confident segment wins outright.
                let mut best: Option<(f64, &str, &IndexMap<String, f64>)> = None;
                for (_, label, probabilities) in votes {
                    let confidence = probabilities.get(*label).copied().unwrap_or(0.0);
                    if best.map_or(true, |(b, _, _)| confidence > b) {
                        best = Some((confidence, label, probabilities));
                    }
                }
                if let Some((_, label, probabilities)) = best {
                    for (category, p) in probabilities.iter() {
                        tally.insert(category.clone(), *p);
                    }
                    return Ok(Prediction::Classification {
                        label: label.to_string(),
                        probabilities: tally,
                    });
                }
            }
            other => {
                return Err(ServingError::Evaluation(format!(
                    "{:?} cannot combine classification segments",
                    other
                )))
            }
        }

        let label = tally
            .iter()
            .fold(None::<(&String, f64)>, |best, (k, &v)| match best {
                Some((_, b)) if v <= b => best,
                _ => Some((k, v)),
            })
            .map(|(k, _)| k.clone());

        Ok(match label {
            Some(label) => Prediction::Classification {
                label,
                probabilities: tally,
            },
            None => Prediction::Null,
        })
    }

    /// Get the maximum score among all segments.
    pub fn max_score(scores: impl Iterator<Item = f64>) -> f64 {
        scores.fold(f64::NEG_INFINITY, f64::max)
    }

    /// Get the median score among all segments.
    pub fn median_score(scores: &[f64]) -> f64 {
        let mut scores = scores.to_vec();
        scores.sort_by(|a, b| a.total_cmp(b));

        if scores.is_empty() {
            return f64::NAN;
        }

        let mid = scores.len() / 2;
        if scores.len() % 2 == 0 {
            (scores[mid - 1] + scores[mid]) / 2.0
        } else {
            scores[mid]
        }
    }
}

fn weighted_average(scores: &[(f64, f64)]) -> f64 {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for (weight, score) in scores {
        weighted_sum += score * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        f64::NAN
    }
}

fn mixed_segments() -> ServingError {
    ServingError::Evaluation("segments mix classification and regression results".to_string())
}
