//! Federated averaging over nested numeric parameter structures.
//!
//! Clients submit their locally-trained model update as a [`ParameterTree`],
//! an arbitrarily nested structure of numeric leaves whose shape is fixed by
//! the model, not by the engine. [`federated_average`] folds all submissions
//! of one round into a tree of the same shape where every leaf is the
//! element-wise arithmetic mean across clients.

use std::collections::{BTreeMap, HashMap};

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sessions::UserId;

/// Errors returned by [`federated_average`].
#[derive(Debug, Display, Error, Eq, PartialEq)]
pub enum AggregationError {
    /// the average of zero client submissions is undefined
    NoClients,
    /// client submissions are not structurally isomorphic
    ShapeMismatch,
}

/// A nested numeric model-parameter structure.
///
/// This is the universal currency exchanged between clients and the
/// aggregator. It round-trips arbitrary JSON built from numbers, arrays and
/// objects, but is a closed union: anything that is not numeric at the leaves
/// fails deserialization instead of being carried along untyped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterTree {
    /// A single numeric leaf.
    Scalar(f64),
    /// A flat numeric leaf array, e.g. one weight vector.
    Values(Vec<f64>),
    /// An ordered container of subtrees.
    List(Vec<ParameterTree>),
    /// A keyed container of subtrees, e.g. `{"weights": .., "biases": ..}`.
    Map(BTreeMap<String, ParameterTree>),
}

impl ParameterTree {
    /// Returns a tree of the same shape with every leaf zeroed.
    fn zero_like(&self) -> Self {
        match self {
            Self::Scalar(_) => Self::Scalar(0.0),
            Self::Values(values) => Self::Values(vec![0.0; values.len()]),
            Self::List(items) => Self::List(items.iter().map(Self::zero_like).collect()),
            Self::Map(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(key, sub)| (key.clone(), sub.zero_like()))
                    .collect(),
            ),
        }
    }

    /// Adds `other` leaf-wise into `self`.
    ///
    /// Fails with [`AggregationError::ShapeMismatch`] as soon as the two
    /// trees disagree on nesting, keys or leaf lengths. `self` may be left
    /// partially updated on error; callers discard it in that case.
    fn add_assign(&mut self, other: &Self) -> Result<(), AggregationError> {
        match (self, other) {
            (Self::Scalar(acc), Self::Scalar(value)) => {
                *acc += value;
                Ok(())
            }
            (Self::Values(acc), Self::Values(values)) if acc.len() == values.len() => {
                for (acc_value, value) in acc.iter_mut().zip(values) {
                    *acc_value += value;
                }
                Ok(())
            }
            (Self::List(acc), Self::List(items)) if acc.len() == items.len() => {
                for (acc_item, item) in acc.iter_mut().zip(items) {
                    acc_item.add_assign(item)?;
                }
                Ok(())
            }
            (Self::Map(acc), Self::Map(entries)) if acc.len() == entries.len() => {
                for (key, acc_sub) in acc.iter_mut() {
                    let sub = entries.get(key).ok_or(AggregationError::ShapeMismatch)?;
                    acc_sub.add_assign(sub)?;
                }
                Ok(())
            }
            _ => Err(AggregationError::ShapeMismatch),
        }
    }

    /// Divides every leaf by `divisor`.
    fn divide(&mut self, divisor: f64) {
        match self {
            Self::Scalar(value) => *value /= divisor,
            Self::Values(values) => {
                for value in values {
                    *value /= divisor;
                }
            }
            Self::List(items) => {
                for item in items {
                    item.divide(divisor);
                }
            }
            Self::Map(entries) => {
                for sub in entries.values_mut() {
                    sub.divide(divisor);
                }
            }
        }
    }
}

/// Computes the element-wise arithmetic mean of all client submissions.
///
/// All trees must be structurally isomorphic: same nesting, same keys, same
/// leaf array lengths. The result does not depend on submission order beyond
/// floating-point associativity rounding.
///
/// # Errors
/// [`AggregationError::NoClients`] for an empty map,
/// [`AggregationError::ShapeMismatch`] for non-isomorphic trees.
pub fn federated_average(
    submissions: &HashMap<UserId, ParameterTree>,
) -> Result<ParameterTree, AggregationError> {
    let mut trees = submissions.values();
    let first = trees.next().ok_or(AggregationError::NoClients)?;

    let mut accumulator = first.zero_like();
    accumulator.add_assign(first)?;
    for tree in trees {
        accumulator.add_assign(tree)?;
    }
    accumulator.divide(submissions.len() as f64);
    Ok(accumulator)
}
