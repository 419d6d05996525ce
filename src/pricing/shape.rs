//! Strict parsing of model input-shape descriptors.
//!
//! Model descriptions carry their input shape either as a JSON array of
//! positive integers or as a parenthesised tuple literal such as
//! `"(128,128,1)"`. The literal is parsed against this fixed grammar only;
//! it is never evaluated as code.

use displaydoc::Display;
use thiserror::Error;

/// An invalid input-shape descriptor.
#[derive(Debug, Display, Error, Eq, PartialEq)]
pub enum ShapeError {
    /// input shape must be a tuple literal string or an array of integers
    UnsupportedDescriptor,
    /// input shape literal is not of the form "(d1,d2,..)": {0}
    Malformed(String),
    /// input shape dimensions must be positive integers
    NonPositiveDimension,
}

/// Parses an input-shape descriptor into its dimensions.
pub fn parse_input_shape(descriptor: &serde_json::Value) -> Result<Vec<u64>, ShapeError> {
    match descriptor {
        serde_json::Value::String(literal) => parse_tuple_literal(literal),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item.as_u64() {
                Some(dim) if dim > 0 => Ok(dim),
                Some(_) => Err(ShapeError::NonPositiveDimension),
                None => Err(ShapeError::UnsupportedDescriptor),
            })
            .collect(),
        _ => Err(ShapeError::UnsupportedDescriptor),
    }
}

fn parse_tuple_literal(literal: &str) -> Result<Vec<u64>, ShapeError> {
    let malformed = || ShapeError::Malformed(literal.to_string());

    let inner = literal
        .trim()
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(malformed)?;

    // A python-style trailing comma as in "(4,)" is allowed.
    let inner = inner.trim();
    let inner = inner.strip_suffix(',').unwrap_or(inner);
    if inner.trim().is_empty() {
        return Err(malformed());
    }

    inner
        .split(',')
        .map(|token| {
            let dim: u64 = token.trim().parse().map_err(|_| malformed())?;
            if dim == 0 {
                return Err(ShapeError::NonPositiveDimension);
            }
            Ok(dim)
        })
        .collect()
}
