//! Accumulation of independent failures.
//!
//! A unit of work that performs several independent steps records each failure
//! in an [`ErrorCollector`] instead of returning at the first one, then resolves
//! the collector into a single outcome.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Ordered list of recorded failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCollector {
    errors: Vec<Error>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure.
    pub fn add(&mut self, err: impl Into<Error>) {
        self.errors.push(err.into());
    }

    /// Record the failure of `res`, if any, and hand back its value otherwise.
    pub fn check<T>(&mut self, res: Result<T>) -> Option<T> {
        match res {
            Ok(value) => Some(value),
            Err(err) => {
                self.add(err);
                None
            }
        }
    }

    /// Record `err` if present. `None` is a no-op.
    pub fn extend(&mut self, err: Option<Error>) {
        if let Some(err) = err {
            self.add(err);
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok(())` when nothing was recorded, otherwise one aggregate error that
    /// carries every recorded cause in insertion order.
    pub fn resolve(&self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(Error::Aggregate(AggregateError {
            causes: self.errors.clone(),
        }))
    }
}

impl From<Vec<Error>> for ErrorCollector {
    fn from(errors: Vec<Error>) -> Self {
        Self { errors }
    }
}

/// Several failures reported as one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateError {
    causes: Vec<Error>,
}

impl AggregateError {
    pub fn causes(&self) -> &[Error] {
        &self.causes
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.causes.as_slice() {
            [only] => write!(f, "{only}"),
            causes => {
                write!(f, "{} errors: ", causes.len())?;
                for (idx, cause) in causes.iter().enumerate() {
                    if idx > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "[{}] {}", idx + 1, cause)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for AggregateError {}
