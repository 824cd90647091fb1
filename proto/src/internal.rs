//! Internal errors shared across the workspace. These are infrastructure
//! faults, not protocol outcomes — a store that cannot be reached, state
//! that fails to serialise. Protocol-expected failures never use these.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    Backend,
    NoMatchingEntries,
    InvalidState,
    InvalidValueState,
    SerdeJsonError,
    CryptographyError,
}

impl Display for OperationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationError::Backend => write!(f, "backend storage failure"),
            OperationError::NoMatchingEntries => write!(f, "no matching entries"),
            OperationError::InvalidState => write!(f, "invalid state"),
            OperationError::InvalidValueState => write!(f, "invalid value state"),
            OperationError::SerdeJsonError => write!(f, "serde json failure"),
            OperationError::CryptographyError => write!(f, "cryptography failure"),
        }
    }
}

impl std::error::Error for OperationError {}
