use serde::{Deserialize, Serialize};
use strum::Display;

/// Stable, machine-readable failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    SystemOverloaded,
    Validation,
    PageRender,
    PageDecode,
    PageTimeout,
    AllPagesFailed,
    Document,
    RequestTimeout,
    Timeout,
    NotFound,
    Internal,
}

/// Structured failure attached to a Failed job or returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
