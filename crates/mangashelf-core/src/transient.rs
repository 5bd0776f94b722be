//! Transient-error predicate shared by the storage layer and job retry logic.
//!
//! Failures reach us in different shapes: a structured error with a type
//! name, message and code; a JSON value reported by another component; or a
//! bare string. The predicate only ever looks at those three structural
//! signals and never at ambient state.

use serde_json::Value;

/// Storage engine code: database server unreachable.
pub const CODE_SERVER_UNREACHABLE: &str = "P1001";
/// Storage engine code: database server did not answer the connection in time.
pub const CODE_SERVER_TIMEOUT: &str = "P1002";
/// Storage engine code: timed out fetching a connection from the pool.
pub const CODE_POOL_TIMEOUT: &str = "P2024";
/// SQLSTATE `serialization_failure`.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE `deadlock_detected`.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

const TRANSIENT_CODES: &[&str] = &[
    CODE_SERVER_UNREACHABLE,
    CODE_SERVER_TIMEOUT,
    CODE_POOL_TIMEOUT,
    SQLSTATE_SERIALIZATION_FAILURE,
    SQLSTATE_DEADLOCK_DETECTED,
];

/// Lowercased message fragments that mark a failure as transient.
const TRANSIENT_MESSAGES: &[&str] = &[
    "connection refused",
    "econnrefused",
    "connection reset",
    "econnreset",
    "etimedout",
    "timed out",
    "timeout",
    "circuit breaker",
    "can't reach database server",
    "database unreachable",
    "too many connections",
];

/// Lowercased message fragments that are always fatal, even when the rest of
/// the message looks like a connectivity problem.
const FATAL_MESSAGES: &[&str] = &[
    "authentication failed",
    "access denied",
    "permission denied",
    "invalid credentials",
    "invalid data",
    "validation",
];

/// The structural signals of a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureShape {
    pub type_name: Option<String>,
    pub message: Option<String>,
    pub code: Option<String>,
}

/// Any failure value the classifier may be handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Nothing was reported.
    Absent,
    /// A bare string with no structure to classify safely.
    Bare(String),
    /// An error object carrying some of type name, message and code.
    Shaped(FailureShape),
}

impl Failure {
    pub fn message(message: impl Into<String>) -> Self {
        Failure::Shaped(FailureShape {
            message: Some(message.into()),
            ..Default::default()
        })
    }

    pub fn coded(message: impl Into<String>, code: impl Into<String>) -> Self {
        Failure::Shaped(FailureShape {
            message: Some(message.into()),
            code: Some(code.into()),
            ..Default::default()
        })
    }

    /// Builds a failure from any `std::error::Error`, keeping its message.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::message(err.to_string())
    }

    /// Interprets a JSON failure value reported by another component.
    ///
    /// `null` is absent, strings are bare, objects contribute their `name`,
    /// `message` and `code` fields (numeric codes are stringified).
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Failure::Absent,
            Value::String(s) => Failure::Bare(s.clone()),
            Value::Object(map) => {
                let text = |key: &str| match map.get(key) {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                Failure::Shaped(FailureShape {
                    type_name: text("name"),
                    message: text("message"),
                    code: text("code"),
                })
            }
            other => Failure::Bare(other.to_string()),
        }
    }
}

/// Decides whether a failure is safe to retry without operator intervention.
pub fn is_transient_error(failure: &Failure) -> bool {
    let shape = match failure {
        Failure::Absent | Failure::Bare(_) => return false,
        Failure::Shaped(shape) => shape,
    };

    if let Some(message) = &shape.message {
        let message = message.to_lowercase();
        if FATAL_MESSAGES.iter().any(|m| message.contains(m)) {
            return false;
        }
        if TRANSIENT_MESSAGES.iter().any(|m| message.contains(m)) {
            return true;
        }
        if message.contains("ssl connection") && message.contains("closed") {
            return true;
        }
    }

    if let Some(code) = &shape.code
        && TRANSIENT_CODES.contains(&code.as_str())
    {
        return true;
    }

    shape
        .type_name
        .as_deref()
        .is_some_and(|name| name.contains("InitializationError"))
}
