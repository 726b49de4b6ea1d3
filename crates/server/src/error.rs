// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared by the HTTP and WebSocket boundaries.
///
/// Internal failures travel as `anyhow::Error`; this enum is the taxonomy a
/// client sees. No stack traces cross the boundary; each response carries a
/// code plus a single-line message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Invalid input: bad working directory, oversize payload, malformed id.
    Validation,
    /// Message payload was empty or whitespace-only.
    EmptyPayload,
    /// Session cap exhausted; retry after a termination.
    Capacity,
    /// Unknown session or message id.
    NotFound,
    /// Child process failed to spawn or become ready after retries.
    Spawn,
    /// Prompt detection timed out (initial readiness or message completion).
    Timeout,
    /// The child's stdin became unwritable and retries were exhausted.
    Stdin,
    /// Health check observed a dead process or a stuck message.
    Unhealthy,
    /// Queue save failed; the backup was restored.
    Persistence,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::EmptyPayload => 422,
            Self::Capacity => 409,
            Self::NotFound => 404,
            Self::Spawn => 500,
            Self::Timeout => 504,
            Self::Stdin => 502,
            Self::Unhealthy => 409,
            Self::Persistence => 500,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::EmptyPayload => "EMPTY_PAYLOAD",
            Self::Capacity => "CAPACITY",
            Self::NotFound => "NOT_FOUND",
            Self::Spawn => "SPAWN",
            Self::Timeout => "TIMEOUT",
            Self::Stdin => "STDIN",
            Self::Unhealthy => "UNHEALTHY",
            Self::Persistence => "PERSISTENCE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A boundary error: code plus a human-readable one-liner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub code: ErrorCode,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { error: message.into(), code }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.error)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
