// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    validation = { ErrorCode::Validation, 400 },
    empty_payload = { ErrorCode::EmptyPayload, 422 },
    capacity = { ErrorCode::Capacity, 409 },
    not_found = { ErrorCode::NotFound, 404 },
    timeout = { ErrorCode::Timeout, 504 },
    internal = { ErrorCode::Internal, 500 },
)]
fn http_status_mapping(code: ErrorCode, status: u16) {
    assert_eq!(code.http_status(), status);
}

#[test]
fn api_error_serializes_with_code_string() -> anyhow::Result<()> {
    let err = ApiError::new(ErrorCode::Capacity, "session cap reached");
    let json = serde_json::to_value(&err)?;
    assert_eq!(json["error"], "session cap reached");
    assert_eq!(json["code"], "CAPACITY");
    Ok(())
}

#[test]
fn display_includes_code_and_message() {
    let err = ApiError::new(ErrorCode::NotFound, "no such session");
    assert_eq!(err.to_string(), "NOT_FOUND: no such session");
}
