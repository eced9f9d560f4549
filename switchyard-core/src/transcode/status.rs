//! Translation of canonical status codes into each protocol's native error form.
//!
//! | Code                | HTTP | Connect               |
//! |---------------------|------|-----------------------|
//! | Cancelled           | 499  | `canceled`            |
//! | Unknown             | 500  | `unknown`             |
//! | InvalidArgument     | 400  | `invalid_argument`    |
//! | DeadlineExceeded    | 504  | `deadline_exceeded`   |
//! | NotFound            | 404  | `not_found`           |
//! | AlreadyExists       | 409  | `already_exists`      |
//! | PermissionDenied    | 403  | `permission_denied`   |
//! | ResourceExhausted   | 429  | `resource_exhausted`  |
//! | FailedPrecondition  | 400  | `failed_precondition` |
//! | Aborted             | 409  | `aborted`             |
//! | OutOfRange          | 400  | `out_of_range`        |
//! | Unimplemented       | 501  | `unimplemented`       |
//! | Internal            | 500  | `internal`            |
//! | Unavailable         | 503  | `unavailable`         |
//! | DataLoss            | 500  | `data_loss`           |
//! | Unauthenticated     | 401  | `unauthenticated`     |
use http::{HeaderMap, HeaderValue, StatusCode};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use tonic::{Code, Status};

/// `grpc-message` escapes everything outside printable ASCII, and `%` itself.
const GRPC_MESSAGE: &AsciiSet = &CONTROLS.add(b'%');

pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
    }
}

pub fn connect_code(code: Code) -> &'static str {
    match code {
        Code::Ok => "ok",
        Code::Cancelled => "canceled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    }
}

/// `{"code": 5, "message": "..."}`, the `google.rpc.Status` JSON shape used by REST.
pub fn rest_error_body(status: &Status) -> serde_json::Value {
    serde_json::json!({
        "code": status.code() as i32,
        "message": status.message(),
    })
}

/// `{"code": "not_found", "message": "..."}`, the Connect error shape.
pub fn connect_error_body(status: &Status) -> serde_json::Value {
    let mut error = serde_json::json!({ "code": connect_code(status.code()) });
    if !status.message().is_empty() {
        error["message"] = status.message().into();
    }
    error
}

/// `grpc-status` and `grpc-message` as header/trailer entries.
pub fn grpc_trailers(status: Option<&Status>) -> HeaderMap {
    let mut trailers = HeaderMap::with_capacity(2);
    let code = status.map_or(Code::Ok, Status::code) as i32;
    trailers.insert("grpc-status", HeaderValue::from(code));

    if let Some(status) = status
        && !status.message().is_empty()
    {
        let escaped = utf8_percent_encode(status.message(), GRPC_MESSAGE).to_string();
        if let Ok(value) = HeaderValue::from_str(&escaped) {
            trailers.insert("grpc-message", value);
        }
    }
    trailers
}

/// The gRPC-Web trailer block: `name: value\r\n` lines.
pub fn grpc_web_trailer_block(status: Option<&Status>) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in &grpc_trailers(status) {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_codes_to_http() {
        assert_eq!(http_status(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(http_status(Code::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(Code::Cancelled).as_u16(), 499);
        assert_eq!(http_status(Code::FailedPrecondition), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn maps_codes_to_connect() {
        assert_eq!(connect_code(Code::Cancelled), "canceled");
        assert_eq!(connect_code(Code::DeadlineExceeded), "deadline_exceeded");
    }

    #[test]
    fn error_bodies() {
        let status = Status::not_found("user 0 not found");

        assert_eq!(
            rest_error_body(&status),
            serde_json::json!({"code": 5, "message": "user 0 not found"})
        );
        assert_eq!(
            connect_error_body(&status),
            serde_json::json!({"code": "not_found", "message": "user 0 not found"})
        );
    }

    #[test]
    fn grpc_messages_are_percent_encoded() {
        let trailers = grpc_trailers(Some(&Status::internal("50% done\nnot ok")));

        assert_eq!(trailers["grpc-status"], "13");
        assert_eq!(trailers["grpc-message"], "50%25 done%0Anot ok");
        assert_eq!(grpc_trailers(None)["grpc-status"], "0");
    }

    #[test]
    fn grpc_web_trailer_block_is_crlf_separated() {
        let block = grpc_web_trailer_block(Some(&Status::unavailable("down")));
        assert_eq!(block, b"grpc-status: 14\r\ngrpc-message: down\r\n");
    }
}
