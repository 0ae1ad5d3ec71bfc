//! Error and notice response messages.

use std::collections::HashMap;

use crate::error::{Error, Result, ServerError};
use crate::protocol::codec::read_cstr;

/// Parse error/notice fields from payload into a `ServerError`.
fn parse_fields(payload: &[u8]) -> Result<ServerError> {
    let mut fields = HashMap::new();
    let mut data = payload;

    while !data.is_empty() && data[0] != 0 {
        let field_type = data[0];
        data = &data[1..];

        let (value, rest) = read_cstr(data)?;
        data = rest;

        fields.insert(field_type, value.to_string());
    }

    Ok(ServerError::new(fields))
}

/// ErrorResponse message - fatal error from server.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    /// Parsed error fields
    pub fields: ServerError,
}

impl ErrorResponse {
    /// Parse an ErrorResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            fields: parse_fields(payload)?,
        })
    }

    /// Convert to an Error.
    pub fn into_error(self) -> Error {
        Error::SqlError(self.fields)
    }

    /// Get the SQLSTATE code.
    pub fn code(&self) -> &str {
        self.fields.code()
    }

    /// Get the primary message.
    pub fn message(&self) -> &str {
        self.fields.message()
    }

    /// Get the severity.
    pub fn severity(&self) -> &str {
        self.fields.severity_v()
    }
}

#[cfg(test)]
mod error_response_tests {
    use super::*;
    use crate::error::field_type;

    fn field(type_byte: u8, value: &str) -> Vec<u8> {
        let mut bytes = vec![type_byte];
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        bytes
    }

    #[test]
    fn parses_error_fields_up_to_terminator() {
        let mut payload = Vec::new();
        payload.extend(field(field_type::SEVERITY_V, "ERROR"));
        payload.extend(field(field_type::CODE, "42601"));
        payload.extend(field(field_type::MESSAGE, "syntax error"));
        payload.push(0);

        let error = ErrorResponse::parse(&payload).unwrap();
        assert_eq!(error.severity(), "ERROR");
        assert_eq!(error.code(), "42601");
        assert_eq!(error.message(), "syntax error");
    }

    #[test]
    fn into_error_produces_sql_error() {
        let mut payload = Vec::new();
        payload.extend(field(field_type::SEVERITY_V, "FATAL"));
        payload.extend(field(field_type::CODE, "57P01"));
        payload.push(0);

        let error = ErrorResponse::parse(&payload).unwrap().into_error();
        assert!(matches!(error, crate::error::Error::SqlError(_)));
        assert!(error.is_fatal_to_connection());
    }
}

/// NoticeResponse message - non-fatal warning/info from server.
#[derive(Debug, Clone)]
pub struct NoticeResponse {
    /// Parsed notice fields
    pub fields: ServerError,
}

impl NoticeResponse {
    /// Parse a NoticeResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            fields: parse_fields(payload)?,
        })
    }

    /// Get the SQLSTATE code.
    pub fn code(&self) -> &str {
        self.fields.code()
    }

    /// Get the primary message.
    pub fn message(&self) -> &str {
        self.fields.message()
    }

    /// Get the severity.
    pub fn severity(&self) -> &str {
        self.fields.severity_v()
    }
}
