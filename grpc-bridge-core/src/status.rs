//! RPC status codes and the [`Status`] type carried in trailers and cancels.
//!
//! Codes use the canonical numeric values; the numeric value is what a
//! stream cancel hands to the host transport.

use std::fmt;

/// Canonical RPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Numeric value as written to `grpc-status` and to stream resets.
    pub fn value(self) -> u32 {
        self as u32
    }

    /// Look up a code by numeric value.
    ///
    /// Values outside the canonical range map to [`Code::Unknown`].
    pub fn from_value(value: u32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an RPC: a code plus an optional human-readable description.
///
/// # Example
///
/// ```
/// use grpc_bridge_core::{Code, Status};
///
/// let status = Status::resource_exhausted("message too large");
/// assert_eq!(status.code(), Code::ResourceExhausted);
/// assert_eq!(status.code().value(), 8);
/// assert_eq!(status.to_string(), "RESOURCE_EXHAUSTED: message too large");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: Option<String>,
}

impl Status {
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Replace the description, keeping the code.
    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn resource_exhausted<S: Into<String>>(message: S) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unavailable, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values_match_wire_numbers() {
        assert_eq!(Code::Ok.value(), 0);
        assert_eq!(Code::Cancelled.value(), 1);
        assert_eq!(Code::ResourceExhausted.value(), 8);
        assert_eq!(Code::Internal.value(), 13);
        assert_eq!(Code::Unauthenticated.value(), 16);
    }

    #[test]
    fn test_code_from_value() {
        for value in 0..=16 {
            assert_eq!(Code::from_value(value).value(), value);
        }
        assert_eq!(Code::from_value(17), Code::Unknown);
        assert_eq!(Code::from_value(u32::MAX), Code::Unknown);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::internal("boom").to_string(), "INTERNAL: boom");
        assert_eq!(Status::from_code(Code::Cancelled).to_string(), "CANCELLED");
    }

    #[test]
    fn test_status_with_message() {
        let status = Status::from_code(Code::Unavailable).with_message("draining");
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), Some("draining"));
        assert!(!status.is_ok());
        assert!(Status::ok().is_ok());
    }
}
