//! Seeding error types

use std::fmt;

use seedkey_transport::TransportError;
use thiserror::Error;

/// CTAP result codes a key reports in an ERROR response
pub mod ctap {
    pub const ERR_INVALID_COMMAND: u8 = 0x01;
    pub const ERR_INVALID_LENGTH: u8 = 0x03;
    pub const ERR_OPERATION_DENIED: u8 = 0x27;
    pub const ERR_UNSUPPORTED_OPTION: u8 = 0x2B;
}

/// Where a bounded wait expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the INIT response carrying our nonce
    ChannelNegotiation,
    /// Waiting for the key to answer the command (includes the user's touch)
    AwaitingResponse,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::ChannelNegotiation => f.write_str("channel negotiation"),
            Stage::AwaitingResponse => f.write_str("waiting for the key's response"),
        }
    }
}

/// Errors from seeding and other key operations
#[derive(Error, Debug)]
pub enum SeedingError {
    #[error("Seed must be exactly 32 bytes, got {0}")]
    InvalidSeedLength(usize),

    #[error("Extension state may be at most 256 bytes, got {0}")]
    ExtStateTooLong(usize),

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("The user did not confirm on the key in time")]
    UserDidNotAuthorize,

    #[error("The key does not support this command")]
    CommandNotSupported,

    #[error("The key does not support this seeding protocol version")]
    VersionNotSupported,

    #[error("The key reported an invalid length")]
    KeyReportedInvalidLength,

    #[error("Unknown seeding error (result code {0:?})")]
    Unknown(Option<u8>),

    #[error("Timed out during {0}")]
    Timeout(Stage),
}

impl SeedingError {
    /// Map the result byte of an ERROR response to a typed failure
    pub fn from_ctap_result(code: Option<u8>) -> Self {
        match code {
            Some(ctap::ERR_OPERATION_DENIED) => SeedingError::UserDidNotAuthorize,
            Some(ctap::ERR_INVALID_COMMAND) => SeedingError::CommandNotSupported,
            Some(ctap::ERR_UNSUPPORTED_OPTION) => SeedingError::VersionNotSupported,
            Some(ctap::ERR_INVALID_LENGTH) => SeedingError::KeyReportedInvalidLength,
            other => SeedingError::Unknown(other),
        }
    }

    /// True for failures caught before any device I/O
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SeedingError::InvalidSeedLength(_) | SeedingError::ExtStateTooLong(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctap_result_mapping() {
        assert!(matches!(
            SeedingError::from_ctap_result(Some(0x27)),
            SeedingError::UserDidNotAuthorize
        ));
        assert!(matches!(
            SeedingError::from_ctap_result(Some(0x01)),
            SeedingError::CommandNotSupported
        ));
        assert!(matches!(
            SeedingError::from_ctap_result(Some(0x2B)),
            SeedingError::VersionNotSupported
        ));
        assert!(matches!(
            SeedingError::from_ctap_result(Some(0x03)),
            SeedingError::KeyReportedInvalidLength
        ));
    }

    #[test]
    fn test_unmapped_codes_are_unknown() {
        assert!(matches!(
            SeedingError::from_ctap_result(Some(0x7F)),
            SeedingError::Unknown(Some(0x7F))
        ));
        assert!(matches!(
            SeedingError::from_ctap_result(None),
            SeedingError::Unknown(None)
        ));
    }

    #[test]
    fn test_timeout_message_names_stage() {
        let err = SeedingError::Timeout(Stage::ChannelNegotiation);
        assert_eq!(err.to_string(), "Timed out during channel negotiation");
    }
}
