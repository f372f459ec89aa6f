//! Error types for the Jet storage engine

use thiserror::Error;

/// All failure modes the engine can surface to a caller.
///
/// Variants follow the error-kind taxonomy from the component design:
/// I/O and format problems are distinguished from problems with a
/// particular value or identifier, and concurrency/feature-support
/// failures get their own kinds so callers can branch on them without
/// string matching.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary format error: {0}")]
    BinRw(String),

    /// Unknown Jet version, bad row header, invalid long-value type
    /// tag, malformed numeric payload, GUID parse failure, mis-typed
    /// page, and similar "the bytes don't mean what we expected" cases.
    #[error("format violation: {0}")]
    FormatViolation(String),

    /// Value out of range for a column's declared precision/scale or
    /// length, or a row validator predicate rejected the row.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Table/column/index name fails the identifier character rules.
    #[error("invalid identifier {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: String },

    /// Table or column name not present in the catalog.
    #[error("not found: {0}")]
    NotFound(String),

    /// A cursor's row-state could not be reconciled with the page
    /// contents after one retry.
    #[error("concurrent modification detected: {0}")]
    ConcurrentModification(String),

    /// Calculated-column creation, certain complex types, or writes
    /// against a read-only format.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("page overflow: {0}")]
    PageOverflow(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::BinRw(e.to_string())
    }
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::FormatViolation(msg.into())
    }

    pub(crate) fn invalid_value(msg: impl Into<String>) -> Self {
        Error::InvalidValue(msg.into())
    }
}

/// Policy for how per-page/per-row decode failures are surfaced.
///
/// The default rethrows (the caller's `?` propagates the error as
/// usual); a caller may install a handler that logs and substitutes a
/// placeholder instead, per the "configurable `ErrorHandler`, default
/// rethrow" propagation policy.
pub trait ErrorHandler: std::fmt::Debug {
    /// Called when decoding a single row or column value fails. Return
    /// `Err(())` to abort the read (the default), or `Ok(())` to have
    /// the caller skip/substitute and continue.
    fn handle_row_error(&self, err: &Error) -> std::result::Result<(), ()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RethrowErrorHandler;

impl ErrorHandler for RethrowErrorHandler {
    fn handle_row_error(&self, _err: &Error) -> std::result::Result<(), ()> {
        Err(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rethrow_handler_always_aborts() {
        let handler = RethrowErrorHandler;
        let err = Error::NotFound("Widgets".into());
        assert!(handler.handle_row_error(&err).is_err());
    }

    #[test]
    fn binrw_error_converts() {
        let e = binrw::Error::AssertFail {
            pos: 0,
            message: "bad".into(),
        };
        let converted: Error = e.into();
        assert!(matches!(converted, Error::BinRw(_)));
    }
}
