//! Error codes returned by index operations.

/// The closed set of failure codes an index operation can report.
///
/// Success travels as `Ok`; everything else is one of these. None of the
/// codes carry payloads so they stay cheap to pass through the hot paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The operation failed for an unclassified reason, e.g. a snapshot file
    /// could not be read back.
    #[error("operation failed")]
    Fail,
    /// No vector data was provided where some was required.
    #[error("no vector data was provided")]
    EmptyData,
    /// The index has not been built or loaded yet.
    #[error("the index has not been built or loaded")]
    EmptyIndex,
    /// Fewer inputs were provided than the operation needs.
    #[error("too few inputs were provided")]
    LackOfInputs,
    /// A textual or serialized value could not be parsed.
    #[error("a value could not be parsed")]
    FailedParseValue,
    /// A snapshot file could not be created.
    #[error("a file could not be created")]
    FailedCreateFile,
    /// The vectors do not have the dimension the index was built with.
    #[error("vector dimension does not match the index")]
    DimensionSizeMismatch,
    /// Memory for growing the index could not be allocated.
    #[error("could not allocate memory for growth")]
    MemoryOverflow,
    /// The vector id does not refer to a live vector.
    #[error("the vector was not found")]
    VectorNotFound,
}

/// Convenience alias for results carrying an [`Error`] code.
pub type Result<T> = std::result::Result<T, Error>;
