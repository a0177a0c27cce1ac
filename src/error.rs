use thiserror::Error;

/// Tri-state outcome shared by every operation in the decoder that can
/// partially succeed (spec §6 "Status codes", §7 error taxonomy).
///
/// `Warning` is not a failure: truncated fields, missing protofield
/// references inside conditional contexts, and `set`/`choice` rollback all
/// resolve to `Warning` while still carrying whatever was already
/// committed to the `DetailTree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Warning,
    Failure,
}

impl Status {
    /// Merge a child result into a parent's running status: `Failure`
    /// dominates, then `Warning`, then `Success` (§4.2.5: "nested
    /// containers upgrade their own result to warning").
    #[must_use]
    pub fn upgrade(self, other: Status) -> Status {
        use Status::*;
        match (self, other) {
            (Failure, _) | (_, Failure) => Failure,
            (Warning, _) | (_, Warning) => Warning,
            _ => Success,
        }
    }

    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failure)
    }
}

/// Outcome of a span of field decoding: how much of the buffer it
/// consumed (including start/end discards) and whether it fully
/// succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub status: Status,
    pub consumed: usize,
}

impl DecodeOutcome {
    #[must_use]
    pub fn ok(consumed: usize) -> Self {
        Self { status: Status::Success, consumed }
    }

    #[must_use]
    pub fn warning(consumed: usize) -> Self {
        Self { status: Status::Warning, consumed }
    }

    #[must_use]
    pub fn failure() -> Self {
        Self { status: Status::Failure, consumed: 0 }
    }
}

/// Errors raised by the runtime variable store (§4.4).
#[derive(Debug, Clone, Error)]
pub enum VariableError {
    #[error("variable store is full (capacity {0})")]
    StoreFull(usize),
    #[error("no such variable `{0}`")]
    NotFound(String),
    #[error("variable `{0}` is not a buffer variable")]
    NotABuffer(String),
    #[error("variable `{0}` is not a numeric variable")]
    NotANumber(String),
    #[error("write of {len} bytes into buffer variable `{name}` (capacity {cap}) overflows")]
    BufferOverflow { name: String, len: usize, cap: usize },
    #[error("read past end of packet buffer")]
    PacketBufferTruncated,
}

/// Errors raised by the lookup-table store (§4.4).
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("no such lookup table `{0}`")]
    NotFound(String),
    #[error("key arity mismatch for table `{table}`: expected {expected}, got {got}")]
    KeyArity { table: String, expected: usize, got: usize },
    #[error("no entry matched in table `{0}`")]
    Miss(String),
}

/// Errors raised by the expression evaluator (§4.3, §7
/// `expression-type-mismatch` / `missing-field-reference`).
#[derive(Debug, Clone, Error)]
pub enum ExprError {
    #[error("expression expects a {expected} result but found a {found} subtree")]
    TypeMismatch { expected: &'static str, found: &'static str },
    #[error("unconditional reference to `{0}` could not be resolved")]
    UnresolvedReference(String),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("regex handle was not compiled for this operand")]
    MissingRegex,
}

/// Errors raised while walking the protocol DB's element graph
/// (§7 `db-inconsistency`).
#[derive(Debug, Clone, Error)]
pub enum DbError {
    #[error("unknown element tag encountered at element #{0}")]
    UnknownTag(u32),
    #[error("switch at element #{0} has no matching case and no default")]
    NoMatchingCase(u32),
    #[error("dangling element reference #{0}")]
    DanglingReference(u32),
    #[error("protocol index {0} is out of range")]
    UnknownProtocol(usize),
}

/// Errors raised by the field decoder and protocol dispatcher
/// (§4.2, §4.1, §7).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("plugin reported an error: {0}")]
    Plugin(String),
    #[error("field arena exhausted (resource-exhaustion)")]
    ArenaExhausted,
    #[error("offset bookkeeping invariant violated: {0}")]
    OffsetInvariant(&'static str),
}

/// Top-level crate error, composing every subsystem error (§7).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Db(#[from] DbError),
}
