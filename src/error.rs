use thiserror::Error;

/// Errors reported while reading, building, or transforming class files.
///
/// The core never catches or recovers: every failure surfaces to the caller
/// of `parse`/`build`/`transform`. Because parsed models decode lazily, a
/// truncated or corrupt region of the buffer may only be discovered when the
/// offending sub-model is first accessed.
#[derive(Debug, Error)]
pub enum Error {
    /// Bytes truncated, bad magic, unknown tag, length mismatch, or an
    /// offset outside the buffer.
    #[error("malformed classfile: {0}")]
    Malformed(String),

    /// Index 0, index past the pool count, an entry of the wrong kind for a
    /// typed accessor, or a full pool.
    #[error("constant pool: {0}")]
    ConstantPool(String),

    /// Dead labels, oversized branches, dead code, or an inconsistent stack
    /// map, under the option policies that report rather than fix.
    #[error("invalid code: {0}")]
    InvalidCode(String),

    /// Opcode/kind mismatch or an out-of-range value in user construction.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// A builder consumed twice, or a label rebound to a different bci.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn truncated(what: &str, offset: usize) -> Error {
        Error::Malformed(format!("unexpected end of buffer reading {what} at offset {offset}"))
    }
}
