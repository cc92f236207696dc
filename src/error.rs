//! Errors produced while decompiling a single function.
//!
//! Every stage of the pipeline returns [`Result`]. A failure is local to the function being
//! processed: no partially built CFG or AST escapes, and since all caches live in the
//! per-function [`crate::session::Decompilation`], a caller processing many functions can simply
//! move on to the next one.

use thiserror::Error;

/// Build an [`Error::Malformed`] tagged with the current source position.
macro_rules! malformed_error {
    ($msg:expr) => {
        crate::error::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };
    ($fmt:expr, $($arg:tt)*) => {
        crate::error::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// Build an [`Error::Structure`] tagged with the current source position.
macro_rules! structure_error {
    ($msg:expr) => {
        crate::error::Error::Structure {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };
    ($fmt:expr, $($arg:tt)*) => {
        crate::error::Error::Structure {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

#[derive(Error, Debug)]
pub enum Error {
    /// The micro-op listing is not well formed: an unknown mnemonic or address space, a missing
    /// field, an operand count that does not fit the mnemonic, or an address that cannot be
    /// resolved.
    #[error("Malformed listing - {file}:{line}: {message}")]
    Malformed {
        message: String,
        file: &'static str,
        line: u32,
    },

    /// An internal structural invariant was broken (disconnected graph, an edge to a node that
    /// does not exist, a block split at an address it does not hold). These indicate a bug in a
    /// caller rather than bad input.
    #[error("Structural invariant violated - {file}:{line}: {message}")]
    Structure {
        message: String,
        file: &'static str,
        line: u32,
    },

    /// The listing is not syntactically valid JSON. JSON of the wrong shape is [`Error::Malformed`].
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
