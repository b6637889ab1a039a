//! Error types for the wire codec.

use thiserror::Error;

/// Errors raised while encoding or decoding protocol frames.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame overrun: needed {needed} bytes, {remaining} left in frame")]
    Overrun { needed: usize, remaining: usize },

    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Crc { stored: u32, computed: u32 },
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;
