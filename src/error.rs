// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Crate-wide error types.

use std::io;

/// Framing failures reported by [`crate::frame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The header's magic word did not match [`crate::frame::CHECKSUM`].
    #[error("bad checksum 0x{0:08x}")]
    Checksum(u32),
    /// `type` is out of range for the header's flag.
    #[error("unknown type {ty} for flag {flag}")]
    UnknownType { ty: u16, flag: u8 },
    /// Not enough bytes yet. Not a failure: read more and retry.
    #[error("incomplete frame: need {need} bytes, have {have}")]
    Incomplete { need: usize, have: usize },
    /// The frame can never fit the buffer it is being reassembled in.
    #[error("frame of {len} bytes exceeds buffer capacity {cap}")]
    TooLarge { len: usize, cap: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("message type {0} out of range")]
    TypeOutOfRange(u16),

    #[error("message type {0} already registered")]
    RepeatRegister(u16),

    #[error("pointer does not belong to this pool")]
    ForeignPointer,

    #[error("block released twice")]
    DoubleFree,

    #[error("offset {off}+{len} outside segment of {total} bytes")]
    OffsetOutOfBounds { off: usize, len: usize, total: usize },

    #[error("{0} is not a power of two")]
    NotPowerOfTwo(usize),

    #[error("queue full")]
    QueueFull,

    #[error("config key `{key}`: {reason}")]
    Config { key: String, reason: String },

    #[error("command: {0}")]
    Cmd(String),

    #[error("link auth rejected")]
    AuthRejected,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn config(key: &str, reason: impl Into<String>) -> Self {
        Error::Config { key: key.to_owned(), reason: reason.into() }
    }
}
