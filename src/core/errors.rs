// src/core/errors.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;

/// The main error enum, representing all possible failures within a node.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum PrismError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wire encode error: {0}")]
    WireEncode(#[from] bincode::error::EncodeError),

    #[error("Wire decode error: {0}")]
    WireDecode(#[from] bincode::error::DecodeError),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Unknown video ID: {0}")]
    UnknownVideo(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Media tool failed: {0}")]
    MediaTool(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
