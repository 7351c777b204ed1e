// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid stream name '{0}'")]
    InvalidStreamName(String),

    #[error("RTSP URL must not be empty")]
    InvalidUrl,

    #[error("Capacity exceeded: {active} of {max} streams registered")]
    CapacityExceeded { active: usize, max: usize },

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
