// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

use crate::trafficsim::ConnectionState;

#[derive(Error, Debug)]
pub enum PathwatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Target resolution failed: {0}")]
    Resolution(String),

    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Probe handler error: {0}")]
    Handler(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for PathwatchError {
    fn from(e: serde_json::Error) -> Self {
        PathwatchError::Codec(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for PathwatchError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PathwatchError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PathwatchError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PathwatchError::Codec(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PathwatchError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        PathwatchError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PathwatchError>;
