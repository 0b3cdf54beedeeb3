// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::path::PathBuf;

/// Errors raised while bringing up or operating the X11 backend.
///
/// Everything that can fail between connecting to the host server and
/// creating the first output is fatal; each step depends on state established
/// by the previous one, so there is no retry or degraded mode. The only
/// runtime failure that is tolerated is a lost reply for an issued copy
/// request, which is logged and treated as a no-op by the caller.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("host display unreachable: {0}")]
    Connection(#[from] x11rb::errors::ConnectError),

    #[error("host connection error: {0}")]
    Host(#[from] x11rb::errors::ConnectionError),

    #[error("host request failed: {0}")]
    Reply(#[from] x11rb::errors::ReplyError),

    #[error("host id allocation failed: {0}")]
    IdAllocation(#[from] x11rb::errors::ReplyOrIdError),

    #[error("{extension} extension unusable: {reason}")]
    Capability {
        extension: &'static str,
        reason: String,
    },

    #[error("DRI2 negotiation failed: {0}")]
    Negotiation(String),

    #[error("failed to open {path:?}: {source}")]
    DeviceOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("DRI2 authentication failed: {0}")]
    Authentication(String),

    #[error("buffer negotiation failed: {0}")]
    BufferNegotiation(String),

    #[error("render context setup failed: {0}")]
    Context(String),

    #[error("buffer import failed: {0}")]
    Import(String),

    #[error("output creation failed: {0}")]
    OutputCreation(#[source] Box<BackendError>),
}
