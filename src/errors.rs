// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the crate's two boundaries: the public `Initialize`/
//! `Uninitialize` surface, and the internal signal-handler path (which never
//! lets an error escape past the handler itself).

use thiserror::Error;

/// Errors that can prevent `Initialize` from succeeding.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("dump path must not be empty")]
    InvalidDumpPath,
    #[error("asm_dump_radius must be in (0, 0x1000), got {0:#x}")]
    InvalidAsmDumpRadius(usize),
    #[error("call_stack_depth must be > 0")]
    InvalidCallStackDepth,
    #[error("DeadStop is already initialized")]
    AlreadyInitialized,
    #[error("failed to register signal handlers: {0}")]
    SignalRegistrationFailed(#[from] anyhow::Error),
}

/// The narrow, C-ABI-flavored result code returned across the public surface
/// (see `GetErrorMessage`). `InitError` is the rich internal error; this is
/// what a caller outside this crate actually sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum ErrCode {
    Success,
    FailedInit,
    FailedToStartSubModules,
}

impl From<&InitError> for ErrCode {
    fn from(e: &InitError) -> Self {
        match e {
            InitError::InvalidDumpPath
            | InitError::InvalidAsmDumpRadius(_)
            | InitError::InvalidCallStackDepth
            | InitError::AlreadyInitialized => ErrCode::FailedInit,
            InitError::SignalRegistrationFailed(_) => ErrCode::FailedToStartSubModules,
        }
    }
}

/// Returns the human-readable string for a public error code.
pub fn get_error_message(code: ErrCode) -> &'static str {
    match code {
        ErrCode::Success => "success",
        ErrCode::FailedInit => "failed to initialize DeadStop: invalid configuration",
        ErrCode::FailedToStartSubModules => {
            "failed to initialize DeadStop: could not start a required submodule"
        }
    }
}

/// Errors internal to the handler path. These are never surfaced to a caller;
/// they only ever cause the handler to give up early and return silently
/// (see §7 of the design: no error propagates across the handler boundary).
#[derive(Debug, Error)]
pub(crate) enum HandlerError {
    #[error("DeadStop has not been initialized")]
    NotInitialized,
    #[error("failed to open report file: {0}")]
    ReportFileOpenFailed(std::io::Error),
    #[error("failed to read /proc/self/maps: {0}")]
    MapsReadFailed(std::io::Error),
    #[error("decoder initialization failed")]
    DecoderInitFailed,
}
