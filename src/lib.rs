// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process post-mortem crash reporter for native x86-64 Linux programs.
//!
//! When a fatal signal (`SIGSEGV`, `SIGILL`, `SIGTRAP`, `SIGABRT`,
//! `SIGFPE`, `SIGBUS`) is delivered, the installed handler writes a
//! structured forensic report — signal identity, register state, memory
//! map, a heuristically unwound call stack, and per-frame disassembly —
//! to a file, then terminates the process.
//!
//! # Async-signal safety
//!
//! This crate deliberately performs non-async-signal-safe work inside the
//! signal handler: buffered file I/O, string formatting, and heap
//! allocation. POSIX does not guarantee these are safe to call from a
//! signal handler, but the alternative — a minimal async-signal-safe
//! handler producing a terse report — trades away the diagnostic value a
//! post-mortem tool exists to provide. This crate accepts that risk for
//! the narrow post-mortem window between fault and process exit; it is not
//! appropriate for a handler that must itself resume normal execution.
//!
//! The engine does not perform symbolization, DWARF/`.eh_frame` unwinding,
//! cross-platform dispatch, or thread-aware unwinding of non-faulting
//! threads — see the module-level documentation of each component for its
//! specific scope.

mod arena;
mod call_stack;
mod config;
mod decoder;
mod disasm_window;
mod ea_evaluator;
mod errors;
mod handler;
mod memory_map;
mod registers;
mod report;
mod return_addr;
mod signature;

pub use errors::{get_error_message, ErrCode};

use config::Config;
use errors::InitError;

/// Installs the crash reporter.
///
/// `dump_path` is the file reports are appended to. `asm_dump_radius`
/// bounds how many bytes of context are disassembled around each frame
/// (must be in `(0, 0x1000)`). `string_dump_size` bounds how many bytes of
/// a pointed-to string are captured per annotated operand.
/// `call_stack_depth` bounds how many caller frames are recovered beyond
/// the crash site (must be `> 0`).
///
/// Returns `ErrCode::Success` on success. Calling this twice without an
/// intervening `uninitialize` returns `ErrCode::FailedInit`.
pub fn initialize(
    dump_path: impl Into<std::path::PathBuf>,
    asm_dump_radius: usize,
    string_dump_size: usize,
    call_stack_depth: usize,
) -> ErrCode {
    match try_initialize(dump_path, asm_dump_radius, string_dump_size, call_stack_depth) {
        Ok(()) => ErrCode::Success,
        Err(err) => {
            tracing::error!(error = %err, "DeadStop failed to initialize");
            ErrCode::from(&err)
        }
    }
}

fn try_initialize(
    dump_path: impl Into<std::path::PathBuf>,
    asm_dump_radius: usize,
    string_dump_size: usize,
    call_stack_depth: usize,
) -> Result<(), InitError> {
    if config::is_initialized() {
        return Err(InitError::AlreadyInitialized);
    }
    let cfg = Config::new(dump_path, asm_dump_radius, string_dump_size, call_stack_depth)?;
    handler::register_all().map_err(InitError::SignalRegistrationFailed)?;
    config::install(cfg);
    tracing::info!("DeadStop initialized");
    Ok(())
}

/// Tears down the crash reporter: restores each monitored signal's
/// previous disposition and drops the process-wide configuration.
pub fn uninitialize() -> ErrCode {
    handler::unregister_all();
    config::uninstall();
    tracing::info!("DeadStop uninitialized");
    ErrCode::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_configuration() {
        let code = initialize("", 50, 5, 3);
        assert_eq!(code, ErrCode::FailedInit);
    }

    #[test]
    fn get_error_message_is_stable_for_every_code() {
        for code in [
            ErrCode::Success,
            ErrCode::FailedInit,
            ErrCode::FailedToStartSubModules,
        ] {
            assert!(!get_error_message(code).is_empty());
        }
    }
}
