// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide, single-owner configuration (component C10).
//!
//! Mutexes are unusable inside a signal handler, so the singleton is stored
//! behind an `AtomicPtr`, swapped with `Box::into_raw`/`Box::from_raw`, the
//! same pattern used for the `CONFIG`/`METADATA` statics this crate is
//! descended from.

use crate::errors::InitError;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};

/// The largest radius `DisassemblyWindow` will use before the one-shot
/// downgrade to 100 bytes described in §4.4 / B4.
pub const MAX_ASM_DUMP_RADIUS: usize = 0x1000;

/// The instruction-count ceiling `DisassemblyWindow` retries up to while
/// hunting for an offset that lands a decode boundary on the pivot.
pub const DISASSEMBLY_RETRY_ATTEMPTS: usize = 10;

/// Radius `DisassemblyWindow` downgrades to when the full radius is
/// unreadable (B4).
pub const FALLBACK_ASM_DUMP_RADIUS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    dump_path: PathBuf,
    asm_dump_radius: usize,
    string_dump_size: usize,
    call_stack_depth: usize,
    signature_size: usize,
}

impl Config {
    pub fn new(
        dump_path: impl Into<PathBuf>,
        asm_dump_radius: usize,
        string_dump_size: usize,
        call_stack_depth: usize,
    ) -> Result<Self, InitError> {
        let dump_path = dump_path.into();
        if dump_path.as_os_str().is_empty() {
            return Err(InitError::InvalidDumpPath);
        }
        if asm_dump_radius == 0 || asm_dump_radius >= MAX_ASM_DUMP_RADIUS {
            return Err(InitError::InvalidAsmDumpRadius(asm_dump_radius));
        }
        if call_stack_depth == 0 {
            return Err(InitError::InvalidCallStackDepth);
        }
        Ok(Self {
            dump_path,
            asm_dump_radius,
            string_dump_size,
            call_stack_depth,
            // The signature emits at least `signature_size` bytes' worth of
            // tokens; a sane default ties it to string_dump_size's scale
            // rather than introducing a separate tunable.
            signature_size: string_dump_size,
        })
    }

    pub fn dump_path(&self) -> &Path {
        &self.dump_path
    }

    pub fn asm_dump_radius(&self) -> usize {
        self.asm_dump_radius
    }

    pub fn string_dump_size(&self) -> usize {
        self.string_dump_size
    }

    pub fn call_stack_depth(&self) -> usize {
        self.call_stack_depth
    }

    pub fn signature_size(&self) -> usize {
        self.signature_size
    }
}

static CONFIG: AtomicPtr<Config> = AtomicPtr::new(ptr::null_mut());

/// Installs `config` as the process-wide singleton. Returns the previous
/// config, if any, so the caller can decide whether double-initialization
/// should be rejected.
pub(crate) fn install(config: Config) -> Option<Config> {
    let box_ptr = Box::into_raw(Box::new(config));
    let old = CONFIG.swap(box_ptr, SeqCst);
    if old.is_null() {
        None
    } else {
        // Safety: `old` was produced by a prior `Box::into_raw` call in this
        // function; nothing else ever writes to `CONFIG`.
        Some(*unsafe { Box::from_raw(old) })
    }
}

/// Removes the singleton, if one is installed, dropping it.
pub(crate) fn uninstall() {
    let old = CONFIG.swap(ptr::null_mut(), SeqCst);
    if !old.is_null() {
        // Safety: see `install`.
        unsafe { drop(Box::from_raw(old)) };
    }
}

/// Borrows the current config, if initialized. Safe to call from the signal
/// handler: this is a single atomic load, no allocation, no lock.
///
/// # Safety
/// The returned reference is valid as long as `Uninitialize` has not run
/// concurrently. The handler's single-fire guard (§4.9) ensures that in
/// practice this window never closes mid-read.
pub(crate) fn current() -> Option<&'static Config> {
    let ptr = CONFIG.load(SeqCst);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

pub(crate) fn is_initialized() -> bool {
    !CONFIG.load(SeqCst).is_null()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_dump_path() {
        let err = Config::new("", 50, 5, 3).unwrap_err();
        assert!(matches!(err, InitError::InvalidDumpPath));
    }

    #[test]
    fn rejects_zero_radius() {
        let err = Config::new("/tmp/x", 0, 5, 3).unwrap_err();
        assert!(matches!(err, InitError::InvalidAsmDumpRadius(0)));
    }

    #[test]
    fn rejects_radius_too_large() {
        let err = Config::new("/tmp/x", MAX_ASM_DUMP_RADIUS, 5, 3).unwrap_err();
        assert!(matches!(err, InitError::InvalidAsmDumpRadius(_)));
    }

    #[test]
    fn rejects_zero_depth() {
        let err = Config::new("/tmp/x", 50, 5, 0).unwrap_err();
        assert!(matches!(err, InitError::InvalidCallStackDepth));
    }

    #[test]
    fn accepts_sane_defaults() {
        let config = Config::new("/tmp/x", 50, 5, 3).unwrap();
        assert_eq!(config.asm_dump_radius(), 50);
        assert_eq!(config.string_dump_size(), 5);
        assert_eq!(config.call_stack_depth(), 3);
    }

    #[test]
    fn install_reports_previous_value() {
        uninstall();
        let first = Config::new("/tmp/a", 50, 5, 3).unwrap();
        assert!(install(first).is_none());
        let second = Config::new("/tmp/b", 60, 6, 4).unwrap();
        let previous = install(second);
        assert_eq!(previous.unwrap().dump_path(), Path::new("/tmp/a"));
        uninstall();
        assert!(!is_initialized());
    }
}
