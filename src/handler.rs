// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal registration (C11) and the handler entry point (C9).
//!
//! Mirrors the Core's `signal_handler_manager.rs`/`crash_handler.rs` split:
//! registration installs `nix::sys::signal::sigaction` for each monitored
//! signal and records the previous disposition for chaining; the handler
//! itself is a plain `extern "C"` function gated by a one-shot counter.

use crate::config;
use crate::decoder::{DecoderFacade, ZydisDecoderFacade};
use crate::errors::HandlerError;
use crate::memory_map::MemoryMap;
use crate::registers::RegisterFile;
use crate::report;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

const MONITORED_SIGNALS: [Signal; 6] = [
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGTRAP,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGBUS,
];

const MAX_SIGNALS: usize = 32;

static mut PREVIOUS_HANDLERS: [Option<(Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];

/// Single-fire discipline (§4.9, §5): if a second fault arrives before
/// `exit` completes the first report, the handler chains to the previous
/// disposition instead of writing a second time.
static NUM_TIMES_CALLED: AtomicU64 = AtomicU64::new(0);

/// Installs the handler for every monitored signal via `sigaction`.
/// Records each signal's previous disposition so the one-shot guard can
/// chain to it on a subsequent delivery.
pub(crate) fn register_all() -> anyhow::Result<()> {
    for signal in MONITORED_SIGNALS {
        register_one(signal)?;
    }
    Ok(())
}

/// Restores every monitored signal's previous disposition.
pub(crate) fn unregister_all() {
    for signal in MONITORED_SIGNALS {
        // Safety: only this module ever writes `PREVIOUS_HANDLERS`, and
        // `Uninitialize` runs on the normal call stack, never concurrently
        // with the signal handler itself (the one-shot guard ensures the
        // handler body never runs again once a report has been written).
        let previous = unsafe { PREVIOUS_HANDLERS[signal as usize].take() };
        if let Some((_, action)) = previous {
            unsafe {
                let _ = nix::sys::signal::sigaction(signal, &action);
            }
        }
    }
}

fn register_one(signal: Signal) -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(handle_signal),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    // Safety: `handle_signal` only touches process-wide atomics and a file
    // it opens itself; it performs no reentrant signal-mask manipulation.
    let previous = unsafe { nix::sys::signal::sigaction(signal, &action)? };
    // Safety: see `unregister_all`.
    unsafe {
        PREVIOUS_HANDLERS[signal as usize] = Some((signal, previous));
    }
    Ok(())
}

extern "C" fn handle_signal(
    signum: i32,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    if NUM_TIMES_CALLED.fetch_add(1, SeqCst) > 0 {
        chain_to_previous(signum, info, context);
        return;
    }
    handle_signal_impl(signum, info, context);
    chain_to_previous(signum, info, context);
    std::process::exit(1);
}

fn handle_signal_impl(signum: i32, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    if let Err(err) = try_handle_signal(signum, info, context) {
        // No error propagates across the handler boundary (§7): this is the
        // last chance to note the failure before falling through to the
        // chained disposition and process exit.
        let _ = writeln!(std::io::stderr(), " [ DeadStop ] {err}");
    }
}

fn try_handle_signal(
    signum: i32,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) -> Result<(), HandlerError> {
    let cfg = config::current().ok_or(HandlerError::NotInitialized)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(cfg.dump_path())
        .map_err(HandlerError::ReportFileOpenFailed)?;

    let maps_text =
        std::fs::read_to_string("/proc/self/maps").map_err(HandlerError::MapsReadFailed)?;
    let memory_map = MemoryMap::parse(&maps_text);

    let registers = unsafe {
        let ucontext = context as *const libc::ucontext_t;
        RegisterFile::from_ucontext(ucontext)
    };

    let signal_name = signal_name(signum);
    let signal_description = signal_description(signum, info);

    let decoder = ZydisDecoderFacade::new().map_err(|_| HandlerError::DecoderInitFailed)?;

    // Report-generation failures (partial disassembly, unreadable frames)
    // are absorbed inside `write_report` itself; a hard I/O failure here
    // means the file became unwritable mid-report, which we also swallow
    // per §7 rather than retry.
    let _ = report::write_report(
        &mut file,
        &decoder,
        cfg,
        &signal_name,
        &signal_description,
        &maps_text,
        &registers,
        &memory_map,
    );
    Ok(())
}

fn chain_to_previous(signum: i32, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let Ok(signal) = Signal::try_from(signum) else {
        return;
    };
    // Safety: only this module writes `PREVIOUS_HANDLERS`, from the normal
    // call stack before any handler can fire for that signal.
    let previous = unsafe { PREVIOUS_HANDLERS[signal as usize] };
    let Some((_, action)) = previous else {
        return;
    };
    match action.handler() {
        SigHandler::SigDfl => unsafe {
            let _ = nix::sys::signal::sigaction(
                signal,
                &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()),
            );
            let _ = libc::raise(signum);
        },
        SigHandler::SigIgn => {}
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, info, context),
    }
}

fn signal_name(signum: i32) -> String {
    match Signal::try_from(signum) {
        Ok(signal) => format!("{signal:?}").to_uppercase(),
        Err(_) => format!("SIG{signum}"),
    }
}

fn signal_description(signum: i32, info: *const libc::siginfo_t) -> String {
    let base = match signum {
        libc::SIGSEGV => "segmentation fault: invalid memory reference",
        libc::SIGILL => "illegal instruction",
        libc::SIGTRAP => "trace/breakpoint trap",
        libc::SIGABRT => "aborted",
        libc::SIGFPE => "arithmetic exception",
        libc::SIGBUS => "bus error: misaligned or nonexistent physical address",
        _ => "unknown fatal signal",
    };
    let addr = unsafe { (*info).si_addr() } as usize;
    format!("{base} (faulting address {addr:#018x})")
}
