// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Register state and the small tuples threaded between components.

use crate::memory_map::MemoryMap;

/// General-purpose register slots, in the order glibc's `ucontext_t`'s
/// `gregs` array lays them out (`REG_R8` .. `REG_CR2`). Kept as an enum
/// indexing a fixed array rather than named struct fields so the order is
/// self-documenting at every call site that walks `REG_*..=REG_CR2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Reg {
    R8 = 0,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rdi,
    Rsi,
    Rbp,
    Rbx,
    Rdx,
    Rax,
    Rcx,
    Rsp,
    Rip,
    Efl,
    CsGsFs,
    Err,
    Trapno,
    OldMask,
    Cr2,
}

pub const REGISTER_COUNT: usize = 23;

pub const REGISTER_NAMES: [&str; REGISTER_COUNT] = [
    "R8", "R9", "R10", "R11", "R12", "R13", "R14", "R15", "RDI", "RSI", "RBP", "RBX", "RDX",
    "RAX", "RCX", "RSP", "RIP", "EFL", "CSGSFS", "ERR", "TRAPNO", "OLDMASK", "CR2",
];

/// Maps an AMD64 general-purpose register index (0=RAX .. 15=R15, the
/// ModR/M/SIB encoding order) to its slot in `RegisterFile`.
///
/// REX.B/X/R extension is folded in by the caller before this function runs:
/// the caller widens the 3-bit field to 4 bits by prepending the REX bit,
/// then calls this with the full 0..16 index (see `ea_evaluator.rs`, §9).
pub fn encoded_index_to_reg(index: u8) -> Reg {
    match index & 0x0F {
        0 => Reg::Rax,
        1 => Reg::Rcx,
        2 => Reg::Rdx,
        3 => Reg::Rbx,
        4 => Reg::Rsp,
        5 => Reg::Rbp,
        6 => Reg::Rsi,
        7 => Reg::Rdi,
        8 => Reg::R8,
        9 => Reg::R9,
        10 => Reg::R10,
        11 => Reg::R11,
        12 => Reg::R12,
        13 => Reg::R13,
        14 => Reg::R14,
        15 => Reg::R15,
        _ => unreachable!("index & 0x0F is in 0..16"),
    }
}

/// A read-only snapshot of general-purpose registers at fault time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    values: [u64; REGISTER_COUNT],
}

impl RegisterFile {
    pub fn from_values(values: [u64; REGISTER_COUNT]) -> Self {
        Self { values }
    }

    pub fn get(&self, reg: Reg) -> u64 {
        self.values[reg as usize]
    }

    pub fn rip(&self) -> u64 {
        self.get(Reg::Rip)
    }

    pub fn rsp(&self) -> u64 {
        self.get(Reg::Rsp)
    }

    pub fn rbp(&self) -> u64 {
        self.get(Reg::Rbp)
    }

    /// Raw slot values in `REGISTER_NAMES` order, for code that walks every
    /// register rather than naming one (e.g. the report's register dump).
    pub fn raw(&self) -> &[u64; REGISTER_COUNT] {
        &self.values
    }

    /// Extracts the register file from a `ucontext_t`'s machine context. Only
    /// defined for x86_64 Linux, matching this crate's platform scope.
    ///
    /// # Safety
    /// `ctx` must point to a valid, initialized `libc::ucontext_t` as
    /// delivered to a `SA_SIGINFO` handler.
    #[cfg(target_os = "linux")]
    pub unsafe fn from_ucontext(ctx: *const libc::ucontext_t) -> Self {
        let gregs = (*ctx).uc_mcontext.gregs;
        let mut values = [0u64; REGISTER_COUNT];
        values[Reg::R8 as usize] = gregs[libc::REG_R8 as usize] as u64;
        values[Reg::R9 as usize] = gregs[libc::REG_R9 as usize] as u64;
        values[Reg::R10 as usize] = gregs[libc::REG_R10 as usize] as u64;
        values[Reg::R11 as usize] = gregs[libc::REG_R11 as usize] as u64;
        values[Reg::R12 as usize] = gregs[libc::REG_R12 as usize] as u64;
        values[Reg::R13 as usize] = gregs[libc::REG_R13 as usize] as u64;
        values[Reg::R14 as usize] = gregs[libc::REG_R14 as usize] as u64;
        values[Reg::R15 as usize] = gregs[libc::REG_R15 as usize] as u64;
        values[Reg::Rdi as usize] = gregs[libc::REG_RDI as usize] as u64;
        values[Reg::Rsi as usize] = gregs[libc::REG_RSI as usize] as u64;
        values[Reg::Rbp as usize] = gregs[libc::REG_RBP as usize] as u64;
        values[Reg::Rbx as usize] = gregs[libc::REG_RBX as usize] as u64;
        values[Reg::Rdx as usize] = gregs[libc::REG_RDX as usize] as u64;
        values[Reg::Rax as usize] = gregs[libc::REG_RAX as usize] as u64;
        values[Reg::Rcx as usize] = gregs[libc::REG_RCX as usize] as u64;
        values[Reg::Rsp as usize] = gregs[libc::REG_RSP as usize] as u64;
        values[Reg::Rip as usize] = gregs[libc::REG_RIP as usize] as u64;
        values[Reg::Efl as usize] = gregs[libc::REG_EFL as usize] as u64;
        values[Reg::CsGsFs as usize] = gregs[libc::REG_CSGSFS as usize] as u64;
        values[Reg::Err as usize] = gregs[libc::REG_ERR as usize] as u64;
        values[Reg::Trapno as usize] = gregs[libc::REG_TRAPNO as usize] as u64;
        values[Reg::OldMask as usize] = gregs[libc::REG_OLDMASK as usize] as u64;
        values[Reg::Cr2 as usize] = gregs[libc::REG_CR2 as usize] as u64;
        Self { values }
    }

    /// Returns the register values with a register applied, used by the
    /// resolver to seed an `EAEvaluator` call with a synthetic RSP/RIP
    /// without mutating the original fault-time snapshot.
    pub fn with(&self, reg: Reg, value: u64) -> Self {
        let mut values = self.values;
        values[reg as usize] = value;
        Self { values }
    }
}

/// `(crash_rip, register_file, memory_map)`, passed from the handler down
/// into the unwinder and disassembler.
pub struct UnwindContext<'a> {
    pub crash_rip: u64,
    pub registers: RegisterFile,
    pub memory_map: &'a MemoryMap,
}

/// Ordered instruction-pointer values recovered by the unwinder. Index 0 is
/// always the crashing address.
#[derive(Debug, Clone, Default)]
pub struct CallStack {
    frames: Vec<u64>,
}

impl CallStack {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push(&mut self, ip: u64) {
        self.frames.push(ip);
    }

    pub fn frames(&self) -> &[u64] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_index_covers_all_16_registers() {
        let expected = [
            Reg::Rax,
            Reg::Rcx,
            Reg::Rdx,
            Reg::Rbx,
            Reg::Rsp,
            Reg::Rbp,
            Reg::Rsi,
            Reg::Rdi,
            Reg::R8,
            Reg::R9,
            Reg::R10,
            Reg::R11,
            Reg::R12,
            Reg::R13,
            Reg::R14,
            Reg::R15,
        ];
        for (i, reg) in expected.iter().enumerate() {
            assert_eq!(encoded_index_to_reg(i as u8), *reg);
        }
    }

    #[test]
    fn register_file_get_and_with() {
        let base = RegisterFile::from_values([0; REGISTER_COUNT]);
        assert_eq!(base.rip(), 0);
        let modified = base.with(Reg::Rip, 0xdead_beef);
        assert_eq!(modified.rip(), 0xdead_beef);
        assert_eq!(base.rip(), 0, "original snapshot must stay untouched");
    }

    #[test]
    fn call_stack_tracks_push_order() {
        let mut stack = CallStack::new();
        assert!(stack.is_empty());
        stack.push(0x1000);
        stack.push(0x2000);
        assert_eq!(stack.frames(), &[0x1000, 0x2000]);
        assert_eq!(stack.len(), 2);
    }
}
