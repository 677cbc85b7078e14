// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Heuristic return-address recovery without frame pointers or DWARF (C5).
//!
//! Locates a function's RETN by forward-scanning, classifies its epilogue
//! as framed, omitted-frame, or leaf, and reverses the RSP arithmetic
//! between the start address and RETN to recover the caller's return slot.

use crate::arena::Arena;
use crate::decoder::{DecoderFacade, InstructionRecord};
use crate::ea_evaluator::{self, RexBits};
use crate::memory_map::MemoryMap;
use crate::registers::{Reg, RegisterFile};

const SCAN_BATCH_SIZE: usize = 200;
const MAX_SCAN_BATCHES: usize = 100;
const ROLLING_WINDOW: usize = 10;

const RETURN_MNEMONICS: [&str; 4] = ["RETN", "RET", "RETF", "IRET"];

/// ASCII-case-insensitive alias match against the recognized return-opcode
/// mnemonics (§9: `zydis` emits `"ret"`, the historical name is `"RETN"`).
pub fn is_return_mnemonic(mnemonic: &str) -> bool {
    RETURN_MNEMONICS
        .iter()
        .any(|candidate| mnemonic.eq_ignore_ascii_case(candidate))
}

/// The caller's return address, plus the register state the caller's own
/// frame will have once control returns to it. `rbp_after_return` is `None`
/// when the callee's epilogue never touches RBP (omitted-frame or leaf),
/// meaning the caller's RBP is whatever it already was at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub return_address: u64,
    pub rsp_after_return: u64,
    pub rbp_after_return: Option<u64>,
}

/// Recovers the caller's return address (and post-return RSP/RBP) for the
/// function containing `start`, or `None` ("unknown") if the RETN search or
/// recovery fails.
pub fn resolve(
    decoder: &dyn DecoderFacade,
    arena: &Arena,
    start: u64,
    registers: &RegisterFile,
    memory_map: &MemoryMap,
) -> Option<Resolution> {
    let (retn_address, push_pop_offset, tail) = locate_retn(decoder, arena, start, memory_map)?;
    let tight = tight_redecode(decoder, arena, &tail, retn_address, memory_map)?;
    if tight.len() < 2 {
        return recover_leaf(registers, push_pop_offset, memory_map);
    }
    let second_to_last = &tight[tight.len() - 2];

    if is_leave_or_pop_rbp(second_to_last) {
        return recover_framed(registers, memory_map);
    }

    match find_rsp_instruction(decoder, &tight[..tight.len() - 1]) {
        Some((instruction, mnemonic_upper)) => recover_omitted_frame(
            &instruction,
            &mnemonic_upper,
            push_pop_offset,
            registers,
            memory_map,
        ),
        None => recover_leaf(registers, push_pop_offset, memory_map),
    }
}

/// Phase A: forward-scan for the first RETN-family instruction, tracking a
/// running push/pop-induced RSP delta and a rolling window of the last
/// instruction start offsets (relative to `start`) leading up to it.
fn locate_retn(
    decoder: &dyn DecoderFacade,
    arena: &Arena,
    start: u64,
    memory_map: &MemoryMap,
) -> Option<(u64, i64, Vec<u64>)> {
    let mut push_pop_offset: i64 = 0;
    let mut rolling: Vec<u64> = Vec::with_capacity(ROLLING_WINDOW);
    let mut cursor = start;

    for _ in 0..MAX_SCAN_BATCHES {
        if !memory_map.contains_range(cursor as usize, SCAN_BATCH_SIZE) {
            return None;
        }
        let batch = unsafe {
            std::slice::from_raw_parts(cursor as *const u8, SCAN_BATCH_SIZE)
        };
        let records = decoder.decode(batch, arena);
        if records.is_empty() {
            return None;
        }
        for record in &records {
            let address = cursor + record.address;
            if record.mnemonic_is("PUSH") {
                push_pop_offset -= 8;
            } else if record.mnemonic_is("POP") {
                push_pop_offset += 8;
            }
            if is_return_mnemonic(record.mnemonic) {
                return Some((address, push_pop_offset, rolling));
            }
            rolling.push(address);
            if rolling.len() > ROLLING_WINDOW {
                rolling.remove(0);
            }
        }
        let consumed: usize = records.iter().map(|r| r.length as usize).sum();
        if consumed == 0 {
            return None;
        }
        cursor += consumed as u64;
        arena.reset();
    }
    None
}

/// Phase B setup: re-decode from the earliest rolling-window address
/// through (and including) the RETN instruction, to get a tightly aligned
/// instruction list with no desync from the batch boundaries used above.
fn tight_redecode<'a>(
    decoder: &dyn DecoderFacade,
    arena: &'a Arena,
    rolling: &[u64],
    retn_address: u64,
    memory_map: &MemoryMap,
) -> Option<Vec<InstructionRecord<'a>>> {
    let window_start = rolling.first().copied().unwrap_or(retn_address);
    let len = (retn_address - window_start) as usize + 16; // +16: headroom past RETN's own length
    if !memory_map.contains_range(window_start as usize, len) {
        return None;
    }
    let bytes = unsafe { std::slice::from_raw_parts(window_start as *const u8, len) };
    let records = decoder.decode(bytes, arena);
    let mut tight = Vec::new();
    for mut record in records {
        let address = window_start + record.address;
        let is_retn = is_return_mnemonic(record.mnemonic);
        // Rebase to an absolute address: downstream RIP-relative EA
        // evaluation (recover_omitted_frame's LEA/ADD handling) needs
        // `record.address` to be the real instruction pointer, not an
        // offset into this decode buffer.
        record.address = address;
        tight.push(record);
        if address == retn_address || is_retn {
            break;
        }
    }
    if tight.is_empty() || !is_return_mnemonic(tight.last()?.mnemonic) {
        return None;
    }
    Some(tight)
}

fn is_leave_or_pop_rbp(record: &InstructionRecord<'_>) -> bool {
    (record.mnemonic_is("LEAVE") && record.length == 1)
        || (record.mnemonic_is("POP") && record.length == 1 && record.bytes == [0x5D])
}

/// Scans backward from the instruction before RETN for the first whose
/// first operand text is (ASCII case-insensitively) `"rsp"`.
fn find_rsp_instruction<'a>(
    decoder: &dyn DecoderFacade,
    candidates: &[InstructionRecord<'a>],
) -> Option<(InstructionRecord<'a>, String)> {
    let texts = decoder.disassemble(candidates);
    for (record, text) in candidates.iter().zip(texts.iter()).rev() {
        if let Some(first) = text.first_operand() {
            if first.eq_ignore_ascii_case("rsp") {
                return Some((record.clone(), record.mnemonic.to_ascii_uppercase()));
            }
        }
    }
    None
}

/// Framed epilogue: `LEAVE`/`POP RBP` restores RBP from `[RBP]` and sets
/// RSP to `RBP + 8` before RETN pops the return address, so the caller
/// resumes with RBP = `*RBP` and RSP = `RBP + 16`.
fn recover_framed(registers: &RegisterFile, memory_map: &MemoryMap) -> Option<Resolution> {
    let rbp = registers.rbp();
    let return_address = read_validated_qword(rbp.wrapping_add(8), memory_map)?;
    let rbp_after_return = read_validated_qword(rbp, memory_map)?;
    Some(Resolution {
        return_address,
        rsp_after_return: rbp.wrapping_add(16),
        rbp_after_return: Some(rbp_after_return),
    })
}

/// Leaf epilogue: RSP never moved relative to entry (beyond push/pop
/// tracking), so the return slot is `RSP + push_pop_offset`; the caller
/// resumes with RSP just past that slot. RBP is never touched by a leaf
/// function, so it carries forward unchanged.
fn recover_leaf(
    registers: &RegisterFile,
    push_pop_offset: i64,
    memory_map: &MemoryMap,
) -> Option<Resolution> {
    let slot = registers.rsp().wrapping_add(push_pop_offset as u64);
    let return_address = read_validated_qword(slot, memory_map)?;
    Some(Resolution {
        return_address,
        rsp_after_return: slot.wrapping_add(8),
        rbp_after_return: None,
    })
}

/// Omitted-frame epilogue: RSP is restored directly by LEA or ADD; RBP is
/// never touched (that's what makes it omitted-frame), so it carries
/// forward unchanged, same as the leaf case.
fn recover_omitted_frame(
    instruction: &InstructionRecord<'_>,
    mnemonic_upper: &str,
    push_pop_offset: i64,
    registers: &RegisterFile,
    memory_map: &MemoryMap,
) -> Option<Resolution> {
    let rex = RexBits::from_record(instruction);
    let slot = if mnemonic_upper == "LEA" {
        let rip_after = instruction.address + instruction.length as u64;
        let ea = ea_evaluator::evaluate(instruction, rip_after, registers, rex, memory_map)?;
        ea.address
    } else if mnemonic_upper == "ADD" {
        let delta = if instruction.modrm.present && instruction.modrm.mod_ != 0b11 {
            let rip_after = instruction.address + instruction.length as u64;
            ea_evaluator::evaluate(instruction, rip_after, registers, rex, memory_map)?
                .dereferenced_value? as i64
        } else if instruction.imm[0].size > 0 {
            instruction.imm_value(0)
        } else {
            // General-register operand (addressing mode G): the register
            // selected by ModR/M.reg (REX.R-widened) holds the delta.
            let reg_index = instruction.modrm.reg | ((rex.r as u8) << 3);
            let reg = crate::registers::encoded_index_to_reg(reg_index);
            registers.get(reg) as i64
        };
        (registers.rsp() as i64 + delta + push_pop_offset) as u64
    } else {
        return None;
    };
    let return_address = read_validated_qword(slot, memory_map)?;
    Some(Resolution {
        return_address,
        rsp_after_return: slot.wrapping_add(8),
        rbp_after_return: None,
    })
}

fn read_validated_qword(address: u64, memory_map: &MemoryMap) -> Option<u64> {
    if !memory_map.contains_range(address as usize, 8) {
        return None;
    }
    let value = unsafe { std::ptr::read_unaligned(address as *const u64) };
    if !memory_map.contains(value as usize) {
        return None;
    }
    Some(value)
}
