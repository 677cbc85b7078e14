// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Alignment-retry linear disassembly around a pivot address (C4).

use crate::arena::Arena;
use crate::config::{DISASSEMBLY_RETRY_ATTEMPTS, FALLBACK_ASM_DUMP_RADIUS};
use crate::decoder::{DecoderFacade, DisassembledInstruction, InstructionRecord};
use crate::ea_evaluator::{self, RexBits};
use crate::memory_map::MemoryMap;
use crate::registers::RegisterFile;

/// One line of an emitted disassembly block: the decoded instruction
/// alongside its formatted text and, if applicable, a readable-string
/// annotation and the "this is the pivot" marker.
pub struct WindowLine<'a> {
    pub address: u64,
    pub record: InstructionRecord<'a>,
    pub text: DisassembledInstruction,
    pub string_annotation: Option<String>,
    pub is_pivot: bool,
}

pub struct DisassemblyWindow<'a> {
    pub lines: Vec<WindowLine<'a>>,
    pub pivot_index: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error("pivot address is not mapped")]
    PivotUnmapped,
    #[error("window bytes are not fully readable")]
    Unreadable,
    #[error("no decode attempt landed on the pivot boundary")]
    NoAlignment,
}

/// Builds a disassembly window of `radius` bytes on either side of `pivot`.
/// Per B4, a radius greater than `FALLBACK_ASM_DUMP_RADIUS` that turns out
/// to straddle unreadable memory is downgraded to the fallback radius
/// exactly once.
pub fn build<'a>(
    decoder: &dyn DecoderFacade,
    arena: &'a Arena,
    pivot: u64,
    radius: usize,
    memory_map: &MemoryMap,
    registers: &RegisterFile,
    string_dump_size: usize,
) -> Result<DisassemblyWindow<'a>, WindowError> {
    if !memory_map.contains(pivot as usize) {
        return Err(WindowError::PivotUnmapped);
    }

    let effective_radius = if is_window_readable(pivot, radius, memory_map) {
        radius
    } else if radius > FALLBACK_ASM_DUMP_RADIUS
        && is_window_readable(pivot, FALLBACK_ASM_DUMP_RADIUS, memory_map)
    {
        FALLBACK_ASM_DUMP_RADIUS
    } else {
        return Err(WindowError::Unreadable);
    };

    let start = pivot - effective_radius as u64;
    let buffer = snapshot(start, effective_radius * 2, memory_map);

    let attempts = DISASSEMBLY_RETRY_ATTEMPTS.min(buffer.len()).min(effective_radius + 1);
    for k in 0..attempts {
        let target = effective_radius - k;
        let records = decoder.decode(&buffer[k..], arena);
        let mut cumulative = 0usize;
        let mut pivot_index = None;
        for (idx, record) in records.iter().enumerate() {
            cumulative += record.length as usize;
            if cumulative == target {
                pivot_index = Some(idx);
                break;
            }
            if cumulative > target {
                break;
            }
        }
        if let Some(pivot_index) = pivot_index {
            let texts = decoder.disassemble(&records);
            let lines = records
                .into_iter()
                .zip(texts)
                .enumerate()
                .map(|(idx, (record, text))| {
                    let address = start + k as u64 + record.address;
                    let string_annotation = annotate_string(
                        &record,
                        address,
                        registers,
                        memory_map,
                        string_dump_size,
                    );
                    WindowLine {
                        address,
                        record,
                        text,
                        string_annotation,
                        is_pivot: idx == pivot_index,
                    }
                })
                .collect();
            return Ok(DisassemblyWindow { lines, pivot_index });
        }
    }

    Err(WindowError::NoAlignment)
}

fn is_window_readable(pivot: u64, radius: usize, memory_map: &MemoryMap) -> bool {
    let Some(start) = pivot.checked_sub(radius as u64) else {
        return false;
    };
    memory_map.contains_range(start as usize, radius * 2)
}

fn snapshot(start: u64, len: usize, memory_map: &MemoryMap) -> Vec<u8> {
    debug_assert!(memory_map.contains_range(start as usize, len));
    // Safety: the caller has just verified `[start, start+len)` lies within
    // a single mapped, readable region.
    unsafe { std::slice::from_raw_parts(start as *const u8, len).to_vec() }
}

fn annotate_string(
    record: &InstructionRecord<'_>,
    record_address: u64,
    registers: &RegisterFile,
    memory_map: &MemoryMap,
    string_dump_size: usize,
) -> Option<String> {
    if string_dump_size == 0 {
        return None;
    }
    let rip_after = record_address + record.length as u64;
    let rex = RexBits::from_record(record);
    let ea = ea_evaluator::evaluate(record, rip_after, registers, rex, memory_map)?;
    let target = ea.address;
    if !memory_map.contains(target as usize) {
        return None;
    }
    let mut out = Vec::with_capacity(string_dump_size);
    for i in 0..string_dump_size {
        let addr = target.wrapping_add(i as u64);
        if !memory_map.is_readable(addr as usize) {
            break;
        }
        let byte = unsafe { std::ptr::read(addr as *const u8) };
        if byte == 0 || !byte.is_ascii_graphic() && byte != b' ' {
            break;
        }
        out.push(byte);
    }
    if out.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&out).into_owned())
    }
}
