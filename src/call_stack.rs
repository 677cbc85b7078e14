// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drives `return_addr::resolve` up to a configured depth (C6).

use crate::arena::Arena;
use crate::decoder::DecoderFacade;
use crate::memory_map::MemoryMap;
use crate::registers::{CallStack, Reg, RegisterFile};
use crate::return_addr;

/// Unwinds up to `depth` frames starting at `crash_rip`. Index 0 of the
/// returned `CallStack` is always `crash_rip` itself; the unwind stops at
/// the first unresolved frame rather than guessing.
pub fn unwind(
    decoder: &dyn DecoderFacade,
    arena: &Arena,
    crash_rip: u64,
    registers: &RegisterFile,
    memory_map: &MemoryMap,
    depth: usize,
) -> CallStack {
    let mut stack = CallStack::new();
    stack.push(crash_rip);

    let mut cursor_start = crash_rip;
    let mut cursor_registers = *registers;

    for _ in 0..depth {
        arena.reset();
        let Some(resolution) =
            return_addr::resolve(decoder, arena, cursor_start, &cursor_registers, memory_map)
        else {
            break;
        };
        stack.push(resolution.return_address);
        cursor_start = resolution.return_address;
        // Seed the next resolution step with the caller's own RSP (always
        // recovered) and RBP (recovered only across a framed epilogue;
        // otherwise the caller's RBP carries forward unchanged).
        cursor_registers = cursor_registers
            .with(Reg::Rip, resolution.return_address)
            .with(Reg::Rsp, resolution.rsp_after_return);
        if let Some(rbp) = resolution.rbp_after_return {
            cursor_registers = cursor_registers.with(Reg::Rbp, rbp);
        }
    }

    stack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DisassembledInstruction, InstructionRecord};

    struct NoReturnDecoder;
    impl DecoderFacade for NoReturnDecoder {
        fn decode<'a>(&self, _bytes: &[u8], _arena: &'a Arena) -> Vec<InstructionRecord<'a>> {
            Vec::new()
        }
        fn disassemble(&self, _records: &[InstructionRecord<'_>]) -> Vec<DisassembledInstruction> {
            Vec::new()
        }
    }

    #[test]
    fn stops_at_first_unresolved_frame() {
        let decoder = NoReturnDecoder;
        let arena = Arena::new();
        let registers = RegisterFile::from_values([0; crate::registers::REGISTER_COUNT]);
        let map = MemoryMap::parse("");
        let stack = unwind(&decoder, &arena, 0x1000, &registers, &map, 3);
        assert_eq!(stack.frames(), &[0x1000]);
    }

    #[test]
    fn call_stack_length_never_exceeds_depth_plus_one() {
        let decoder = NoReturnDecoder;
        let arena = Arena::new();
        let registers = RegisterFile::from_values([0; crate::registers::REGISTER_COUNT]);
        let map = MemoryMap::parse("");
        let stack = unwind(&decoder, &arena, 0x1000, &registers, &map, 5);
        assert!(stack.len() <= 6);
    }
}
