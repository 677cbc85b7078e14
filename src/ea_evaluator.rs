// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Effective-address evaluation for ModR/M + SIB memory operands (C3).
//!
//! REX.B/X/R extension bits are folded into the register index here, per
//! the corrected register map described in the design notes: the 3-bit
//! ModR/M/SIB fields are widened to 4 bits before being handed to
//! `registers::encoded_index_to_reg`.

use crate::decoder::InstructionRecord;
use crate::memory_map::MemoryMap;
use crate::registers::{encoded_index_to_reg, Reg, RegisterFile};

/// REX prefix extension bits consulted when widening a 3-bit ModR/M/SIB
/// register field to the full 4-bit index.
#[derive(Debug, Clone, Copy, Default)]
pub struct RexBits {
    pub b: bool,
    pub x: bool,
    pub r: bool,
}

impl RexBits {
    /// Reads the REX extension bits a decoded instruction actually carried,
    /// rather than assuming none are set.
    pub fn from_record(record: &InstructionRecord<'_>) -> Self {
        Self {
            b: record.rex_b,
            x: record.rex_x,
            r: record.rex_r,
        }
    }
}

fn widen(field: u8, extension: bool) -> u8 {
    field | ((extension as u8) << 3)
}

/// Result of evaluating a memory operand: the computed address, and whether
/// the instruction's own semantics call for reading through it (as opposed
/// to treating the address itself as the final value, e.g. `LEA`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveAddress {
    pub address: u64,
    pub dereferenced_value: Option<u64>,
}

/// Computes the effective address of `record`'s ModR/M(+SIB) operand.
///
/// `rip_after` is the address immediately following the instruction, used
/// for RIP-relative addressing (`mod==00, rm==101`).
///
/// Returns `None` if the ModR/M is absent, the mode is register-direct
/// (`mod==11`, no memory access occurs), or any address the computation
/// would need to dereference falls outside `memory_map`.
pub fn evaluate(
    record: &InstructionRecord<'_>,
    rip_after: u64,
    registers: &RegisterFile,
    rex: RexBits,
    memory_map: &MemoryMap,
) -> Option<EffectiveAddress> {
    if !record.modrm.present {
        return None;
    }
    let modrm = &record.modrm;

    if modrm.rm != 0b100 {
        // No SIB byte.
        if modrm.mod_ == 0b00 && modrm.rm == 0b101 {
            let address = rip_after.wrapping_add(record.disp_value() as u64);
            return Some(EffectiveAddress {
                address,
                dereferenced_value: read_qword(address, memory_map),
            });
        }
        if modrm.mod_ == 0b11 {
            // Register-direct: no memory access.
            return None;
        }
        let base_reg = encoded_index_to_reg(widen(modrm.rm, rex.b));
        let base = registers.get(base_reg);
        let address = base.wrapping_add(record.disp_value() as u64);
        if !memory_map.contains(address as usize) {
            return None;
        }
        return Some(EffectiveAddress {
            address,
            dereferenced_value: read_qword(address, memory_map),
        });
    }

    // SIB byte present.
    let sib = &record.sib;
    let scaled: u64 = if sib.index == 0b100 {
        0
    } else {
        let index_reg = encoded_index_to_reg(widen(sib.index, rex.x));
        registers.get(index_reg).wrapping_mul(1u64 << sib.scale)
    };

    let (base, disp) = if sib.base == 0b101 {
        match modrm.mod_ {
            0b00 => (0u64, record.disp_value()),
            0b01 => (registers.get(Reg::Rbp), record.disp.bytes[0] as i8 as i64),
            0b10 => (registers.get(Reg::Rbp), record.disp_value()),
            _ => (registers.get(Reg::Rbp), 0),
        }
    } else {
        let base_reg = encoded_index_to_reg(widen(sib.base, rex.b));
        (registers.get(base_reg), record.disp_value())
    };

    let address = base.wrapping_add(scaled).wrapping_add(disp as u64);
    if !memory_map.contains(address as usize) {
        return None;
    }
    Some(EffectiveAddress {
        address,
        dereferenced_value: read_qword(address, memory_map),
    })
}

fn read_qword(address: u64, memory_map: &MemoryMap) -> Option<u64> {
    if !memory_map.contains_range(address as usize, 8) {
        return None;
    }
    // Safety: `contains_range` just confirmed this 8-byte span lies in a
    // single mapped, readable region. A fatal-signal handler has no
    // cooperative protocol with the faulting code, so this raw read is the
    // only way to observe live memory content.
    Some(unsafe { std::ptr::read_unaligned(address as *const u64) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DispInfo, Encoding, ImmInfo, ModRmInfo, SibInfo};

    fn blank_record() -> InstructionRecord<'static> {
        InstructionRecord {
            address: 0,
            length: 0,
            encoding: Encoding::Legacy,
            has_rex: false,
            rex_b: false,
            rex_x: false,
            rex_r: false,
            modrm: ModRmInfo::default(),
            sib: SibInfo::default(),
            disp: DispInfo::default(),
            imm: [ImmInfo::default(), ImmInfo::default()],
            mnemonic: "lea",
            bytes: &[],
        }
    }

    fn map_with(range: std::ops::Range<usize>) -> MemoryMap {
        let line = format!("{:x}-{:x} rw-p 0 00:00 0\n", range.start, range.end);
        MemoryMap::parse(&line)
    }

    #[test]
    fn rip_relative_uses_rip_after_not_register_table() {
        let mut record = blank_record();
        record.modrm = ModRmInfo {
            present: true,
            mod_: 0b00,
            reg: 0,
            rm: 0b101,
            offset: 1,
        };
        record.disp = DispInfo {
            size: 4,
            offset: 2,
            bytes: 0x20i32.to_le_bytes(),
        };
        let registers = RegisterFile::from_values([0; crate::registers::REGISTER_COUNT]);
        let map = map_with(0x1000..0x2000);
        let result = evaluate(&record, 0x1000, &registers, RexBits::default(), &map).unwrap();
        assert_eq!(result.address, 0x1020);
    }

    #[test]
    fn register_direct_mode_yields_no_memory_access() {
        let mut record = blank_record();
        record.modrm = ModRmInfo {
            present: true,
            mod_: 0b11,
            reg: 0,
            rm: 0,
            offset: 1,
        };
        let registers = RegisterFile::from_values([0; crate::registers::REGISTER_COUNT]);
        let map = map_with(0x1000..0x2000);
        assert!(evaluate(&record, 0, &registers, RexBits::default(), &map).is_none());
    }

    #[test]
    fn sib_index_100_contributes_zero_scaled_term() {
        let mut record = blank_record();
        record.modrm = ModRmInfo {
            present: true,
            mod_: 0b01,
            reg: 0,
            rm: 0b100,
            offset: 1,
        };
        record.sib = SibInfo {
            present: true,
            scale: 3,
            index: 0b100,
            base: 0, // RAX
            offset: 2,
        };
        record.disp = DispInfo {
            size: 1,
            offset: 3,
            bytes: [0x10, 0, 0, 0],
        };
        let mut values = [0u64; crate::registers::REGISTER_COUNT];
        values[Reg::Rax as usize] = 0x1000;
        let registers = RegisterFile::from_values(values);
        let map = map_with(0x1000..0x2000);
        let result = evaluate(&record, 0, &registers, RexBits::default(), &map).unwrap();
        assert_eq!(result.address, 0x1010);
    }

    #[test]
    fn sib_base_101_mod_00_contributes_zero_base() {
        let mut record = blank_record();
        record.modrm = ModRmInfo {
            present: true,
            mod_: 0b00,
            reg: 0,
            rm: 0b100,
            offset: 1,
        };
        record.sib = SibInfo {
            present: true,
            scale: 0,
            index: 0b100,
            base: 0b101,
            offset: 2,
        };
        record.disp = DispInfo {
            size: 4,
            offset: 3,
            bytes: 0x1500i32.to_le_bytes(),
        };
        let registers = RegisterFile::from_values([0xFFFF; crate::registers::REGISTER_COUNT]);
        let map = map_with(0x1000..0x2000);
        let result = evaluate(&record, 0, &registers, RexBits::default(), &map).unwrap();
        assert_eq!(result.address, 0x1500);
    }

    #[test]
    fn sib_base_101_mod_01_reads_rbp_and_truncates_disp_to_8_bits() {
        let mut record = blank_record();
        record.modrm = ModRmInfo {
            present: true,
            mod_: 0b01,
            reg: 0,
            rm: 0b100,
            offset: 1,
        };
        record.sib = SibInfo {
            present: true,
            scale: 0,
            index: 0b100,
            base: 0b101,
            offset: 2,
        };
        record.disp = DispInfo {
            size: 1,
            offset: 3,
            bytes: [0x08, 0, 0, 0],
        };
        let mut values = [0u64; crate::registers::REGISTER_COUNT];
        values[Reg::Rbp as usize] = 0x1800;
        let registers = RegisterFile::from_values(values);
        let map = map_with(0x1000..0x2000);
        let result = evaluate(&record, 0, &registers, RexBits::default(), &map).unwrap();
        assert_eq!(result.address, 0x1808);
    }

    #[test]
    fn rex_b_extends_base_register_through_r15() {
        let mut record = blank_record();
        record.modrm = ModRmInfo {
            present: true,
            mod_: 0b01,
            reg: 0,
            rm: 0b000, // base field 0 -> RAX, but REX.B makes it R8
            offset: 1,
        };
        record.disp = DispInfo {
            size: 1,
            offset: 2,
            bytes: [0x04, 0, 0, 0],
        };
        let mut values = [0u64; crate::registers::REGISTER_COUNT];
        values[Reg::Rax as usize] = 0xBAD;
        values[Reg::R8 as usize] = 0x1000;
        let registers = RegisterFile::from_values(values);
        let map = map_with(0x1000..0x2000);
        let rex = RexBits {
            b: true,
            ..Default::default()
        };
        let result = evaluate(&record, 0, &registers, rex, &map).unwrap();
        assert_eq!(result.address, 0x1004);
    }

    #[test]
    fn rex_bits_from_record_reads_decoded_extension_flags() {
        let mut record = blank_record();
        record.rex_b = true;
        record.rex_x = false;
        record.rex_r = true;
        let rex = RexBits::from_record(&record);
        assert!(rex.b);
        assert!(!rex.x);
        assert!(rex.r);
    }

    #[test]
    fn unmapped_target_yields_none() {
        let mut record = blank_record();
        record.modrm = ModRmInfo {
            present: true,
            mod_: 0b00,
            reg: 0,
            rm: 0b000,
            offset: 1,
        };
        let registers = RegisterFile::from_values([0; crate::registers::REGISTER_COUNT]);
        let map = map_with(0x1000..0x2000);
        assert!(evaluate(&record, 0, &registers, RexBits::default(), &map).is_none());
    }
}
