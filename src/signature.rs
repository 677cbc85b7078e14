// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Emits a byte-level instruction signature with displacement and
//! immediate bytes wildcarded (C7).

use crate::decoder::InstructionRecord;

const WILDCARD: &str = "?";

/// Emits a space-separated uppercase-hex signature covering at least
/// `min_bytes` bytes of encoded instructions starting at `start_index`,
/// wildcarding every displacement and immediate byte position.
pub fn emit(records: &[InstructionRecord<'_>], start_index: usize, min_bytes: usize) -> String {
    let mut tokens = Vec::new();
    let mut covered = 0usize;

    for record in records.iter().skip(start_index) {
        tokens.extend(instruction_tokens(record));
        covered += record.length as usize;
        if covered >= min_bytes {
            break;
        }
    }

    tokens.join(" ")
}

/// Produces one token per byte of `record`'s encoding: the literal hex byte
/// for every position, except displacement and immediate byte ranges which
/// become `?`.
fn instruction_tokens(record: &InstructionRecord<'_>) -> Vec<String> {
    let mut wildcard_ranges: Vec<(usize, usize)> = Vec::new();
    if record.disp.size > 0 {
        let offset = record.disp.offset as usize;
        wildcard_ranges.push((offset, offset + record.disp.size as usize));
    }
    for imm in &record.imm {
        if imm.size > 0 {
            let offset = imm.offset as usize;
            wildcard_ranges.push((offset, offset + imm.size as usize));
        }
    }

    record
        .bytes
        .iter()
        .enumerate()
        .map(|(idx, byte)| {
            let wildcarded = wildcard_ranges
                .iter()
                .any(|(start, end)| idx >= *start && idx < *end);
            if wildcarded {
                WILDCARD.to_string()
            } else {
                format!("{byte:02X}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DispInfo, Encoding, ImmInfo, ModRmInfo, SibInfo};

    fn record_with_disp() -> InstructionRecord<'static> {
        InstructionRecord {
            address: 0,
            length: 3,
            encoding: Encoding::Legacy,
            has_rex: false,
            rex_b: false,
            rex_x: false,
            rex_r: false,
            modrm: ModRmInfo::default(),
            sib: SibInfo::default(),
            disp: DispInfo {
                size: 1,
                offset: 2,
                bytes: [0x10, 0, 0, 0],
            },
            imm: [ImmInfo::default(), ImmInfo::default()],
            mnemonic: "add",
            bytes: &[0x83, 0xC0, 0x10],
        }
    }

    #[test]
    fn wildcards_only_displacement_bytes() {
        let record = record_with_disp();
        let sig = emit(std::slice::from_ref(&record), 0, 1);
        assert_eq!(sig, "83 C0 ?");
    }

    #[test]
    fn token_count_matches_instruction_length() {
        let record = record_with_disp();
        let sig = emit(std::slice::from_ref(&record), 0, 1);
        assert_eq!(sig.split(' ').count(), record.length as usize);
    }

    #[test]
    fn accumulates_across_instructions_until_min_bytes_reached() {
        let a = record_with_disp();
        let mut b = record_with_disp();
        b.bytes = &[0x48, 0x89, 0x45];
        b.disp = DispInfo {
            size: 1,
            offset: 2,
            bytes: [0x08, 0, 0, 0],
        };
        let records = [a, b];
        let sig = emit(&records, 0, 4);
        assert_eq!(sig, "83 C0 ? 48 89 ?");
    }

    #[test]
    fn wildcards_immediate_bytes() {
        let mut record = record_with_disp();
        record.disp = DispInfo::default();
        record.imm[0] = ImmInfo {
            size: 1,
            offset: 1,
            bytes: [0x10, 0, 0, 0, 0, 0, 0, 0],
        };
        let sig = emit(std::slice::from_ref(&record), 0, 1);
        assert_eq!(sig, "83 ? 10");
    }
}
