// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The external-collaborator boundary (component C2). Everything in this
//! crate that needs to turn bytes into instructions goes through
//! `DecoderFacade`; nothing outside this file is aware that `zydis` exists.

use crate::arena::Arena;

/// Which prefix family produced the instruction. Determines which bytes
/// `SignatureEmitter` treats as "exact" versus wildcarding candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Legacy,
    Vex,
    Evex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModRmInfo {
    pub present: bool,
    pub mod_: u8,
    pub reg: u8,
    pub rm: u8,
    /// Byte offset of the ModR/M byte within the instruction's encoding.
    pub offset: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SibInfo {
    pub present: bool,
    pub scale: u8,
    pub index: u8,
    pub base: u8,
    pub offset: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispInfo {
    pub size: u8,
    pub offset: u8,
    pub bytes: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImmInfo {
    pub size: u8,
    pub offset: u8,
    pub bytes: [u8; 8],
}

/// One decoded instruction, arena-owned for the duration of a single
/// unwinding attempt.
#[derive(Debug, Clone)]
pub struct InstructionRecord<'a> {
    pub address: u64,
    pub length: u8,
    pub encoding: Encoding,
    pub has_rex: bool,
    /// REX.B/X/R extension bits, consulted by `ea_evaluator` to widen a
    /// ModR/M or SIB register field from 3 bits to 4 before indexing into
    /// `RegisterFile` (§9: REX-extended registers through R15).
    pub rex_b: bool,
    pub rex_x: bool,
    pub rex_r: bool,
    pub modrm: ModRmInfo,
    pub sib: SibInfo,
    pub disp: DispInfo,
    pub imm: [ImmInfo; 2],
    pub mnemonic: &'static str,
    pub bytes: &'a [u8],
}

impl<'a> InstructionRecord<'a> {
    /// Case-insensitive, ASCII-only match against the canonical mnemonic
    /// name, never locale-sensitive (§9).
    pub fn mnemonic_is(&self, name: &str) -> bool {
        self.mnemonic.eq_ignore_ascii_case(name)
    }

    pub fn disp_value(&self) -> i64 {
        match self.disp.size {
            1 => self.disp.bytes[0] as i8 as i64,
            2 => i16::from_le_bytes([self.disp.bytes[0], self.disp.bytes[1]]) as i64,
            4 => i32::from_le_bytes(self.disp.bytes).as_i64(),
            _ => 0,
        }
    }

    pub fn imm_value(&self, slot: usize) -> i64 {
        let imm = &self.imm[slot];
        match imm.size {
            1 => imm.bytes[0] as i8 as i64,
            2 => i16::from_le_bytes([imm.bytes[0], imm.bytes[1]]) as i64,
            4 => i32::from_le_bytes([imm.bytes[0], imm.bytes[1], imm.bytes[2], imm.bytes[3]])
                .as_i64(),
            8 => i64::from_le_bytes(imm.bytes),
            _ => 0,
        }
    }
}

trait AsI64 {
    fn as_i64(self) -> i64;
}
impl AsI64 for i32 {
    fn as_i64(self) -> i64 {
        self as i64
    }
}

/// A formatted instruction: mnemonic plus up to 4 operand strings.
#[derive(Debug, Clone, Default)]
pub struct DisassembledInstruction {
    pub mnemonic: String,
    pub operands: Vec<String>,
}

impl DisassembledInstruction {
    pub fn text(&self) -> String {
        if self.operands.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.operands.join(", "))
        }
    }

    /// Returns the first operand's text, ASCII-lowercased, for the
    /// RSP-first-operand match used by the return-address resolver.
    pub fn first_operand(&self) -> Option<&str> {
        self.operands.first().map(|s| s.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decoder failed to initialize")]
    InitFailed,
    #[error("no complete instruction at offset {0}")]
    Incomplete(usize),
}

/// External contract for turning bytes into decoded instructions and
/// decoded instructions into printable text (§4.2). Backed by `zydis`.
pub trait DecoderFacade {
    fn decode<'a>(&self, bytes: &[u8], arena: &'a Arena) -> Vec<InstructionRecord<'a>>;
    fn disassemble(&self, records: &[InstructionRecord<'_>]) -> Vec<DisassembledInstruction>;
}

/// The production `DecoderFacade`, backed by the `zydis` crate's 64-bit long
/// mode decoder. This is the only file in the crate that imports `zydis`.
#[cfg(target_os = "linux")]
pub struct ZydisDecoderFacade {
    decoder: zydis::Decoder,
    formatter: zydis::Formatter,
}

#[cfg(target_os = "linux")]
impl ZydisDecoderFacade {
    pub fn new() -> Result<Self, DecodeError> {
        let decoder = zydis::Decoder::new64();
        let formatter = zydis::Formatter::new(zydis::FormatterStyle::INTEL);
        Ok(Self { decoder, formatter })
    }

    fn encoding_of(insn: &zydis::ffi::DecodedInstruction) -> Encoding {
        match insn.encoding {
            zydis::InstructionEncoding::LEGACY => Encoding::Legacy,
            zydis::InstructionEncoding::VEX => Encoding::Vex,
            zydis::InstructionEncoding::EVEX | zydis::InstructionEncoding::MVEX => {
                Encoding::Evex
            }
            _ => Encoding::Legacy,
        }
    }
}

#[cfg(target_os = "linux")]
impl DecoderFacade for ZydisDecoderFacade {
    fn decode<'a>(&self, bytes: &[u8], arena: &'a Arena) -> Vec<InstructionRecord<'a>> {
        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let slice = &bytes[offset..];
            let decoded = self
                .decoder
                .decode_first::<zydis::VisibleOperands>(slice)
                .ok()
                .flatten();
            let Some(insn) = decoded else {
                break;
            };
            let length = insn.length as u8;
            if length == 0 {
                break;
            }
            let record_bytes = arena.copy_slice(&slice[..length as usize]);
            let mnemonic = arena.intern_str(mnemonic_name(insn.mnemonic));
            records.push(InstructionRecord {
                address: offset as u64,
                length,
                encoding: Self::encoding_of(&insn),
                has_rex: insn.raw.rex.present(),
                rex_b: insn.raw.rex.b(),
                rex_x: insn.raw.rex.x(),
                rex_r: insn.raw.rex.r(),
                modrm: ModRmInfo {
                    present: insn.raw.modrm.present(),
                    mod_: insn.raw.modrm.mod_,
                    reg: insn.raw.modrm.reg,
                    rm: insn.raw.modrm.rm,
                    offset: insn.raw.modrm.offset,
                },
                sib: SibInfo {
                    present: insn.raw.sib.present(),
                    scale: insn.raw.sib.scale,
                    index: insn.raw.sib.index,
                    base: insn.raw.sib.base,
                    offset: insn.raw.sib.offset,
                },
                disp: disp_info(&insn.raw.disp),
                imm: [imm_info(&insn.raw.imm[0]), imm_info(&insn.raw.imm[1])],
                mnemonic,
                bytes: record_bytes,
            });
            offset += length as usize;
        }
        records
    }

    fn disassemble(&self, records: &[InstructionRecord<'_>]) -> Vec<DisassembledInstruction> {
        records
            .iter()
            .map(|record| {
                let decoded = self
                    .decoder
                    .decode_first::<zydis::VisibleOperands>(record.bytes)
                    .ok()
                    .flatten();
                match decoded {
                    Some(insn) => {
                        let mut buffer = [0u8; 256];
                        let mut wrapped = zydis::OutputBuffer::new(&mut buffer[..]);
                        if self
                            .formatter
                            .format_ex(None, &insn, &mut wrapped, None)
                            .is_ok()
                        {
                            let text = wrapped.as_str().unwrap_or_default();
                            split_formatted(text)
                        } else {
                            DisassembledInstruction {
                                mnemonic: record.mnemonic.to_string(),
                                operands: Vec::new(),
                            }
                        }
                    }
                    None => DisassembledInstruction {
                        mnemonic: record.mnemonic.to_string(),
                        operands: Vec::new(),
                    },
                }
            })
            .collect()
    }
}

#[cfg(target_os = "linux")]
fn disp_info(raw: &zydis::ffi::RawInfoDisp) -> DispInfo {
    let size = (raw.size / 8) as u8;
    let mut bytes = [0u8; 4];
    let value_bytes = (raw.value as i32).to_le_bytes();
    bytes[..size.min(4) as usize].copy_from_slice(&value_bytes[..size.min(4) as usize]);
    DispInfo {
        size,
        offset: raw.offset,
        bytes,
    }
}

#[cfg(target_os = "linux")]
fn imm_info(raw: &zydis::ffi::RawImmediateInfo) -> ImmInfo {
    let size = (raw.size / 8) as u8;
    let mut bytes = [0u8; 8];
    let value_bytes = raw.value.to_le_bytes();
    bytes[..size.min(8) as usize].copy_from_slice(&value_bytes[..size.min(8) as usize]);
    ImmInfo {
        size,
        offset: raw.offset,
        bytes,
    }
}

#[cfg(target_os = "linux")]
fn mnemonic_name(mnemonic: zydis::Mnemonic) -> &'static str {
    // `zydis`'s `Mnemonic` implements `Display`/`as_ref` to the canonical
    // lowercase instruction name (e.g. "ret", "lea", "add"); this crate's
    // own return/epilogue matching is ASCII-case-insensitive, so the exact
    // casing here is not load-bearing.
    mnemonic.get_string().unwrap_or("unknown")
}

fn split_formatted(text: &str) -> DisassembledInstruction {
    let mut parts = text.splitn(2, ' ');
    let mnemonic = parts.next().unwrap_or_default().to_string();
    let operands = parts
        .next()
        .map(|rest| rest.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();
    DisassembledInstruction { mnemonic, operands }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disp_value_sign_extends() {
        let record = InstructionRecord {
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
                offset: 0,
                bytes: [0xFF, 0, 0, 0],
            },
            imm: [ImmInfo::default(), ImmInfo::default()],
            mnemonic: "mov",
            bytes: &[],
        };
        assert_eq!(record.disp_value(), -1);
    }

    #[test]
    fn disp_value_32_bit_sign_extends() {
        let record = InstructionRecord {
            address: 0,
            length: 6,
            encoding: Encoding::Legacy,
            has_rex: false,
            rex_b: false,
            rex_x: false,
            rex_r: false,
            modrm: ModRmInfo::default(),
            sib: SibInfo::default(),
            disp: DispInfo {
                size: 4,
                offset: 0,
                bytes: (-16i32).to_le_bytes(),
            },
            imm: [ImmInfo::default(), ImmInfo::default()],
            mnemonic: "lea",
            bytes: &[],
        };
        assert_eq!(record.disp_value(), -16);
    }

    #[test]
    fn mnemonic_is_ignores_case() {
        let record = InstructionRecord {
            address: 0,
            length: 1,
            encoding: Encoding::Legacy,
            has_rex: false,
            rex_b: false,
            rex_x: false,
            rex_r: false,
            modrm: ModRmInfo::default(),
            sib: SibInfo::default(),
            disp: DispInfo::default(),
            imm: [ImmInfo::default(), ImmInfo::default()],
            mnemonic: "ret",
            bytes: &[],
        };
        assert!(record.mnemonic_is("RET"));
        assert!(record.mnemonic_is("Ret"));
        assert!(!record.mnemonic_is("retn"));
    }

    #[test]
    fn disassembled_text_joins_operands() {
        let insn = DisassembledInstruction {
            mnemonic: "add".to_string(),
            operands: vec!["rsp".to_string(), "0x28".to_string()],
        };
        assert_eq!(insn.text(), "add rsp, 0x28");
        assert_eq!(insn.first_operand(), Some("rsp"));
    }

    #[test]
    fn split_formatted_separates_mnemonic_and_operands() {
        let insn = split_formatted("lea rax, [rip+0x20]");
        assert_eq!(insn.mnemonic, "lea");
        assert_eq!(insn.operands, vec!["rax", "[rip+0x20]"]);
    }
}
