// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Orchestrates the report file's exact on-disk layout (C8).

use crate::arena::Arena;
use crate::call_stack;
use crate::config::Config;
use crate::decoder::DecoderFacade;
use crate::disasm_window::{self, DisassemblyWindow};
use crate::memory_map::MemoryMap;
use crate::registers::{RegisterFile, REGISTER_NAMES};
use crate::signature;
use chrono::{Datelike, Local, Timelike};
use std::io::{self, Write};

const BANNER: &str = "///////////////////////////////////////////////////////////////////////////";

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Writes the full report for one fault episode to `out`.
///
/// `maps_text` is the verbatim contents of `/proc/self/maps`, captured
/// before any other report section so its line ordering matches what the
/// kernel actually reported at fault time.
pub fn write_report(
    out: &mut dyn Write,
    decoder: &dyn DecoderFacade,
    config: &Config,
    signal_name: &str,
    signal_description: &str,
    maps_text: &str,
    registers: &RegisterFile,
    memory_map: &MemoryMap,
) -> io::Result<()> {
    write_header(out, signal_name, signal_description)?;
    write_maps_block(out, maps_text)?;
    write_register_block(out, registers)?;

    let arena = Arena::new();
    let stack = call_stack::unwind(
        decoder,
        &arena,
        registers.rip(),
        registers,
        memory_map,
        config.call_stack_depth(),
    );
    write_call_stack(out, &stack)?;

    for (index, &frame_address) in stack.frames().iter().enumerate() {
        arena.reset();
        write_frame_block(
            out,
            decoder,
            &arena,
            index,
            frame_address,
            config,
            registers,
            memory_map,
        )?;
    }

    write_footer(out)?;
    Ok(())
}

fn write_header(out: &mut dyn Write, signal_name: &str, signal_description: &str) -> io::Result<()> {
    let now = Local::now();
    writeln!(out, "{BANNER}")?;
    writeln!(out, "{BANNER}")?;
    writeln!(
        out,
        " [ DeadStop ] Fatal signal received, this program will terminate now."
    )?;
    writeln!(
        out,
        " [ DeadStop ] Starting log dump @ {}",
        format_timestamp(now)
    )?;
    writeln!(
        out,
        " [ DeadStop ] Signal received [ {signal_name} ] i.e. {signal_description}"
    )?;
    writeln!(out)
}

fn write_maps_block(out: &mut dyn Write, maps_text: &str) -> io::Result<()> {
    writeln!(
        out,
        "[ Start ]------------------------------->  Mapped Memory Regions"
    )?;
    for line in maps_text.lines() {
        writeln!(out, "{line}")?;
    }
    writeln!(
        out,
        "[  End  ]------------------------------->  Mapped Memory Regions"
    )?;
    writeln!(out)
}

fn write_register_block(out: &mut dyn Write, registers: &RegisterFile) -> io::Result<()> {
    writeln!(
        out,
        "[ Start ]------------------------------->  General Purpose Registers"
    )?;
    let name_width = REGISTER_NAMES.iter().map(|n| n.len()).max().unwrap_or(0);
    for (name, value) in REGISTER_NAMES.iter().zip(registers.raw().iter()) {
        let zero_marker = if *value == 0 { " [ zero ]" } else { "" };
        writeln!(out, "{name:<name_width$} : {value:016X}{zero_marker}")?;
    }
    writeln!(
        out,
        "[  End  ]------------------------------->  General Purpose Registers"
    )?;
    writeln!(out)
}

fn write_call_stack(out: &mut dyn Write, stack: &crate::registers::CallStack) -> io::Result<()> {
    writeln!(out, " [ DeadStop ] Call Stack :")?;
    for (index, &address) in stack.frames().iter().enumerate() {
        if index == 0 {
            writeln!(out, "    {index}. {address:#018x} <--[ crashed here ]")?;
        } else {
            writeln!(out, "    {index}. {address:#018x}")?;
        }
    }
    writeln!(out)
}

#[allow(clippy::too_many_arguments)]
fn write_frame_block(
    out: &mut dyn Write,
    decoder: &dyn DecoderFacade,
    arena: &Arena,
    index: usize,
    frame_address: u64,
    config: &Config,
    registers: &RegisterFile,
    memory_map: &MemoryMap,
) -> io::Result<()> {
    writeln!(
        out,
        "[ Start ]------------------------------->  Function Index : {index}. Adrs : {frame_address:#018x}"
    )?;

    let marker = if index == 0 { "Crashed Here" } else { "Return Adrs" };
    let window = disasm_window::build(
        decoder,
        arena,
        frame_address,
        config.asm_dump_radius(),
        memory_map,
        registers,
        config.string_dump_size(),
    );

    match window {
        Ok(DisassemblyWindow { lines, .. }) => {
            for line in &lines {
                let mut rendered = format!(
                    "{:#018x}    {:<32}{}",
                    line.address,
                    bytes_hex(line.record.bytes),
                    line.text.text()
                );
                if let Some(annotation) = &line.string_annotation {
                    rendered.push_str(&format!("; {annotation}"));
                }
                if line.is_pivot {
                    rendered.push_str(&format!("  <--[ {marker} ]"));
                    let sig = signature::emit(
                        std::slice::from_ref(&line.record),
                        0,
                        config.signature_size(),
                    );
                    rendered.push_str(&format!(" Sig : {sig}"));
                }
                writeln!(out, "{rendered}")?;
            }
        }
        Err(err) => {
            writeln!(out, " [ DeadStop ] disassembly unavailable: {err}")?;
        }
    }

    writeln!(
        out,
        "[  End  ]------------------------------->  Function Index : {index}. Adrs : {frame_address:#018x}"
    )?;
    writeln!(out)
}

fn write_footer(out: &mut dyn Write) -> io::Result<()> {
    let now = Local::now();
    writeln!(
        out,
        " [ DeadStop ] Log dump ended @ {}",
        format_timestamp(now)
    )?;
    writeln!(out, "{BANNER}")
}

fn format_timestamp(now: chrono::DateTime<Local>) -> String {
    let hour24 = now.hour();
    let hour12 = match hour24 % 12 {
        0 => 12,
        h => h,
    };
    let meridiem = if hour24 < 12 { "AM" } else { "PM" };
    format!(
        "Date {{ {} {} {} }} Time {{ {:02}:{:02}:{:02} {} }}",
        now.day(),
        MONTH_NAMES[now.month0() as usize],
        now.year(),
        hour12,
        now.minute(),
        now.second(),
        meridiem
    )
}

fn bytes_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X} ")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_uses_12_hour_clock_with_meridiem() {
        let midnight = Local.with_ymd_and_hms(2026, 8, 1, 0, 30, 0).unwrap();
        let formatted = format_timestamp(midnight);
        assert!(formatted.contains("12:30:00 AM"));

        let noon = Local.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert!(format_timestamp(noon).contains("12:00:00 PM"));

        let afternoon = Local.with_ymd_and_hms(2026, 8, 1, 15, 45, 9).unwrap();
        assert!(format_timestamp(afternoon).contains("03:45:09 PM"));
    }

    #[test]
    fn timestamp_uses_full_month_name() {
        let date = Local.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        assert!(format_timestamp(date).contains("January"));
    }
}
