//! 表示用のフォーマット
//!
//! コアは型付きの値だけを返すので、人間向けの文字列にするのはここだけです。

use kite_core::{
    Breakpoint, CpuState, Instruction, ModuleInfo, StackFrame, StopReason, TraceEntry, Watchpoint,
};

/// 1行に表示するバイト数
const BYTES_PER_LINE: usize = 16;

pub fn stop_reason(reason: &StopReason) -> String {
    match reason {
        StopReason::Breakpoint(id) => format!("Breakpoint {} hit", id),
        StopReason::Watchpoint(id) => format!("Watchpoint {} hit", id),
        StopReason::MemoryAccess(addr) => format!("Memory at 0x{:x} accessed", addr),
        StopReason::Signal(sig) => format!("Received signal: {}", sig),
        StopReason::Exited(code) => format!("Process exited with code {}", code),
        StopReason::Killed(sig) => format!("Process killed by {}", sig),
        other => format!("Process {}", other),
    }
}

pub fn frame(frame: &StackFrame) -> String {
    let mut line = format!("#{:<2} 0x{:016x}", frame.depth, frame.instruction_pointer);
    if let Some(symbol) = &frame.symbol {
        line.push_str(&format!(" in {}", symbol));
    }
    line.push_str(&format!(" (frame 0x{:x})", frame.frame_base));
    line
}

pub fn stack(frames: &[StackFrame]) -> Vec<String> {
    if frames.is_empty() {
        return vec!["No stack frames".to_string()];
    }
    frames.iter().map(frame).collect()
}

pub fn instruction(insn: &Instruction) -> String {
    let bytes = insn
        .bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ");
    format!("0x{:x}: {:<30} {}", insn.address, bytes, insn.text)
}

pub fn breakpoint(bp: &Breakpoint) -> String {
    let location = match bp.address {
        Some(addr) => format!("0x{:x}", addr),
        None => "<pending>".to_string(),
    };
    let mut line = format!(
        "{:<4} {:<8} {:<18} {}",
        bp.id,
        if bp.enabled { "enabled" } else { "disabled" },
        location,
        bp.spec
    );
    if bp.once {
        line.push_str(" (once)");
    }
    if bp.references > 1 {
        line.push_str(&format!(" (x{})", bp.references));
    }
    line
}

pub fn registers(cpu: &CpuState) -> Vec<String> {
    [
        ("rip", cpu.rip),
        ("rsp", cpu.rsp),
        ("rbp", cpu.rbp),
        ("rax", cpu.rax),
        ("rbx", cpu.rbx),
        ("rcx", cpu.rcx),
        ("rdx", cpu.rdx),
        ("rsi", cpu.rsi),
        ("rdi", cpu.rdi),
        ("r8", cpu.r8),
        ("r9", cpu.r9),
        ("r10", cpu.r10),
        ("r11", cpu.r11),
        ("r12", cpu.r12),
        ("r13", cpu.r13),
        ("r14", cpu.r14),
        ("r15", cpu.r15),
        ("eflags", cpu.eflags),
    ]
    .iter()
    .map(|(name, value)| format!("{:<7} 0x{:016x}", name, value))
    .collect()
}

pub fn watchpoint(wp: &Watchpoint) -> String {
    format!(
        "{:<4} {:<10} 0x{:x} len {} (dr{})",
        wp.id, wp.kind, wp.address, wp.len, wp.slot
    )
}

pub fn trace_entry(entry: &TraceEntry) -> String {
    match &entry.symbol {
        Some(symbol) => format!("{:<60} <{}>", entry.text, symbol),
        None => entry.text.clone(),
    }
}

pub fn module(module: &ModuleInfo) -> String {
    format!(
        "0x{:012x}-0x{:012x} {} ({})",
        module.start,
        module.end,
        module.name,
        module.path.display()
    )
}

pub fn hexdump(address: u64, bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(BYTES_PER_LINE)
        .enumerate()
        .map(|(i, chunk)| {
            let hex = chunk
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            let ascii: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            format!(
                "0x{:x}: {:<width$}  {}",
                address + (i * BYTES_PER_LINE) as u64,
                hex,
                ascii,
                width = BYTES_PER_LINE * 3 - 1
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_line() {
        let f = StackFrame {
            depth: 1,
            instruction_pointer: 0x401234,
            frame_base: 0x7ffc0000,
            return_address: None,
            symbol: Some("app!main+0x4".to_string()),
        };
        assert_eq!(
            frame(&f),
            "#1  0x0000000000401234 in app!main+0x4 (frame 0x7ffc0000)"
        );
        assert_eq!(stack(&[]), vec!["No stack frames".to_string()]);
    }

    #[test]
    fn test_hexdump() {
        let lines = hexdump(0x1000, b"kite\x00\x01");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("0x1000: 6b 69 74 65 00 01"));
        assert!(lines[0].ends_with("kite.."));
    }

    #[test]
    fn test_registers_include_extended() {
        let cpu = CpuState {
            r8: 0x10,
            r15: 0xff,
            ..CpuState::default()
        };
        let lines = registers(&cpu);
        assert!(lines.contains(&"r8      0x0000000000000010".to_string()));
        assert!(lines.contains(&"r15     0x00000000000000ff".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("eflags  0x0000000000000000"));
    }

    #[test]
    fn test_watch_stop_reasons() {
        assert_eq!(stop_reason(&StopReason::Watchpoint(2)), "Watchpoint 2 hit");
        assert_eq!(
            stop_reason(&StopReason::MemoryAccess(0x601040)),
            "Memory at 0x601040 accessed"
        );
    }
}
