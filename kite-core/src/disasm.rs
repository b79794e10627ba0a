//! 逆アセンブル機能
//!
//! 1命令ずつIntel構文のテキストにデコードします。
//! オペランドも取り出しておき、停止中のレジスタ値やメモリの内容を添えて表示できます。

use crate::{DebugError, Result};
use capstone::arch::x86::{X86OpMem, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use kite_target::CpuState;
use std::fmt;

/// 2つ目のオペランドまで値を添える命令
const ANNOTATE_BOTH: [&str; 14] = [
    "mov", "movzx", "add", "sub", "xor", "mul", "imul", "and", "or", "shl", "shr", "test", "cmp",
    "lea",
];

/// 1つ目のオペランドにだけ値を添える命令
const ANNOTATE_FIRST: [&str; 2] = ["push", "pop"];

/// 命令のオペランド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Register(String),
    Memory {
        /// fs/gsなどのセグメント指定
        segment: Option<String>,
        base: Option<String>,
        index: Option<String>,
        scale: i32,
        disp: i64,
        /// アクセスするバイト数
        size: u8,
    },
    Immediate(i64),
}

/// デコードされた命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    /// 命令長（バイト）
    pub length: usize,
    pub bytes: Vec<u8>,
    /// `mov rbp, rsp` のようなIntel構文のテキスト
    pub text: String,
    pub mnemonic: String,
    pub operands: Vec<Operand>,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x} {}", self.address, self.text)
    }
}

impl Instruction {
    /// メモリオペランドの実効アドレス
    ///
    /// fs/gs相対のアドレスはセグメントのベースが分からないので求めません。
    pub fn effective_address(&self, operand: &Operand, cpu: &CpuState) -> Option<u64> {
        let Operand::Memory {
            segment,
            base,
            index,
            scale,
            disp,
            ..
        } = operand
        else {
            return None;
        };
        if segment.is_some() {
            return None;
        }

        let base = match base.as_deref() {
            None => 0,
            // RIP相対は次の命令の先頭が基準
            Some("rip") => self.address.wrapping_add(self.length as u64),
            Some(name) => cpu.register(name)?,
        };
        let index = match index.as_deref() {
            None => 0,
            Some(name) => cpu.register(name)?.wrapping_mul(*scale as u64),
        };
        Some(base.wrapping_add(index).wrapping_add(*disp as u64))
    }

    /// オペランドの値を ` - rax=0x1 - mem[0x7fe8]=0x2a` の形式で並べる
    ///
    /// `cpu` はこの命令の実行直前のレジスタであることを前提にします。
    /// `read` はトラップを元に戻したメモリを返す関数で、読めなければNoneを返します。
    pub fn annotate<F>(&self, cpu: &CpuState, read: F) -> String
    where
        F: Fn(u64, usize) -> Option<Vec<u8>>,
    {
        let count = if ANNOTATE_BOTH.contains(&self.mnemonic.as_str()) {
            2
        } else if ANNOTATE_FIRST.contains(&self.mnemonic.as_str()) {
            1
        } else {
            0
        };

        let mut out = String::new();
        for operand in self.operands.iter().take(count) {
            match operand {
                Operand::Register(name) => {
                    if let Some(value) = cpu.register(name) {
                        out.push_str(&format!(" - {}=0x{:x}", name, value));
                    }
                }
                Operand::Memory { size, .. } => {
                    let Some(address) = self.effective_address(operand, cpu) else {
                        continue;
                    };
                    let len = match *size as usize {
                        len @ 1..=8 => len,
                        _ => 8,
                    };
                    match read(address, len) {
                        Some(bytes) => {
                            let mut word = [0u8; 8];
                            word[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
                            out.push_str(&format!(
                                " - mem[0x{:x}]=0x{:x}",
                                address,
                                u64::from_le_bytes(word)
                            ));
                        }
                        None => out.push_str(&format!(" - mem[0x{:x}]=?", address)),
                    }
                }
                Operand::Immediate(_) => {}
            }
        }
        out
    }
}

/// x86-64の逆アセンブラ
pub struct Disassembler {
    cs: Capstone,
}

impl Disassembler {
    pub fn new() -> Result<Self> {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .detail(true)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))?;
        Ok(Self { cs })
    }

    /// バイト列の先頭にある1命令をデコードする
    ///
    /// 命令として解釈できなければ、読み取ったバイト列を添えて [`DebugError::DecodeError`] を返します。
    pub fn decode(&self, bytes: &[u8], address: u64) -> Result<Instruction> {
        let decode_error = || DebugError::DecodeError {
            address,
            bytes: bytes.to_vec(),
        };

        let insns = self
            .cs
            .disasm_count(bytes, address, 1)
            .map_err(|_| decode_error())?;
        let insn = insns.iter().next().ok_or_else(decode_error)?;

        let mnemonic = insn.mnemonic().unwrap_or("");
        let text = match insn.op_str() {
            Some(ops) if !ops.is_empty() => format!("{} {}", mnemonic, ops),
            _ => mnemonic.to_string(),
        };

        // オペランドは表示の補助なので、詳細が取れなければ空のまま
        let operands = match self.cs.insn_detail(insn) {
            Ok(detail) => detail
                .arch_detail()
                .operands()
                .into_iter()
                .filter_map(|op| match op {
                    ArchOperand::X86Operand(op) => self.operand(op.op_type, op.size),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                tracing::trace!(address = format_args!("0x{:x}", address), "no operand detail: {}", e);
                Vec::new()
            }
        };

        Ok(Instruction {
            address,
            length: insn.bytes().len(),
            bytes: insn.bytes().to_vec(),
            text,
            mnemonic: mnemonic.to_string(),
            operands,
        })
    }

    fn operand(&self, op_type: X86OperandType, size: u8) -> Option<Operand> {
        match op_type {
            X86OperandType::Reg(reg) => self.reg_name(reg).map(Operand::Register),
            X86OperandType::Imm(value) => Some(Operand::Immediate(value)),
            X86OperandType::Mem(mem) => Some(self.memory_operand(&mem, size)),
            _ => None,
        }
    }

    fn memory_operand(&self, mem: &X86OpMem, size: u8) -> Operand {
        Operand::Memory {
            segment: self.reg_name(mem.segment()),
            base: self.reg_name(mem.base()),
            index: self.reg_name(mem.index()),
            scale: mem.scale(),
            disp: mem.disp(),
            size,
        }
    }

    fn reg_name(&self, reg: RegId) -> Option<String> {
        if reg.0 == 0 {
            return None;
        }
        self.cs.reg_name(reg)
    }
}
