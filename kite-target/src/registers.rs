//! レジスタアクセス機能

use crate::Result;
use nix::errno::Errno;
use nix::libc;
use nix::unistd::Pid;

/// 停止中のスレッドのレジスタのスナップショット
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuState {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub eflags: u64,
}

/// 下位レジスタ名（32/16/8ビット、上位8ビット）と64ビットレジスタの対応
const LEGACY_NAMES: [(&str, &str, &str, &str, Option<&str>); 8] = [
    ("rax", "eax", "ax", "al", Some("ah")),
    ("rbx", "ebx", "bx", "bl", Some("bh")),
    ("rcx", "ecx", "cx", "cl", Some("ch")),
    ("rdx", "edx", "dx", "dl", Some("dh")),
    ("rsi", "esi", "si", "sil", None),
    ("rdi", "edi", "di", "dil", None),
    ("rbp", "ebp", "bp", "bpl", None),
    ("rsp", "esp", "sp", "spl", None),
];

impl CpuState {
    /// 64ビットレジスタの値
    fn full(&self, name: &str) -> Option<u64> {
        let value = match name {
            "rip" => self.rip,
            "rsp" => self.rsp,
            "rbp" => self.rbp,
            "rax" => self.rax,
            "rbx" => self.rbx,
            "rcx" => self.rcx,
            "rdx" => self.rdx,
            "rsi" => self.rsi,
            "rdi" => self.rdi,
            "r8" => self.r8,
            "r9" => self.r9,
            "r10" => self.r10,
            "r11" => self.r11,
            "r12" => self.r12,
            "r13" => self.r13,
            "r14" => self.r14,
            "r15" => self.r15,
            "rflags" | "eflags" => self.eflags,
            _ => return None,
        };
        Some(value)
    }

    /// 名前でレジスタの値を取得する
    ///
    /// `eax` や `r8d`、`al` のような部分レジスタは対応する範囲のビットだけを返します。
    pub fn register(&self, name: &str) -> Option<u64> {
        if let Some(value) = self.full(name) {
            return Some(value);
        }

        for (full, r32, r16, r8, high) in LEGACY_NAMES {
            let value = self.full(full)?;
            if name == r32 {
                return Some(value & 0xffff_ffff);
            }
            if name == r16 {
                return Some(value & 0xffff);
            }
            if name == r8 {
                return Some(value & 0xff);
            }
            if Some(name) == high {
                return Some((value >> 8) & 0xff);
            }
        }

        // r8d, r8w, r8b ...
        let (base, mask) = match name.as_bytes().last()? {
            b'd' => (&name[..name.len() - 1], 0xffff_ffff),
            b'w' => (&name[..name.len() - 1], 0xffff),
            b'b' => (&name[..name.len() - 1], 0xff),
            _ => return None,
        };
        if !base.starts_with('r') {
            return None;
        }
        self.full(base).map(|value| value & mask)
    }
}

impl From<&libc::user_regs_struct> for CpuState {
    fn from(regs: &libc::user_regs_struct) -> Self {
        Self {
            rip: regs.rip,
            rsp: regs.rsp,
            rbp: regs.rbp,
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            eflags: regs.eflags,
        }
    }
}

/// レジスタ情報
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<libc::user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.pid)?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: libc::user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// レジスタのスナップショットを取得する
    pub fn snapshot(&self) -> Result<CpuState> {
        let regs = self.read()?;
        Ok(CpuState::from(&regs))
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }

    /// デバッグレジスタ（DR0〜DR7）を読む
    pub fn debug_register(&self, index: usize) -> Result<u64> {
        let value = nix::sys::ptrace::read_user(self.pid, debug_register_offset(index)?)
            .map_err(|e| anyhow::anyhow!("Failed to read DR{}: {}", index, e))?;
        Ok(value as u64)
    }

    /// デバッグレジスタ（DR0〜DR7）に書き込む
    pub fn set_debug_register(&self, index: usize, value: u64) -> Result<()> {
        let offset = debug_register_offset(index)?;
        // SAFETY: PTRACE_POKEUSERはstruct user内のオフセットに1ワード書くだけで、
        // こちらのメモリには触れない
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                self.pid.as_raw(),
                offset,
                value as *mut libc::c_void,
            )
        };
        Errno::result(ret)
            .map_err(|e| anyhow::anyhow!("Failed to write DR{}: {}", index, e))?;
        Ok(())
    }
}

/// struct user 内のデバッグレジスタのオフセット
fn debug_register_offset(index: usize) -> Result<*mut libc::c_void> {
    if index >= 8 {
        return Err(anyhow::anyhow!("No such debug register DR{}", index));
    }
    let offset = std::mem::offset_of!(libc::user, u_debugreg) + index * 8;
    Ok(offset as *mut libc::c_void)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_register_names() {
        let cpu = CpuState {
            rax: 0x1122_3344_5566_7788,
            r8: 0xffff_0000_1234_abcd,
            rsi: 0x10,
            ..CpuState::default()
        };
        assert_eq!(cpu.register("rax"), Some(0x1122_3344_5566_7788));
        assert_eq!(cpu.register("eax"), Some(0x5566_7788));
        assert_eq!(cpu.register("ax"), Some(0x7788));
        assert_eq!(cpu.register("al"), Some(0x88));
        assert_eq!(cpu.register("ah"), Some(0x77));
        assert_eq!(cpu.register("r8d"), Some(0x1234_abcd));
        assert_eq!(cpu.register("r8w"), Some(0xabcd));
        assert_eq!(cpu.register("r8b"), Some(0xcd));
        assert_eq!(cpu.register("sil"), Some(0x10));
        assert_eq!(cpu.register("xmm0"), None);
        assert_eq!(cpu.register("rbd"), None);
    }
}
