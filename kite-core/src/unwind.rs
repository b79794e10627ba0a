//! スタック巻き戻し
//!
//! フレームポインタ（rbp）の連鎖をたどってコールスタックを復元します。
//! SysV x86-64では `[rbp]` に呼び出し元のrbp、`[rbp + 8]` に戻りアドレスがあります。

use kite_target::CpuState;

/// 巻き戻しに必要なターゲットの情報
pub trait StackMemory {
    /// 8バイトを読む（読めなければNone）
    fn read_word(&self, addr: u64) -> Option<u64>;

    /// 実行可能なマッピング内のアドレスかどうか
    fn is_code(&self, addr: u64) -> bool;

    /// 関数の先頭（プロローグ実行前）かどうか
    fn is_function_start(&self, _addr: u64) -> bool {
        false
    }

    /// アドレスのシンボル表記
    fn symbolize(&self, _addr: u64) -> Option<String> {
        None
    }
}

/// スタックフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// 0が最も内側
    pub depth: usize,
    pub instruction_pointer: u64,
    pub frame_base: u64,
    /// 呼び出し元に戻るアドレス（不明ならNone）
    pub return_address: Option<u64>,
    /// `module!symbol+0xoff`
    pub symbol: Option<String>,
}

/// フレームポインタによる巻き戻し
#[derive(Debug, Clone, Copy)]
pub struct Unwinder {
    max_depth: usize,
}

impl Unwinder {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// 現在のレジスタからスタックを巻き戻す
    ///
    /// 壊れたスタックでもエラーにはせず、たどれたところまでを返します。
    pub fn unwind<M: StackMemory + ?Sized>(&self, cpu: &CpuState, memory: &M) -> Vec<StackFrame> {
        let mut frames = Vec::new();
        if self.max_depth == 0 || !memory.is_code(cpu.rip) {
            return frames;
        }

        let mut ip = cpu.rip;
        let mut base = cpu.rbp;
        // 呼び出し元のフレームベースはこれより大きくなければならない
        let mut floor = 0;

        // プロローグ前はrbpがまだ呼び出し元のもので、戻りアドレスは[rsp]にある
        if memory.is_function_start(cpu.rip) {
            let ret = memory.read_word(cpu.rsp).filter(|addr| memory.is_code(*addr));
            frames.push(frame(0, ip, cpu.rsp, ret, memory));
            match ret {
                Some(ret) => ip = ret,
                None => return frames,
            }
            floor = cpu.rsp;
        }

        while frames.len() < self.max_depth {
            let depth = frames.len();

            let caller = if base != 0 && base > floor {
                read_frame_record(base, memory)
            } else {
                None
            };

            frames.push(frame(depth, ip, base, caller.map(|(ret, _)| ret), memory));

            let Some((ret, prev_base)) = caller else {
                break;
            };
            floor = base;
            base = prev_base;
            ip = ret;
        }

        if frames.len() == self.max_depth {
            tracing::debug!(depth = self.max_depth, "stack truncated by depth limit");
        }
        frames
    }
}

/// `[base + 8]` の戻りアドレスと `[base]` の呼び出し元フレームベースを読む
fn read_frame_record<M: StackMemory + ?Sized>(base: u64, memory: &M) -> Option<(u64, u64)> {
    let ret = memory.read_word(base.checked_add(8)?)?;
    if !memory.is_code(ret) {
        return None;
    }
    let prev_base = memory.read_word(base)?;
    Some((ret, prev_base))
}

fn frame<M: StackMemory + ?Sized>(
    depth: usize,
    ip: u64,
    base: u64,
    return_address: Option<u64>,
    memory: &M,
) -> StackFrame {
    StackFrame {
        depth,
        instruction_pointer: ip,
        frame_base: base,
        return_address,
        symbol: memory.symbolize(ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    const CODE_START: u64 = 0x401000;
    const CODE_END: u64 = 0x402000;

    #[derive(Default)]
    struct FakeStack {
        words: HashMap<u64, u64>,
        function_starts: HashSet<u64>,
    }

    impl FakeStack {
        fn push_record(&mut self, base: u64, prev_base: u64, ret: u64) {
            self.words.insert(base, prev_base);
            self.words.insert(base + 8, ret);
        }
    }

    impl StackMemory for FakeStack {
        fn read_word(&self, addr: u64) -> Option<u64> {
            self.words.get(&addr).copied()
        }

        fn is_code(&self, addr: u64) -> bool {
            (CODE_START..CODE_END).contains(&addr)
        }

        fn is_function_start(&self, addr: u64) -> bool {
            self.function_starts.contains(&addr)
        }

        fn symbolize(&self, addr: u64) -> Option<String> {
            Some(format!("app+0x{:x}", addr - CODE_START))
        }
    }

    fn cpu(rip: u64, rsp: u64, rbp: u64) -> CpuState {
        CpuState {
            rip,
            rsp,
            rbp,
            ..CpuState::default()
        }
    }

    #[test]
    fn test_walks_frame_chain() {
        let mut stack = FakeStack::default();
        stack.push_record(0x7000, 0x7100, 0x401200);
        stack.push_record(0x7100, 0x7200, 0x401300);
        stack.push_record(0x7200, 0, 0);

        let frames = Unwinder::new(64).unwind(&cpu(0x401100, 0x6ff0, 0x7000), &stack);
        let ips: Vec<u64> = frames.iter().map(|f| f.instruction_pointer).collect();
        assert_eq!(ips, vec![0x401100, 0x401200, 0x401300]);
        assert_eq!(frames[0].return_address, Some(0x401200));
        assert_eq!(frames[2].return_address, None);
        assert_eq!(frames[1].frame_base, 0x7100);
        assert_eq!(frames[1].depth, 1);
        assert_eq!(frames[1].symbol.as_deref(), Some("app+0x200"));
    }

    #[test]
    fn test_outside_code_is_empty() {
        let stack = FakeStack::default();
        assert!(Unwinder::new(64).unwind(&cpu(0x10, 0x6ff0, 0x7000), &stack).is_empty());
    }

    #[test]
    fn test_no_frame_pointer_yields_single_frame() {
        let stack = FakeStack::default();
        let frames = Unwinder::new(64).unwind(&cpu(0x401000, 0x6ff0, 0), &stack);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].instruction_pointer, 0x401000);
    }

    #[test]
    fn test_corrupted_return_address_terminates() {
        let mut stack = FakeStack::default();
        stack.push_record(0x7000, 0x7100, 0xdead_beef);
        let frames = Unwinder::new(64).unwind(&cpu(0x401100, 0x6ff0, 0x7000), &stack);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].return_address, None);
    }

    #[test]
    fn test_self_referencing_chain_terminates() {
        let mut stack = FakeStack::default();
        // 自分自身を指すrbp
        stack.push_record(0x7000, 0x7000, 0x401200);
        let frames = Unwinder::new(64).unwind(&cpu(0x401100, 0x6ff0, 0x7000), &stack);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_depth_guard_truncates() {
        let mut stack = FakeStack::default();
        for i in 0..100u64 {
            let base = 0x7000 + i * 0x10;
            stack.push_record(base, base + 0x10, 0x401000 + i);
        }
        let frames = Unwinder::new(8).unwind(&cpu(0x401100, 0x6ff0, 0x7000), &stack);
        assert_eq!(frames.len(), 8);
        assert_eq!(frames[7].depth, 7);
    }

    #[test]
    fn test_function_entry_reads_return_from_rsp() {
        let mut stack = FakeStack::default();
        stack.function_starts.insert(0x401500);
        stack.words.insert(0x6ff0, 0x401234);
        stack.push_record(0x7000, 0, 0);

        let frames = Unwinder::new(64).unwind(&cpu(0x401500, 0x6ff0, 0x7000), &stack);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].return_address, Some(0x401234));
        assert_eq!(frames[1].instruction_pointer, 0x401234);
        assert_eq!(frames[1].frame_base, 0x7000);
    }
}
