//! デバッガコマンド

use crate::parse::parse_address;
use crate::{BreakpointId, WatchKind, WatchpointId};

/// `read` で長さを省略したときのバイト数
const DEFAULT_READ_LEN: usize = 16;

/// ウォッチポイントで長さを省略したときのバイト数
const DEFAULT_WATCH_LEN: usize = 8;

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定
    Break(String),
    /// 一時ブレークポイントを設定
    TemporaryBreak(String),
    /// ブレークポイントを削除
    Delete(BreakpointId),
    /// ブレークポイントを有効化
    Enable(BreakpointId),
    /// ブレークポイントを無効化
    Disable(BreakpointId),
    /// プログラムを起動してエントリポイントで停止
    Start,
    /// 実行継続
    Continue,
    /// 1命令だけ実行
    StepInstruction,
    /// ウォッチポイントを設定
    Watch {
        address: u64,
        len: usize,
        kind: WatchKind,
    },
    /// ウォッチポイントを削除
    Unwatch(WatchpointId),
    /// メモリがアクセスされるまで実行継続
    UntilAccess { address: u64, len: usize },
    /// 関数の命令トレースを開始
    Trace(String),
    /// トレースを終了
    Untrace,
    /// バックトレース表示
    Backtrace,
    /// 最も内側のフレーム表示
    Frame,
    /// 命令を表示（省略時は現在の命令）
    Examine(Option<u64>),
    /// ブレークポイント一覧
    InfoBreakpoints,
    /// レジスタ表示
    InfoRegisters,
    /// ロード済みモジュール一覧
    InfoModules,
    /// ウォッチポイント一覧
    InfoWatchpoints,
    /// 記録したトレースを表示
    InfoTrace,
    /// 関数呼び出しの引数を表示（省略時は現在の命令）
    InfoCall(Option<u64>),
    /// メモリをダンプ
    Read { address: u64, len: usize },
    /// ターゲットを終了させる
    Kill,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }

        match parts[0] {
            "break" | "b" => {
                if parts.len() > 1 {
                    Some(Command::Break(parts[1..].join(" ")))
                } else {
                    None
                }
            }
            "tbreak" | "tb" => {
                if parts.len() > 1 {
                    Some(Command::TemporaryBreak(parts[1..].join(" ")))
                } else {
                    None
                }
            }
            "delete" | "d" => parse_id(&parts).map(Command::Delete),
            "enable" => parse_id(&parts).map(Command::Enable),
            "disable" => parse_id(&parts).map(Command::Disable),
            "start" | "run" | "r" => Some(Command::Start),
            "continue" | "c" => Some(Command::Continue),
            "stepi" | "si" | "step" | "s" => Some(Command::StepInstruction),
            "watch" => parse_range(&parts).map(|(address, len)| Command::Watch {
                address,
                len,
                kind: WatchKind::Write,
            }),
            "awatch" => parse_range(&parts).map(|(address, len)| Command::Watch {
                address,
                len,
                kind: WatchKind::ReadWrite,
            }),
            "unwatch" => parse_id(&parts).map(Command::Unwatch),
            "until-access" | "ua" => {
                parse_range(&parts).map(|(address, len)| Command::UntilAccess { address, len })
            }
            "trace" => {
                if parts.len() == 2 {
                    Some(Command::Trace(parts[1].to_string()))
                } else {
                    None
                }
            }
            "untrace" => Some(Command::Untrace),
            "backtrace" | "bt" => Some(Command::Backtrace),
            "frame" | "f" => Some(Command::Frame),
            "x/i" => match parts.get(1) {
                Some(addr) => parse_address(addr).ok().map(|a| Command::Examine(Some(a))),
                None => Some(Command::Examine(None)),
            },
            "info" | "i" => match parts.get(1).copied() {
                Some("breakpoints" | "break" | "b") => Some(Command::InfoBreakpoints),
                Some("registers" | "reg" | "r") => Some(Command::InfoRegisters),
                Some("modules" | "mod") => Some(Command::InfoModules),
                Some("watchpoints" | "watch" | "w") => Some(Command::InfoWatchpoints),
                Some("trace") => Some(Command::InfoTrace),
                Some("call") => match parts.get(2) {
                    Some(addr) => parse_address(addr).ok().map(|a| Command::InfoCall(Some(a))),
                    None => Some(Command::InfoCall(None)),
                },
                _ => None,
            },
            "read" => {
                let address = parse_address(parts.get(1)?).ok()?;
                let len = match parts.get(2) {
                    Some(len) => len.parse().ok()?,
                    None => DEFAULT_READ_LEN,
                };
                Some(Command::Read { address, len })
            }
            "kill" | "k" => Some(Command::Kill),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

fn parse_id(parts: &[&str]) -> Option<usize> {
    parts.get(1)?.parse().ok()
}

/// `<addr> [len]` を読む
fn parse_range(parts: &[&str]) -> Option<(u64, usize)> {
    let address = parse_address(parts.get(1)?).ok()?;
    let len = match parts.get(2) {
        Some(len) => len.parse().ok()?,
        None => DEFAULT_WATCH_LEN,
    };
    Some((address, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("continue"), Some(Command::Continue));
        assert_eq!(Command::parse("c"), Some(Command::Continue));
        assert_eq!(Command::parse("stepi"), Some(Command::StepInstruction));
        assert_eq!(Command::parse("bt"), Some(Command::Backtrace));
        assert_eq!(Command::parse("start"), Some(Command::Start));
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
        assert_eq!(Command::parse("   "), None);
        assert_eq!(Command::parse("frobnicate"), None);
    }

    #[test]
    fn test_parse_breakpoint_commands() {
        assert_eq!(
            Command::parse("break libc.so.6!open"),
            Some(Command::Break("libc.so.6!open".to_string()))
        );
        assert_eq!(Command::parse("b"), None);
        assert_eq!(Command::parse("delete 2"), Some(Command::Delete(2)));
        assert_eq!(Command::parse("delete two"), None);
        assert_eq!(Command::parse("enable 1"), Some(Command::Enable(1)));
        assert_eq!(Command::parse("disable 1"), Some(Command::Disable(1)));
        assert_eq!(Command::parse("info b"), Some(Command::InfoBreakpoints));
    }

    #[test]
    fn test_parse_examine_and_read() {
        assert_eq!(Command::parse("x/i"), Some(Command::Examine(None)));
        assert_eq!(
            Command::parse("x/i 0x401000"),
            Some(Command::Examine(Some(0x401000)))
        );
        assert_eq!(
            Command::parse("read 0x7ff0 32"),
            Some(Command::Read {
                address: 0x7ff0,
                len: 32
            })
        );
        assert_eq!(
            Command::parse("read 0x7ff0"),
            Some(Command::Read {
                address: 0x7ff0,
                len: DEFAULT_READ_LEN
            })
        );
        assert_eq!(Command::parse("read"), None);
        assert_eq!(Command::parse("info registers"), Some(Command::InfoRegisters));
        assert_eq!(Command::parse("info modules"), Some(Command::InfoModules));
    }

    #[test]
    fn test_parse_watch_commands() {
        assert_eq!(
            Command::parse("watch 0x7ff0"),
            Some(Command::Watch {
                address: 0x7ff0,
                len: DEFAULT_WATCH_LEN,
                kind: WatchKind::Write
            })
        );
        assert_eq!(
            Command::parse("awatch 0x7ff0 4"),
            Some(Command::Watch {
                address: 0x7ff0,
                len: 4,
                kind: WatchKind::ReadWrite
            })
        );
        assert_eq!(Command::parse("watch counter"), None);
        assert_eq!(Command::parse("unwatch 1"), Some(Command::Unwatch(1)));
        assert_eq!(
            Command::parse("until-access 0x601040 1"),
            Some(Command::UntilAccess {
                address: 0x601040,
                len: 1
            })
        );
        assert_eq!(Command::parse("info watchpoints"), Some(Command::InfoWatchpoints));
    }

    #[test]
    fn test_parse_trace_and_call_commands() {
        assert_eq!(
            Command::parse("tbreak main"),
            Some(Command::TemporaryBreak("main".to_string()))
        );
        assert_eq!(Command::parse("tbreak"), None);
        assert_eq!(
            Command::parse("trace libc.so.6!strlen"),
            Some(Command::Trace("libc.so.6!strlen".to_string()))
        );
        assert_eq!(Command::parse("trace"), None);
        assert_eq!(Command::parse("untrace"), Some(Command::Untrace));
        assert_eq!(Command::parse("info trace"), Some(Command::InfoTrace));
        assert_eq!(Command::parse("info call"), Some(Command::InfoCall(None)));
        assert_eq!(
            Command::parse("info call 0x401000"),
            Some(Command::InfoCall(Some(0x401000)))
        );
    }
}
