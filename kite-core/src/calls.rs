//! 既知の関数呼び出しの引数デコード
//!
//! 関数の先頭で停止しているとき、System V ABIの引数レジスタ（rdi, rsi, rdx, rcx, r8, r9）
//! から引数を読み、型に応じて整数・ポインタ・文字列として表示します。

use kite_target::CpuState;
use std::fmt;

/// 文字列引数を読む最大バイト数
pub const MAX_STRING_LEN: usize = 256;

/// 引数レジスタ（先頭から順）
const ARG_REGISTERS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

/// 文字列を読むときの1回あたりのバイト数
const STRING_CHUNK: usize = 32;

/// 引数の型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Pointer,
    /// NUL終端の文字列へのポインタ
    CString,
}

/// 引数の型が分かっている関数
#[derive(Debug)]
pub struct KnownFunction {
    pub name: &'static str,
    pub params: &'static [(&'static str, ArgKind)],
}

use ArgKind::{CString, Int, Pointer};

const KNOWN_FUNCTIONS: &[KnownFunction] = &[
    KnownFunction {
        name: "write",
        params: &[("fd", Int), ("buf", Pointer), ("count", Int)],
    },
    KnownFunction {
        name: "read",
        params: &[("fd", Int), ("buf", Pointer), ("count", Int)],
    },
    KnownFunction {
        name: "open",
        params: &[("pathname", CString), ("flags", Int), ("mode", Int)],
    },
    KnownFunction {
        name: "openat",
        params: &[("dirfd", Int), ("pathname", CString), ("flags", Int), ("mode", Int)],
    },
    KnownFunction {
        name: "close",
        params: &[("fd", Int)],
    },
    KnownFunction {
        name: "malloc",
        params: &[("size", Int)],
    },
    KnownFunction {
        name: "calloc",
        params: &[("nmemb", Int), ("size", Int)],
    },
    KnownFunction {
        name: "realloc",
        params: &[("ptr", Pointer), ("size", Int)],
    },
    KnownFunction {
        name: "free",
        params: &[("ptr", Pointer)],
    },
    KnownFunction {
        name: "puts",
        params: &[("s", CString)],
    },
    KnownFunction {
        name: "printf",
        params: &[("format", CString)],
    },
    KnownFunction {
        name: "strlen",
        params: &[("s", CString)],
    },
    KnownFunction {
        name: "memcpy",
        params: &[("dest", Pointer), ("src", Pointer), ("n", Int)],
    },
    KnownFunction {
        name: "exit",
        params: &[("status", Int)],
    },
];

/// 名前で既知の関数を探す
///
/// libcの内部別名（`__write`、`__libc_write` など）も同じ関数として扱います。
pub fn known_function(name: &str) -> Option<&'static KnownFunction> {
    let trimmed = name.trim_start_matches('_');
    let base = trimmed.strip_prefix("libc_").unwrap_or(trimmed);
    KNOWN_FUNCTIONS.iter().find(|f| f.name == base)
}

/// デコードした引数の値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Int(u64),
    Pointer(u64),
    String(String),
    /// 文字列を読めなかったポインタ
    Unreadable(u64),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // fdやステータスの負の値をそのまま見せる
            ArgValue::Int(value) => write!(f, "{}", *value as i64),
            ArgValue::Pointer(value) => write!(f, "0x{:x}", value),
            ArgValue::String(s) => write!(f, "{:?}", s),
            ArgValue::Unreadable(value) => write!(f, "0x{:x} <unreadable>", value),
        }
    }
}

/// 関数呼び出し
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// 引数名と値（未知の関数では空）
    pub args: Vec<(String, ArgValue)>,
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, (name, value)) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        f.write_str(")")
    }
}

/// 関数の先頭で停止しているときのレジスタから呼び出しを復元する
///
/// `read` はトラップを元に戻したメモリを返す関数で、読めなければNoneを返します。
pub fn decode_call<F>(name: &str, cpu: &CpuState, read: F) -> FunctionCall
where
    F: Fn(u64, usize) -> Option<Vec<u8>>,
{
    let Some(function) = known_function(name) else {
        return FunctionCall {
            name: name.to_string(),
            args: Vec::new(),
        };
    };

    let args = function
        .params
        .iter()
        .zip(ARG_REGISTERS)
        .map(|((param, kind), register)| {
            let raw = cpu.register(register).unwrap_or_default();
            let value = match kind {
                ArgKind::Int => ArgValue::Int(raw),
                ArgKind::Pointer => ArgValue::Pointer(raw),
                ArgKind::CString => match read_c_string(raw, &read) {
                    Some(s) => ArgValue::String(s),
                    None => ArgValue::Unreadable(raw),
                },
            };
            (param.to_string(), value)
        })
        .collect();

    FunctionCall {
        name: name.to_string(),
        args,
    }
}

/// NUL終端の文字列を読む（最大 [`MAX_STRING_LEN`] バイト）
///
/// マッピングの終わりをまたぐ塊は1バイトずつ読み直します。
fn read_c_string<F>(address: u64, read: &F) -> Option<String>
where
    F: Fn(u64, usize) -> Option<Vec<u8>>,
{
    if address == 0 {
        return None;
    }

    let mut bytes = Vec::new();
    while bytes.len() < MAX_STRING_LEN {
        let at = address.checked_add(bytes.len() as u64)?;
        let chunk = match read(at, STRING_CHUNK) {
            Some(chunk) => chunk,
            None => match read(at, 1) {
                Some(byte) => byte,
                None if bytes.is_empty() => return None,
                None => break,
            },
        };
        if chunk.is_empty() {
            break;
        }
        match chunk.iter().position(|b| *b == 0) {
            Some(nul) => {
                bytes.extend_from_slice(&chunk[..nul]);
                break;
            }
            None => bytes.extend_from_slice(&chunk),
        }
    }
    bytes.truncate(MAX_STRING_LEN);
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
