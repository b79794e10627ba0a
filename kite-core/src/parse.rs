//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート。
/// プレフィックスのない16進数はシンボル名と区別できないので受け付けません。
///
/// # Examples
/// ```
/// use kite_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else {
        s.parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// アドレスらしい文字列かどうか（0xプレフィックスまたは数字のみ）
pub fn looks_like_address(s: &str) -> bool {
    let s = s.trim();
    s.starts_with("0x") || s.starts_with("0X") || (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
}
