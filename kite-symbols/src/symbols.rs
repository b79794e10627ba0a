//! シンボル解決機能

use crate::ElfImage;
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// 表示用の名前を取得（デマングル可能ならデマングル後、できなければマングル名）
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }

    /// アドレスがシンボルの範囲内かどうか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address.saturating_add(self.size)
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }

    // C/C++のシンボルはそのまま
    name.to_string()
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順にソートされたシンボル
    symbols_by_address: Vec<Symbol>,
}

impl SymbolResolver {
    /// ELFイメージからシンボル解決を作成する
    pub fn new(image: &ElfImage) -> Self {
        let mut symbols_by_name = HashMap::new();
        let mut symbols_by_address = Vec::with_capacity(image.symbols().len());

        for sym in image.symbols() {
            // .symtab と .dynsym の重複は最初のものを残す
            symbols_by_name
                .entry(sym.name.clone())
                .or_insert_with(|| sym.clone());
            symbols_by_address.push(sym.clone());
        }

        symbols_by_address.sort_by_key(|s| s.address);
        symbols_by_address.dedup_by(|a, b| a.address == b.address && a.name == b.name);

        Self {
            symbols_by_name,
            symbols_by_address,
        }
    }

    /// シンボル名からアドレスを解決する
    ///
    /// マングル名で見つからなければデマングル名でも探します。
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        if let Some(sym) = self.symbols_by_name.get(symbol) {
            return Some(sym.address);
        }
        self.symbols_by_address
            .iter()
            .find(|s| s.demangled_name == symbol)
            .map(|s| s.address)
    }

    /// アドレスからシンボルを解決する（最も近いシンボルを返す）
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.symbols_by_address.partition_point(|s| s.address <= addr);
        if idx == 0 {
            return None;
        }

        let sym = &self.symbols_by_address[idx - 1];
        // サイズ情報があれば範囲内かチェックし、なければ最も近いシンボルを返す
        if sym.size == 0 || sym.contains(addr) {
            Some(sym)
        } else {
            None
        }
    }

    /// アドレスがいずれかの関数の先頭かどうか
    pub fn is_function_start(&self, addr: u64) -> bool {
        self.symbols_by_address
            .binary_search_by_key(&addr, |s| s.address)
            .is_ok()
    }
}
