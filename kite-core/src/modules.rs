//! ロード済みモジュールの追跡
//!
//! `/proc/pid/maps` のファイルマッピングをパスごとにまとめ、
//! 各モジュールのロードバイアスとシンボル表を保持します。

use crate::Result;
use kite_symbols::{ElfImage, SymbolResolver};
use kite_target::{MemoryMapping, Target};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// 動的ローダがモジュールの追加・削除のたびに呼ぶ関数
pub const LOADER_RENDEZVOUS: &str = "_dl_debug_state";

/// モジュールの概要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// ファイル名（例: `libc.so.6`）
    pub name: String,
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
    /// ファイル内アドレスに足すと実行時アドレスになる値
    pub bias: u64,
}

struct Module {
    info: ModuleInfo,
    resolver: SymbolResolver,
}

impl Module {
    fn matches(&self, query: &str) -> bool {
        let name = &self.info.name;
        name == query
            || self.info.path.as_os_str() == query
            || name
                .strip_prefix(query)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// アドレスを含む関数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub module: String,
    /// 表示用（デマングル後）の名前
    pub name: String,
    /// 実行時の先頭アドレス
    pub start: u64,
    /// サイズ（シンボル表に無ければ0）
    pub size: u64,
}

/// 前回の更新からの差分
#[derive(Debug, Default, Clone)]
pub struct ModuleChanges {
    pub loaded: Vec<ModuleInfo>,
    pub unloaded: Vec<ModuleInfo>,
}

impl ModuleChanges {
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.unloaded.is_empty()
    }
}

/// ロード済みモジュールの一覧
#[derive(Default)]
pub struct ModuleMap {
    /// パス -> モジュール
    modules: BTreeMap<PathBuf, Module>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// ターゲットのマッピングを読み直してモジュール一覧を更新する
    pub fn refresh<T: Target + ?Sized>(&mut self, target: &T) -> Result<ModuleChanges> {
        let mappings = target.mappings()?;

        let mut grouped: BTreeMap<PathBuf, Vec<&MemoryMapping>> = BTreeMap::new();
        for mapping in &mappings {
            if let Some(path) = mapping.file_path() {
                grouped.entry(path).or_default().push(mapping);
            }
        }

        let mut changes = ModuleChanges::default();

        let stale: Vec<PathBuf> = self
            .modules
            .iter()
            .filter(|(path, module)| {
                grouped
                    .get(*path)
                    .map_or(true, |maps| base_address(maps) != module.info.start)
            })
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            if let Some(module) = self.modules.remove(&path) {
                tracing::debug!(module = %module.info.name, "module unloaded");
                changes.unloaded.push(module.info);
            }
        }

        for (path, maps) in grouped {
            if self.modules.contains_key(&path) {
                continue;
            }
            let module = load_module(target, &path, &maps);
            tracing::debug!(
                module = %module.info.name,
                start = format_args!("0x{:x}", module.info.start),
                bias = format_args!("0x{:x}", module.info.bias),
                "module loaded"
            );
            changes.loaded.push(module.info.clone());
            self.modules.insert(path, module);
        }

        Ok(changes)
    }

    /// シンボルを実行時アドレスに解決する
    ///
    /// モジュールを指定しなければ、ロードアドレスの小さい順に最初に見つかったものを返します。
    pub fn resolve(&self, module: Option<&str>, name: &str) -> Option<u64> {
        let mut candidates: Vec<&Module> = self
            .modules
            .values()
            .filter(|m| module.map_or(true, |query| m.matches(query)))
            .collect();
        candidates.sort_by_key(|m| m.info.start);

        candidates.into_iter().find_map(|m| {
            m.resolver
                .resolve(name)
                .map(|addr| addr.wrapping_add(m.info.bias))
        })
    }

    /// アドレスを `module!symbol+0xoff` の形式で表す
    pub fn symbolize(&self, addr: u64) -> Option<String> {
        let module = self.module_at(addr)?;
        let file_addr = addr.wrapping_sub(module.info.bias);

        match module.resolver.reverse_resolve(file_addr) {
            Some(sym) => {
                let offset = file_addr - sym.address;
                if offset == 0 {
                    Some(format!("{}!{}", module.info.name, sym.display_name()))
                } else {
                    Some(format!(
                        "{}!{}+0x{:x}",
                        module.info.name,
                        sym.display_name(),
                        offset
                    ))
                }
            }
            None => Some(format!(
                "{}+0x{:x}",
                module.info.name,
                addr - module.info.start
            )),
        }
    }

    /// アドレスを含む関数
    pub fn function_at(&self, addr: u64) -> Option<FunctionInfo> {
        let module = self.module_at(addr)?;
        let sym = module
            .resolver
            .reverse_resolve(addr.wrapping_sub(module.info.bias))?;
        Some(FunctionInfo {
            module: module.info.name.clone(),
            name: sym.display_name().to_string(),
            start: sym.address.wrapping_add(module.info.bias),
            size: sym.size,
        })
    }

    /// アドレスがいずれかの関数の先頭かどうか
    pub fn is_function_start(&self, addr: u64) -> bool {
        self.module_at(addr).is_some_and(|m| {
            m.resolver
                .is_function_start(addr.wrapping_sub(m.info.bias))
        })
    }

    /// 動的ローダのランデブー関数のアドレス
    pub fn loader_rendezvous(&self) -> Option<u64> {
        self.resolve(None, LOADER_RENDEZVOUS)
    }

    /// ロード済みモジュールの一覧（アドレス順）
    pub fn modules(&self) -> Vec<ModuleInfo> {
        let mut infos: Vec<ModuleInfo> = self.modules.values().map(|m| m.info.clone()).collect();
        infos.sort_by_key(|m| m.start);
        infos
    }

    pub fn clear(&mut self) {
        self.modules.clear();
    }

    fn module_at(&self, addr: u64) -> Option<&Module> {
        self.modules
            .values()
            .find(|m| addr >= m.info.start && addr < m.info.end)
    }
}

/// ファイル先頭（オフセット0）がマップされたアドレス
fn base_address(maps: &[&MemoryMapping]) -> u64 {
    maps.iter()
        .find(|m| m.offset == 0)
        .or_else(|| maps.iter().min_by_key(|m| m.start))
        .map_or(0, |m| m.start)
}

fn load_module<T: Target + ?Sized>(target: &T, path: &Path, maps: &[&MemoryMapping]) -> Module {
    let start = base_address(maps);
    let end = maps.iter().map(|m| m.end).max().unwrap_or(start);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    // シンボルが読めなくてもモジュールとしては扱う
    let image = target.load_image(path).unwrap_or_else(|e| {
        tracing::warn!(module = %name, error = %e, "failed to read symbols");
        ElfImage::from_parts(Vec::new(), start)
    });

    Module {
        info: ModuleInfo {
            name,
            path: path.to_path_buf(),
            start,
            end,
            bias: image.load_bias(start),
        },
        resolver: SymbolResolver::new(&image),
    }
}
