//! ブレークポイントを置いて試すための小さなデバッグ対象

use std::hint::black_box;

/// ブレークポイント用の目印（マングルされない名前で公開）
#[no_mangle]
#[inline(never)]
pub extern "C" fn trap_target_marker(value: u64) -> u64 {
    black_box(value.wrapping_mul(3).wrapping_add(1))
}

#[inline(never)]
fn busy_loop(rounds: u64) -> u64 {
    let mut acc = 0;
    for i in 0..rounds {
        acc = trap_target_marker(acc ^ i);
    }
    acc
}

fn main() {
    let rounds = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(3);

    // ライブラリ関数も呼んでおく（libc!write などのブレークポイント用）
    let result = busy_loop(rounds);
    println!("trap_target: {}", result);
}
