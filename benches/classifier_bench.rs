use criterion::{black_box, criterion_group, criterion_main, Criterion};
use graftbot::board::{compute_game_result, parse_uci_move, PositionHistory};

fn long_shuffle_history() -> PositionHistory {
    let mut h = PositionHistory::from_fen("7k/p7/4K3/8/8/8/8/8 w - - 60 80").unwrap();
    // Reversible king shuffle to stack up positions under the 50-move counter.
    for _ in 0..8 {
        for uci in ["e6d5", "h8h7", "d5e6", "h7h8"] {
            let mv = parse_uci_move(h.last().board(), uci).unwrap();
            h.append(mv).unwrap();
        }
    }
    h
}

fn bench_classifier(c: &mut Criterion) {
    let h = long_shuffle_history();
    c.bench_function("rmobility_classify_32_plies", |b| {
        b.iter(|| black_box(compute_game_result(black_box(&h))))
    });
}

fn bench_uci_parse(c: &mut Criterion) {
    let h = PositionHistory::starting();
    let board = h.last().board().clone();
    c.bench_function("parse_uci_move_startpos", |b| {
        b.iter(|| black_box(parse_uci_move(black_box(&board), "g1f3")))
    });
}

criterion_group!(benches, bench_classifier, bench_uci_parse);
criterion_main!(benches);
