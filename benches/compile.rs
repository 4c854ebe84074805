//! Front-half pipeline benchmarks: fingerprinting, hole extraction, and
//! partial evaluation. Native linking is deliberately excluded; its cost
//! is the system linker's, not ours.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rustc_hash::{FxHashMap, FxHashSet};

use nbjit::partial::partial_eval;
use nbjit::{holes, read_program, Expr};

fn sample_cell() -> Expr {
    let mut src = String::from("x = 10\ny = x * 3\n@hole w = 5\n");
    for i in 0..40 {
        src.push_str(&format!("v{} = x + y * {}\n", i, i));
    }
    src.push_str("s = 0\nfor i in 1:8\n s = s + i\nend\nreturn s + w");
    read_program(&src).expect("benchmark source parses")
}

fn bench_fingerprint(c: &mut Criterion) {
    let ast = sample_cell();
    c.bench_function("fingerprint_cell", |b| {
        b.iter(|| black_box(&ast).fingerprint())
    });
}

fn bench_rewrite_holes(c: &mut Criterion) {
    let ast = sample_cell();
    c.bench_function("rewrite_holes", |b| {
        b.iter(|| holes::rewrite_holes(black_box(&ast), true).unwrap())
    });
}

fn bench_partial_eval(c: &mut Criterion) {
    let split = holes::rewrite_holes(&sample_cell(), true).unwrap();
    let bindings = FxHashMap::default();
    let dynamic: FxHashSet<String> = ["w".to_string()].into_iter().collect();
    c.bench_function("partial_eval_main", |b| {
        b.iter(|| partial_eval(black_box(&split.main), &bindings, &dynamic))
    });
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_rewrite_holes,
    bench_partial_eval
);
criterion_main!(benches);
