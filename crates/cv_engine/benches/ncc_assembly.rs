// crates/cv_engine/benches/ncc_assembly.rs

//! NCC 矩阵构建与子问题组装基准

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use cv_engine::prelude::*;
use cv_engine::{FieldMeta, NccCache, NccExpression};
use num_complex::Complex64;
use std::sync::Arc;

fn setup(nr: usize) -> (Arc<Basis>, Field, Field) {
    let basis = Arc::new(Basis::ball(1.0, [16, 16, nr], 1.5).expect("basis"));
    let f = Field::with_meta("f", FieldMeta::new(&basis, 0).radial_only()).expect("field");
    f.set_grid_from_fn(|_, _, r| vec![Complex64::new(1.0 + r.powi(4), 0.0)])
        .expect("grid");
    let u = Field::vector("u", &basis).expect("field");
    (basis, f, u)
}

fn ncc_matrices(c: &mut Criterion) {
    let mut group = c.benchmark_group("ncc_store_all");
    for nr in [8, 16, 32] {
        let (_, f, u) = setup(nr);
        let expr = mul(&f, &u);
        group.bench_function(format!("ball_vector_nr{nr}"), |b| {
            b.iter_batched(
                || {
                    let cache = Arc::new(NccCache::new(SolverConfig::default().ncc));
                    NccExpression::new(&expr, &[u.clone()], cache).expect("prepare")
                },
                |ncc| black_box(ncc.store_all().expect("store")),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn subproblem_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("subproblem_build");
    group.sample_size(10);
    for nr in [8, 16] {
        let (basis, f, _) = setup(nr);
        let u = Field::scalar("u", &basis).expect("field");
        let mut problem = Problem::new(&[u.clone()]);
        let eq = problem.add_equation(lap(&u) + mul(&f, &u), 1.0);
        problem.add_bc(interp(&u, 1.0), 0.0, eq).expect("bc");
        group.bench_function(format!("ball_helmholtz_nr{nr}"), |b| {
            b.iter(|| black_box(problem.build().expect("build").total_size()));
        });
    }
    group.finish();
}

criterion_group!(benches, ncc_matrices, subproblem_build);
criterion_main!(benches);
