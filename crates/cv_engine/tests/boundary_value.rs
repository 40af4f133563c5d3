// crates/cv_engine/tests/boundary_value.rs

//! 线性边值问题端到端测试

use cv_engine::prelude::*;
use cv_engine::{Geometry, SubproblemMatrices};
use num_complex::Complex64;
use std::collections::HashSet;
use std::sync::Arc;

fn max_diff(a: &[Complex64], b: &[Complex64]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).norm()).fold(0.0, f64::max)
}

fn radial_profile(basis: &Arc<Basis>, f: impl Fn(f64) -> f64) -> Field {
    let field = Field::scalar("expected", basis).unwrap();
    field
        .set_grid_from_fn(|_, _, r| vec![Complex64::new(f(r), 0.0)])
        .unwrap();
    field
}

#[test]
fn test_ball_poisson() {
    let _ = env_logger::builder().is_test(true).try_init();
    let basis = Arc::new(Basis::ball(1.0, [8, 8, 12], 1.5).unwrap());
    let u = Field::scalar("u", &basis).unwrap();
    let mut problem = Problem::new(&[u.clone()]);
    let eq = problem.add_equation_str("lap(u) = 6", "").unwrap();
    problem.add_bc_str("u(r=1) = 1", eq).unwrap();

    let mut solver = LinearBoundaryValueSolver::new(&problem).unwrap();
    solver.solve().unwrap();

    let expected = radial_profile(&basis, |r| r * r);
    let err = max_diff(&u.coefficients().unwrap(), &expected.coefficients().unwrap());
    assert!(err < 1e-9, "误差 {err:.3e}");
}

#[test]
fn test_shell_poisson_satisfies_boundaries() {
    let basis = Arc::new(Basis::shell(0.5, 1.0, [8, 8, 16], 1.5).unwrap());
    let u = Field::scalar("u", &basis).unwrap();
    let mut problem = Problem::new(&[u.clone()]).with_config(SolverConfig::accurate());
    let eq = problem.add_equation(lap(&u), 0.0);
    problem.add_bc(interp(&u, 0.5), 0.0, eq).unwrap();
    problem.add_bc(interp(&u, 1.0), 1.0, eq).unwrap();
    assert_eq!(problem.taus().len(), 2);

    let mut solver = LinearBoundaryValueSolver::new(&problem).unwrap();
    solver.solve().unwrap();

    // u = 2 - 1/r
    let expected = radial_profile(&basis, |r| 2.0 - 1.0 / r);
    let err = max_diff(&u.coefficients().unwrap(), &expected.coefficients().unwrap());
    assert!(err < 1e-8, "误差 {err:.3e}");

    for (r, value) in [(0.5, 0.0), (1.0, 1.0)] {
        let boundary = interp(&u, r).evaluate().unwrap();
        assert!(matches!(boundary.basis().geometry(), Geometry::Sphere { .. }));
        let grid = boundary.grid_values().unwrap();
        for v in grid.iter() {
            assert!((v - Complex64::new(value, 0.0)).norm() < 1e-8);
        }
    }
}

#[test]
fn test_subproblems_partition_modes() {
    let basis = Arc::new(Basis::ball(1.0, [8, 8, 8], 1.5).unwrap());
    let u = Field::scalar("u", &basis).unwrap();
    let mut problem = Problem::new(&[u.clone()]);
    let eq = problem.add_equation(lap(&u), 0.0);
    problem.add_bc(interp(&u, 1.0), 0.0, eq).unwrap();
    let set = problem.build().unwrap();

    let keys: HashSet<ModeKey> = set.keys().into_iter().collect();
    assert_eq!(keys.len(), set.len());
    assert_eq!(keys, basis.mode_keys(true).into_iter().collect());

    let mut next = 0;
    for range in set.row_ranges() {
        assert_eq!(range.start, next);
        next = range.end;
    }
    assert_eq!(next, set.total_size());
}

#[test]
fn test_conditional_equations_on_sphere() {
    // 球面上 lap(u) = f 在 ℓ = 0 处奇异，改用均值约束
    let basis = Arc::new(Basis::sphere(1.0, 16, 12, 1.5).unwrap());
    let u = Field::scalar("u", &basis).unwrap();
    let c = Field::with_meta("c", cv_engine::FieldMeta::new(&basis, 0).radial_only()).unwrap();
    let f = Field::scalar("f", &basis).unwrap();
    f.set_grid_from_fn(|_, theta, _| vec![Complex64::new(-6.0 * theta.cos().powi(2) + 2.0, 0.0)])
        .unwrap();

    let mut problem = Problem::new(&[u.clone(), c.clone()]);
    problem.namespace_mut().insert_field(&f);
    problem.add_equation_str("lap(u) + c = f", "").unwrap();
    problem.add_equation_str("u = 0", "ell == 0").unwrap();

    let mut solver = LinearBoundaryValueSolver::new(&problem).unwrap();
    solver.solve().unwrap();

    // 解为 cos²θ - 1/3
    let expected = Field::scalar("expected", &basis).unwrap();
    expected
        .set_grid_from_fn(|_, theta, _| vec![Complex64::new(theta.cos().powi(2) - 1.0 / 3.0, 0.0)])
        .unwrap();
    let err = max_diff(&u.coefficients().unwrap(), &expected.coefficients().unwrap());
    assert!(err < 1e-10, "误差 {err:.3e}");
    assert!(c.coefficients().unwrap().iter().all(|x| x.norm() < 1e-10));
}

#[test]
fn test_export_to_file() {
    let basis = Arc::new(Basis::ball(1.0, [8, 6, 6], 1.5).unwrap());
    let u = Field::scalar("u", &basis).unwrap();
    let mut problem = Problem::new(&[u.clone()]);
    let eq = problem.add_equation(lap(&u), 1.0);
    problem.add_bc(interp(&u, 1.0), 0.0, eq).unwrap();
    let set = problem.build().unwrap();

    let path = std::env::temp_dir().join(format!("cv_engine_export_{}.json", std::process::id()));
    set.export_to_file(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    let loaded: Vec<SubproblemMatrices> = serde_json::from_str(&text).unwrap();
    assert_eq!(loaded.len(), set.len());
    for (a, b) in loaded.iter().zip(set.export_matrices()) {
        assert_eq!(a.key, b.key);
        assert_eq!(a.offset, b.offset);
    }
}
