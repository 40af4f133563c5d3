// crates/cv_engine/tests/errors.rs

//! 错误路径：解析、方程组不一致、奇异系统、非法 NCC

use cv_engine::prelude::*;
use std::sync::Arc;

fn circle() -> Arc<Basis> {
    Arc::new(Basis::circle(1.0, 8, 1.5).unwrap())
}

#[test]
fn test_parse_errors() {
    let u = Field::scalar("u", &circle()).unwrap();
    let mut problem = Problem::new(&[u]);
    let err = problem.add_equation_str("lap(u = 1", "").unwrap_err();
    assert!(matches!(err, CvError::Parse { .. }));
    assert!(problem.add_equation_str("lap(w) = 1", "").is_err());
    assert!(problem.add_equation_str("lap(u)", "").is_err());
    assert!(problem.add_equation_str("u = 0", "ell >").is_err());
    assert!(problem.equations().is_empty());
}

#[test]
fn test_missing_equation_is_inconsistent() {
    let basis = circle();
    let u = Field::scalar("u", &basis).unwrap();
    let v = Field::scalar("v", &basis).unwrap();
    let mut problem = Problem::new(&[u.clone(), v]);
    problem.add_equation(lap(&u), 0.0);
    let err = problem.build().unwrap_err();
    assert!(matches!(err, CvError::InconsistentEquationSet { .. }));
}

#[test]
fn test_singular_system_reports_mode() {
    let u = Field::scalar("u", &circle()).unwrap();
    let mut problem = Problem::new(&[u.clone()]);
    problem.add_equation(Expr::from(&u) - &u, 1.0);
    let mut solver = LinearBoundaryValueSolver::new(&problem).unwrap();
    let err = solver.solve().unwrap_err();
    assert!(matches!(err, CvError::SingularSystem { .. }));
}

#[test]
fn test_nonlinear_term_rejected() {
    let u = Field::scalar("u", &circle()).unwrap();
    let mut problem = Problem::new(&[u.clone()]);
    problem.add_equation(mul(&u, &u), 1.0);
    let err = problem.build().unwrap_err();
    assert!(matches!(err, CvError::UnsupportedNccExpression { .. }));
}

#[test]
fn test_mismatched_spaces_rejected() {
    let a = circle();
    let b = Arc::new(Basis::circle(2.0, 8, 1.5).unwrap());
    let u = Field::scalar("u", &a).unwrap();
    let v = Field::scalar("v", &b).unwrap();
    assert!((Expr::from(&u) + &v).shape().is_err());
}
