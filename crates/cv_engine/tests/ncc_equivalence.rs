// crates/cv_engine/tests/ncc_equivalence.rs

//! NCC 矩阵乘积与网格直接乘积的一致性
//!
//! 系数场由 `f = r⁴` 及其梯度生成（阶数 0/1/2），作用对象
//! `u = ∇(3x² + 2yz)`，在球体与球壳上比较两条路径的谱系数。

use cv_engine::expr::{cross, dot, grad, mul};
use cv_engine::prelude::*;
use cv_engine::{FieldMeta, NccCache, NccExpression};
use cv_engine::ncc::NccKey;
use cv_spectral::csr::CsrTriplets;
use num_complex::Complex64;
use std::collections::HashMap;
use std::sync::Arc;

const TOL: f64 = 1e-10;

fn ball() -> Arc<Basis> {
    Arc::new(Basis::ball(1.5, [8, 8, 12], 1.5).unwrap())
}

fn shell() -> Arc<Basis> {
    Arc::new(Basis::shell(0.5, 1.0, [8, 8, 12], 1.5).unwrap())
}

/// 阶数为 0、1、2 的仅径向系数场
fn coefficients(basis: &Arc<Basis>) -> [Field; 3] {
    let f = Field::with_meta("f", FieldMeta::new(basis, 0).radial_only()).unwrap();
    f.set_grid_from_fn(|_, _, r| vec![Complex64::new(r.powi(4), 0.0)])
        .unwrap();
    let g = grad(&f).evaluate().unwrap();
    let h = grad(&g).evaluate().unwrap();
    assert!(!g.angular() && !h.angular());
    [f, g, h]
}

/// 阶数为 `rank` 的变量：`∇^rank (3x² + 2yz)`
fn unknown(basis: &Arc<Basis>, rank: usize, complex: bool) -> Field {
    let h = Field::scalar("h", basis).unwrap();
    h.set_grid_from_fn(|phi, theta, r| {
        let x = r * theta.sin() * phi.cos();
        let y = r * theta.sin() * phi.sin();
        let z = r * theta.cos();
        vec![Complex64::new(3.0 * x * x + 2.0 * y * z, 0.0)]
    })
    .unwrap();
    let mut expr = Expr::from(&h);
    for _ in 0..rank {
        expr = grad(expr);
    }
    if complex {
        expr = Complex64::new(1.0, 0.5) * expr;
    }
    expr.evaluate().unwrap()
}

fn operand(basis: &Arc<Basis>, complex: bool) -> Field {
    unknown(basis, 1, complex)
}

fn assert_equivalent(expr: &Expr, u: &Field) {
    let config = SolverConfig::accurate().ncc;
    let direct = expr.evaluate().unwrap().coefficients().unwrap();
    let ncc = expr
        .as_ncc(&[u.clone()], config)
        .unwrap()
        .evaluate_as_ncc()
        .unwrap()
        .coefficients()
        .unwrap();
    assert_eq!(direct.len(), ncc.len(), "{expr}");
    let scale = direct.iter().map(|c| c.norm()).fold(1.0, f64::max);
    let err = direct
        .iter()
        .zip(&ncc)
        .map(|(a, b)| (a - b).norm())
        .fold(0.0, f64::max);
    assert!(err <= TOL * scale, "{expr}: 误差 {err:.3e}");
}

fn check_all_products(basis: &Arc<Basis>) {
    let [f, g, h] = coefficients(basis);
    for complex in [false, true] {
        // 标量变量
        let s = unknown(basis, 0, complex);
        for expr in [
            mul(&f, &s),
            mul(&s, &f),
            mul(&g, &s),
            mul(&s, &g),
            mul(&h, &s),
            mul(&s, &h),
        ] {
            assert_equivalent(&expr, &s);
        }

        // 矢量变量
        let u = unknown(basis, 1, complex);
        for expr in [
            mul(&f, &u),
            mul(&u, &f),
            mul(&g, &u),
            mul(&u, &g),
            dot(&g, &u),
            dot(&u, &g),
            cross(&g, &u),
            cross(&u, &g),
            dot(&h, &u),
            dot(&u, &h),
        ] {
            assert_equivalent(&expr, &u);
        }

        // 二阶张量变量
        let t = unknown(basis, 2, complex);
        assert_eq!(t.rank(), 2);
        for expr in [
            mul(&f, &t),
            mul(&t, &f),
            dot(&g, &t),
            dot(&t, &g),
            dot(&h, &t),
            dot(&t, &h),
        ] {
            assert_equivalent(&expr, &t);
        }
    }
}

#[test]
fn test_ball_ncc_matches_grid_product() {
    check_all_products(&ball());
}

#[test]
fn test_shell_ncc_matches_grid_product() {
    check_all_products(&shell());
}

#[test]
fn test_ncc_inside_operator_tree() {
    let basis = ball();
    let [f, _, _] = coefficients(&basis);
    let u = operand(&basis, false);
    // 系数乘积嵌套在算子与加法中
    let expr = grad(mul(&f, cv_engine::expr::div(&u))) + Expr::from(&u);
    assert_equivalent(&expr, &u);
}

type Snapshot = HashMap<NccKey, CsrTriplets<Complex64>>;

fn snapshot(cache: &NccCache) -> Snapshot {
    cache
        .keys()
        .into_iter()
        .filter_map(|k| cache.get(&k).map(|m| (k, m.to_triplets())))
        .collect()
}

fn assert_same_bits(a: &Snapshot, b: &Snapshot) {
    assert_eq!(a.len(), b.len());
    for (key, ta) in a {
        let tb = &b[key];
        assert_eq!((ta.n_rows, ta.n_cols), (tb.n_rows, tb.n_cols));
        assert_eq!(ta.rows, tb.rows);
        assert_eq!(ta.cols, tb.cols);
        let bits = |t: &CsrTriplets<Complex64>| -> Vec<(u64, u64)> {
            t.values.iter().map(|z| (z.re.to_bits(), z.im.to_bits())).collect()
        };
        assert_eq!(bits(ta), bits(tb), "{key:?}");
    }
}

#[test]
fn test_store_is_idempotent() {
    let basis = ball();
    let [f, g, _] = coefficients(&basis);
    let u = operand(&basis, false);
    let cache = Arc::new(NccCache::new(SolverConfig::accurate().ncc));
    let a = NccExpression::new(&mul(&f, &u), &[u.clone()], cache.clone()).unwrap();
    let b = NccExpression::new(&dot(&g, &u), &[u.clone()], cache.clone()).unwrap();

    let first = a.store_all().unwrap();
    assert!(first > 0);
    let stored = snapshot(&cache);
    assert_eq!(a.store_all().unwrap(), 0);
    assert_same_bits(&stored, &snapshot(&cache));

    let second = b.store_all().unwrap();
    assert!(second > 0);
    assert_eq!(cache.len(), first + second);
    let stored = snapshot(&cache);
    assert_eq!(b.store_all().unwrap(), 0);
    assert_eq!(a.store_all().unwrap(), 0);
    assert_same_bits(&stored, &snapshot(&cache));

    // 只对部分模式存储后再补全，结果与首次构建逐位一致
    assert_eq!(cache.regenerate(f.id()), first);
    let keys = basis.mode_keys(true);
    let partial = a.store_ncc_matrices(keys.iter().copied().take(3)).unwrap();
    assert_eq!(partial, 3);
    assert_eq!(a.store_ncc_matrices(keys).unwrap(), first - 3);
    assert_same_bits(&stored, &snapshot(&cache));
}

#[test]
fn test_variable_products_rejected() {
    let basis = ball();
    let u = operand(&basis, false);
    let err = mul(&u, &u)
        .as_ncc(&[u.clone()], SolverConfig::default().ncc)
        .unwrap_err();
    assert!(matches!(err, CvError::UnsupportedNccExpression { .. }));
}

#[test]
fn test_subproblem_matrices_reproduce_product() {
    let basis = ball();
    let [f, _, _] = coefficients(&basis);
    for complex in [false, true] {
        let u = operand(&basis, complex);
        let expr = mul(&f, &u);
        let direct = expr.evaluate().unwrap();

        let mut problem = Problem::new(&[u.clone()]).with_config(SolverConfig::accurate());
        problem.add_equation(expr.clone(), 0.0);
        let set = problem.build().unwrap();
        for sp in set.subproblems() {
            let x = sp.gather(&[u.clone()]).unwrap();
            let w = sp.apply_l(&x);
            let expected = direct.block(sp.key()).unwrap().unwrap_or_default();
            assert_eq!(w.len(), expected.len());
            let scale = expected.iter().map(|c| c.norm()).fold(1.0, f64::max);
            for (a, b) in w.iter().zip(&expected) {
                assert!((a - b).norm() <= TOL * scale, "{}", sp.key());
            }
        }

        // 子问题构建时已存入同一缓存
        let ncc = NccExpression::new(&expr, &[u.clone()], set.ncc_cache().clone()).unwrap();
        assert_eq!(ncc.store_for(&set).unwrap(), 0);
    }
}
