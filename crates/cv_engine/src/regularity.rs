// crates/cv_engine/src/regularity.rs

//! 球体原点正则性分解
//!
//! 对模式 `(m, ℓ)` 与阶数 `k`，自旋分量空间分解为正交子空间 `V_b`
//! (`b ∈ -k..=k`)，`V_b` 中的分量径向形如 `r^{ℓ+b} P(r²)`。
//!
//! # 构造
//!
//! 生成元取为常张量乘以立体调和函数：
//!
//! ```text
//! G = ε_{μ1} ⊗ ... ⊗ ε_{μk} · r^j Y_{j,M},   M = m - Σμ,  j = ℓ + b
//! ε_0 = e_z,  ε_{±1} = e_x ± i e_y
//! ```
//!
//! 每个生成元的自旋分量投影到 `Y^{s(τ)}_ℓm` 后得到一个分量向量；
//! 按 `b` 升序做 Hermitian 修正 Gram-Schmidt，新增的方向归入 `V_b`，`λ = ℓ + b`。
//! 子空间维数之和必须等于 `|s(τ)| ≤ ℓ` 的分量个数。

use cv_foundation::{CvError, CvResult};
use cv_spectral::harmonics::spin_harmonics;
use cv_spectral::quadrature::gauss_legendre;
use cv_spectral::tensor::TensorSig;
use num_complex::Complex64;
use std::f64::consts::FRAC_1_SQRT_2;

/// 正则分量（`Q` 矩阵的一列）
#[derive(Debug, Clone)]
pub struct RegularityColumn {
    /// 径向指数 `λ = ℓ + b`
    pub lambda: u32,
    /// `b`
    pub b: i32,
    /// 自旋分量系数（长度 `3^k`）
    pub weights: Vec<Complex64>,
}

/// 某一模式与阶数的正则性分解
#[derive(Debug, Clone)]
pub struct RegularityTable {
    /// 张量阶数
    pub rank: usize,
    /// 列（按 `b` 升序）
    pub columns: Vec<RegularityColumn>,
}

impl RegularityTable {
    /// 列数
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// `ε_μ` 在自旋分量 `σ` 上的取值（`μ` 取 0,1,2 对应 -1,0,+1）
fn cartesian_spin(mu: usize, sigma: usize, x: f64) -> f64 {
    let sin_t = (1.0 - x * x).max(0.0).sqrt();
    match (mu, sigma) {
        // e_x - i e_y
        (0, 0) => (x + 1.0) * FRAC_1_SQRT_2,
        (0, 1) => (x - 1.0) * FRAC_1_SQRT_2,
        (0, _) => sin_t,
        // e_z
        (1, 0) | (1, 1) => -sin_t * FRAC_1_SQRT_2,
        (1, _) => x,
        // e_x + i e_y
        (_, 0) => (x - 1.0) * FRAC_1_SQRT_2,
        (_, 1) => (x + 1.0) * FRAC_1_SQRT_2,
        (_, _) => sin_t,
    }
}

fn norm(v: &[Complex64]) -> f64 {
    v.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt()
}

/// 计算 `(m, ℓ)` 上阶数为 `rank` 的正则性分解
pub fn regularity_table(m: i32, ell: u32, rank: usize, rank_tol: f64) -> CvResult<RegularityTable> {
    let sig = TensorSig::new(3, rank);
    let ncomp = sig.ncomp();
    let spins: Vec<i32> = (0..ncomp).map(|c| sig.spin(c)).collect();
    let expected = spins.iter().filter(|s| s.unsigned_abs() <= ell).count();

    let quad = gauss_legendre(ell as usize + rank + 8);
    let x = &quad.nodes;
    let nq = x.len();

    // 目标函数 Y^{s(τ)}_ℓm
    let targets: Vec<Vec<f64>> = spins
        .iter()
        .map(|&s| {
            let t = spin_harmonics(m, s, ell, x);
            (0..nq).map(|q| t.value(ell, q)).collect()
        })
        .collect();

    let mut columns: Vec<RegularityColumn> = Vec::with_capacity(expected);
    let k = rank as i32;
    let tuples = 3usize.pow(rank as u32);
    for b in -k..=k {
        let j = ell as i32 + b;
        if j < 0 {
            continue;
        }
        for tuple in 0..tuples {
            let mus = TensorSig::new(3, rank).indices(tuple);
            let shift: i32 = mus.iter().map(|&mu| mu as i32 - 1).sum();
            let big_m = m - shift;
            if big_m.unsigned_abs() > j as u32 {
                continue;
            }
            let y = spin_harmonics(big_m, 0, j as u32, x);
            let mut v = vec![Complex64::new(0.0, 0.0); ncomp];
            for (tau, vt) in v.iter_mut().enumerate() {
                let slots = sig.indices(tau);
                let mut acc = 0.0;
                for q in 0..nq {
                    let mut g = y.value(j as u32, q);
                    for (slot, &mu) in mus.iter().enumerate() {
                        g *= cartesian_spin(mu, slots[slot], x[q]);
                    }
                    acc += quad.weights[q] * targets[tau][q] * g;
                }
                *vt = Complex64::new(acc, 0.0);
            }
            let before = norm(&v);
            if before < 1e-12 {
                continue;
            }
            for col in &columns {
                let proj: Complex64 = col
                    .weights
                    .iter()
                    .zip(&v)
                    .map(|(a, b)| a.conj() * b)
                    .sum();
                for (vi, ci) in v.iter_mut().zip(&col.weights) {
                    *vi -= proj * ci;
                }
            }
            let after = norm(&v);
            if after > rank_tol * before {
                for vi in v.iter_mut() {
                    *vi /= after;
                }
                columns.push(RegularityColumn {
                    lambda: j as u32,
                    b,
                    weights: v,
                });
            }
        }
    }

    if columns.len() != expected {
        log::error!(
            "正则性分解维数不符: m={m}, ell={ell}, rank={rank}, 得到 {} 期望 {expected}",
            columns.len()
        );
        return Err(CvError::internal(format!(
            "正则性分解维数不符 (m={m}, ell={ell}, rank={rank}): {} != {expected}",
            columns.len()
        )));
    }
    log::trace!("正则性分解 m={m} ell={ell} rank={rank}: {} 列", columns.len());
    Ok(RegularityTable { rank, columns })
}
