// crates/cv_spectral/src/harmonics.rs

//! 自旋加权球谐函数的 θ 部分
//!
//! 对方位阶数 `m`、自旋 `s`、角度阶数 `ℓ ≥ max(|m|, |s|)`：
//!
//! ```text
//! Y^s_ℓm(x) = (1-x)^{α/2} (1+x)^{β/2} P̂_n^{(α,β)}(x),   x = cos θ
//! α = |m - s|,  β = |m + s|,  n = ℓ - max(|m|, |s|)
//! ```
//!
//! 关于 `dx`（[-1, 1]）正交归一。完整的角向函数为 `e^{imφ} Y^s_ℓm(cos θ)`。
//!
//! # 升降算子
//!
//! ```text
//! R_s = ∂_θ + (m - s cos θ)/sin θ     (s → s+1)
//! L_s = ∂_θ - (m - s cos θ)/sin θ     (s → s-1)
//! ```
//!
//! 二者保持 `ℓ` 不变；系数 `κ^±` 通过 Gauss-Legendre 投影数值求得，
//! 因而与相位约定无关。

use crate::jacobi::{integer_mass, Jacobi};
use crate::quadrature::{gauss_legendre, Quadrature};

/// 自旋为 `s` 的分量在阶数 `ℓ` 是否存在
#[inline]
pub fn spin_mode_exists(ell: u32, m: i32, s: i32) -> bool {
    ell >= m.unsigned_abs().max(s.unsigned_abs())
}

/// 固定 `(m, s)` 下 `ℓ = ℓ_min ..= ℓ_max` 的函数表
#[derive(Debug, Clone)]
pub struct SpinTable {
    ell_min: u32,
    count: usize,
    points: usize,
    values: Vec<f64>,
    dtheta: Vec<f64>,
}

impl SpinTable {
    /// 最小角度阶数
    #[inline]
    pub fn ell_min(&self) -> u32 {
        self.ell_min
    }

    /// 是否包含阶数 `ell`
    #[inline]
    pub fn contains(&self, ell: u32) -> bool {
        ell >= self.ell_min && ((ell - self.ell_min) as usize) < self.count
    }

    /// `Y^s_ℓm` 在第 `q` 个点的值（不存在的阶数返回 0）
    #[inline]
    pub fn value(&self, ell: u32, q: usize) -> f64 {
        if !self.contains(ell) {
            return 0.0;
        }
        self.values[(ell - self.ell_min) as usize * self.points + q]
    }

    /// `∂_θ Y^s_ℓm` 在第 `q` 个点的值
    #[inline]
    pub fn dtheta(&self, ell: u32, q: usize) -> f64 {
        if !self.contains(ell) {
            return 0.0;
        }
        self.dtheta[(ell - self.ell_min) as usize * self.points + q]
    }

    /// 阶数 `ell` 的全部取值
    pub fn row(&self, ell: u32) -> Option<&[f64]> {
        if !self.contains(ell) {
            return None;
        }
        let k = (ell - self.ell_min) as usize;
        Some(&self.values[k * self.points..(k + 1) * self.points])
    }
}

/// 在 `x = cos θ` 点上求 `Y^s_ℓm`, `ℓ ≤ ell_max`
pub fn spin_harmonics(m: i32, s: i32, ell_max: u32, x: &[f64]) -> SpinTable {
    let ell_min = m.unsigned_abs().max(s.unsigned_abs());
    let count = if ell_max >= ell_min {
        (ell_max - ell_min + 1) as usize
    } else {
        0
    };
    let a = (m - s).unsigned_abs();
    let b = (m + s).unsigned_abs();
    let jac = Jacobi::new(a as f64, b as f64);
    let norm = 1.0 / integer_mass(a, b).sqrt();
    let (p, dp) = jac.eval_with_derivative(count, x);

    let points = x.len();
    let mut values = vec![0.0; count * points];
    let mut dtheta = vec![0.0; count * points];
    for (q, &xq) in x.iter().enumerate() {
        let om = 1.0 - xq;
        let op = 1.0 + xq;
        let env = om.powf(a as f64 / 2.0) * op.powf(b as f64 / 2.0) * norm;
        let log_deriv = -(a as f64) / (2.0 * om) + b as f64 / (2.0 * op);
        let sin_theta = (om * op).sqrt();
        for k in 0..count {
            let pk = p.get(k, q);
            values[k * points + q] = env * pk;
            let ddx = env * (pk * log_deriv + dp.get(k, q));
            dtheta[k * points + q] = -sin_theta * ddx;
        }
    }

    SpinTable {
        ell_min,
        count,
        points,
        values,
        dtheta,
    }
}

/// 升降算子系数表
///
/// 持有一个足够精确的 Gauss-Legendre 规则，按需计算 `κ^±_s(ℓ, m)`。
#[derive(Debug, Clone)]
pub struct SpinLadder {
    quad: Quadrature,
}

impl SpinLadder {
    /// 支持 `ℓ ≤ ell_max` 的系数表
    pub fn new(ell_max: u32) -> Self {
        Self {
            quad: gauss_legendre(ell_max as usize + 2),
        }
    }

    fn project(&self, m: i32, s: i32, ell: u32, delta: i32) -> f64 {
        let target = s + delta;
        if !spin_mode_exists(ell, m, s) || !spin_mode_exists(ell, m, target) {
            return 0.0;
        }
        let x = &self.quad.nodes;
        let src = spin_harmonics(m, s, ell, x);
        let dst = spin_harmonics(m, target, ell, x);
        let sign = delta as f64;
        let mut acc = 0.0;
        for (q, (&xq, &w)) in x.iter().zip(&self.quad.weights).enumerate() {
            let sin_theta = (1.0 - xq * xq).sqrt();
            let coupling = (m as f64 - s as f64 * xq) / sin_theta;
            let applied = src.dtheta(ell, q) + sign * coupling * src.value(ell, q);
            acc += w * dst.value(ell, q) * applied;
        }
        acc
    }

    /// `R_s Y^s_ℓm = κ^+ Y^{s+1}_ℓm`
    pub fn raise(&self, m: i32, s: i32, ell: u32) -> f64 {
        self.project(m, s, ell, 1)
    }

    /// `L_s Y^s_ℓm = κ^- Y^{s-1}_ℓm`
    pub fn lower(&self, m: i32, s: i32, ell: u32) -> f64 {
        self.project(m, s, ell, -1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_orthonormal() {
        let q = gauss_legendre(12);
        for &(m, s) in &[(0, 0), (2, 1), (-3, 1), (1, -2)] {
            let t = spin_harmonics(m, s, 8, &q.nodes);
            let lmin = t.ell_min();
            for l1 in lmin..=8 {
                for l2 in lmin..=8 {
                    let v: Vec<f64> = (0..q.len()).map(|i| t.value(l1, i) * t.value(l2, i)).collect();
                    let expected = if l1 == l2 { 1.0 } else { 0.0 };
                    assert_relative_eq!(q.integrate(&v), expected, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_y00_constant() {
        let t = spin_harmonics(0, 0, 0, &[0.3, -0.5]);
        assert_relative_eq!(t.value(0, 0), 1.0 / 2f64.sqrt(), epsilon = 1e-15);
        assert_relative_eq!(t.value(0, 1), 1.0 / 2f64.sqrt(), epsilon = 1e-15);
    }

    #[test]
    fn test_ladder_composes_to_laplacian() {
        let ladder = SpinLadder::new(8);
        for ell in 1..=6u32 {
            for m in -(ell as i32)..=(ell as i32) {
                let down_up = ladder.raise(m, -1, ell) * ladder.lower(m, 0, ell);
                let up_down = ladder.lower(m, 1, ell) * ladder.raise(m, 0, ell);
                let expected = -((ell * (ell + 1)) as f64);
                assert_relative_eq!(down_up, expected, epsilon = 1e-10);
                assert_relative_eq!(up_down, expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_ladder_magnitude() {
        let ladder = SpinLadder::new(6);
        let ell = 4u32;
        let k = ladder.raise(1, 1, ell);
        // |κ^+_s| = sqrt((ℓ - s)(ℓ + s + 1))
        assert_relative_eq!(k.abs(), ((3 * 6) as f64).sqrt(), epsilon = 1e-10);
        assert_eq!(ladder.raise(0, 4, 4), 0.0);
    }
}
