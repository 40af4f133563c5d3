// crates/cv_spectral/src/radial.rs

//! 径向基函数
//!
//! # 球体（Zernike 型）
//!
//! ```text
//! Z^λ_n(r) = (1+z)^{λ/2} p_n^{(0, λ+1/2)}(z) / sqrt(μ_λ),   z = 2(r/R)² - 1
//! μ_λ = 2^λ · (3/2) / (λ + 3/2)
//! ```
//!
//! 关于归一化测度 `(1+z)^{1/2} dz / μ₀`（即 `3 r² dr / R³`）正交归一，
//! 形如 `r^λ · poly(r²)`，在原点正则。
//!
//! # 球壳（Legendre）
//!
//! `P̂_n(ρ)`，`ρ = (2r - R₁ - R₂)/(R₂ - R₁)`，关于 `dρ/2` 正交归一。

use crate::jacobi::{Jacobi, PolyTable};
use crate::quadrature::{gauss_jacobi, Quadrature};

/// 径向基在一组半径上的取值与导数
#[derive(Debug, Clone)]
pub struct RadialTable {
    /// 函数值，行为径向阶数
    pub values: Vec<Vec<f64>>,
    /// `d/dr` 导数值
    pub derivs: Vec<Vec<f64>>,
}

impl RadialTable {
    /// 函数个数
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// 径向基族
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RadialFamily {
    /// 球体 Zernike 型基
    Zernike {
        /// 球半径
        radius: f64,
    },
    /// 球壳 Legendre 基
    Legendre {
        /// 内半径
        inner: f64,
        /// 外半径
        outer: f64,
    },
}

impl RadialFamily {
    /// 正则指数 `λ` 下、分辨率 `nr` 时的径向系数个数
    pub fn mode_count(&self, lambda: u32, nr: usize) -> usize {
        match self {
            Self::Zernike { .. } => {
                let top = 2 * nr as i64 - 2;
                if lambda as i64 > top {
                    0
                } else {
                    ((top - lambda as i64) / 2 + 1) as usize
                }
            }
            Self::Legendre { .. } => nr,
        }
    }

    /// `n` 点径向求积（权重之和为 1）及对应半径
    pub fn quadrature(&self, n: usize) -> (Quadrature, Vec<f64>) {
        match *self {
            Self::Zernike { radius } => {
                let q = gauss_jacobi(n, 0.0, 0.5);
                let r = q.nodes.iter().map(|z| radius * ((1.0 + z) / 2.0).sqrt()).collect();
                (q, r)
            }
            Self::Legendre { inner, outer } => {
                let q = gauss_jacobi(n, 0.0, 0.0);
                let r = q
                    .nodes
                    .iter()
                    .map(|rho| 0.5 * (outer + inner) + 0.5 * (outer - inner) * rho)
                    .collect();
                (q, r)
            }
        }
    }

    /// 归一化求积权重换算到体积分 `∫ (·) r² dr` 的因子（需乘以 `r²` 时返回 true）
    pub fn volume_factor(&self) -> (f64, bool) {
        match *self {
            Self::Zernike { radius } => (radius.powi(3) / 3.0, false),
            Self::Legendre { inner, outer } => (outer - inner, true),
        }
    }

    /// 在半径 `r` 上求 `count` 个基函数（正则指数 `λ`，球壳忽略）
    pub fn eval(&self, lambda: u32, count: usize, r: &[f64]) -> RadialTable {
        match *self {
            Self::Zernike { radius } => zernike(radius, lambda, count, r),
            Self::Legendre { inner, outer } => legendre(inner, outer, count, r),
        }
    }

    /// 半径是否位于定义域内
    pub fn contains(&self, r: f64) -> bool {
        let eps = 1e-12;
        match *self {
            Self::Zernike { radius } => (-eps..=radius * (1.0 + eps)).contains(&r),
            Self::Legendre { inner, outer } => {
                (inner * (1.0 - eps)..=outer * (1.0 + eps)).contains(&r)
            }
        }
    }
}

fn table_rows(t: &PolyTable) -> Vec<Vec<f64>> {
    (0..t.rows()).map(|n| t.row(n).to_vec()).collect()
}

fn zernike(radius: f64, lambda: u32, count: usize, r: &[f64]) -> RadialTable {
    let lam = lambda as f64;
    let jac = Jacobi::new(0.0, lam + 0.5);
    let norm = ((lam + 1.5) / (1.5 * 2f64.powi(lambda as i32))).sqrt();
    let z: Vec<f64> = r.iter().map(|ri| 2.0 * (ri / radius).powi(2) - 1.0).collect();
    let (p, dp) = jac.eval_with_derivative(count, &z);
    let mut values = table_rows(&p);
    let mut derivs = table_rows(&dp);
    for (q, (&zq, &rq)) in z.iter().zip(r).enumerate() {
        let opz = 1.0 + zq;
        let env = opz.powf(lam / 2.0);
        let denv = if lambda == 0 {
            0.0
        } else {
            lam / 2.0 * opz.powf(lam / 2.0 - 1.0)
        };
        let dzdr = 4.0 * rq / (radius * radius);
        for n in 0..count {
            let pn = values[n][q];
            let dpn = derivs[n][q];
            values[n][q] = norm * env * pn;
            derivs[n][q] = norm * dzdr * (denv * pn + env * dpn);
        }
    }
    RadialTable { values, derivs }
}

fn legendre(inner: f64, outer: f64, count: usize, r: &[f64]) -> RadialTable {
    let scale = 2.0 / (outer - inner);
    let rho: Vec<f64> = r.iter().map(|ri| (2.0 * ri - inner - outer) / (outer - inner)).collect();
    let (p, dp) = Jacobi::legendre().eval_with_derivative(count, &rho);
    let values = table_rows(&p);
    let derivs = table_rows(&dp)
        .into_iter()
        .map(|row| row.into_iter().map(|d| d * scale).collect())
        .collect();
    RadialTable { values, derivs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gram(family: RadialFamily, lambda: u32, count: usize, nq: usize) -> Vec<Vec<f64>> {
        let (q, r) = family.quadrature(nq);
        let t = family.eval(lambda, count, &r);
        (0..count)
            .map(|i| {
                (0..count)
                    .map(|j| {
                        let v: Vec<f64> =
                            (0..q.len()).map(|k| t.values[i][k] * t.values[j][k]).collect();
                        q.integrate(&v)
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_zernike_orthonormal() {
        let family = RadialFamily::Zernike { radius: 1.5 };
        for lambda in [0u32, 1, 4] {
            let count = family.mode_count(lambda, 8);
            let g = gram(family, lambda, count, 10);
            for i in 0..count {
                for j in 0..count {
                    let expected = if i == j { 1.0 } else { 0.0 };
                    assert_relative_eq!(g[i][j], expected, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_zernike_leading_power() {
        // Z^λ_0 ∝ r^λ
        let family = RadialFamily::Zernike { radius: 1.0 };
        let t = family.eval(3, 1, &[0.2, 0.4]);
        assert_relative_eq!(t.values[0][0] / t.values[0][1], 0.125, epsilon = 1e-13);
    }

    #[test]
    fn test_zernike_derivative() {
        let family = RadialFamily::Zernike { radius: 1.5 };
        let h = 1e-6;
        let r0 = 0.7;
        let t = family.eval(2, 4, &[r0, r0 + h, r0 - h]);
        for n in 0..4 {
            let fd = (t.values[n][1] - t.values[n][2]) / (2.0 * h);
            assert_relative_eq!(t.derivs[n][0], fd, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_mode_count() {
        let family = RadialFamily::Zernike { radius: 1.0 };
        assert_eq!(family.mode_count(0, 12), 12);
        assert_eq!(family.mode_count(1, 12), 11);
        assert_eq!(family.mode_count(2, 12), 11);
        assert_eq!(family.mode_count(30, 12), 0);
        let shell = RadialFamily::Legendre { inner: 0.5, outer: 1.0 };
        assert_eq!(shell.mode_count(9, 12), 12);
    }

    #[test]
    fn test_shell_orthonormal() {
        let family = RadialFamily::Legendre { inner: 0.5, outer: 1.0 };
        let g = gram(family, 0, 6, 8);
        for i in 0..6 {
            assert_relative_eq!(g[i][i], 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(g[1][4], 0.0, epsilon = 1e-12);
    }
}
