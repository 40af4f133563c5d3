// crates/cv_spectral/src/quadrature.rs

//! Gauss-Jacobi 求积
//!
//! 节点由 Golub-Welsch 方法（对称三对角 Jacobi 矩阵特征值）给出初值，
//! 再以 Newton 迭代修正；权重采用 Christoffel 公式
//! `w_k = 1 / Σ_j p_j(x_k)²`，因此权重之和为 1（归一化测度）。
//!
//! # 精度
//!
//! `n` 点规则对 `deg ≤ 2n-1` 的多项式（乘以权重）精确。

use crate::jacobi::Jacobi;
use nalgebra::{DMatrix, SymmetricEigen};

/// 一维求积规则
#[derive(Debug, Clone)]
pub struct Quadrature {
    /// 节点（升序）
    pub nodes: Vec<f64>,
    /// 权重
    pub weights: Vec<f64>,
}

impl Quadrature {
    /// 节点数
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 将权重整体缩放（例如从归一化测度换到 `dx`）
    pub fn scaled(mut self, factor: f64) -> Self {
        for w in &mut self.weights {
            *w *= factor;
        }
        self
    }

    /// 对采样值积分
    pub fn integrate(&self, values: &[f64]) -> f64 {
        self.weights.iter().zip(values).map(|(w, v)| w * v).sum()
    }
}

/// `n` 点 Gauss-Jacobi 规则，权重之和为 1
pub fn gauss_jacobi(n: usize, alpha: f64, beta: f64) -> Quadrature {
    if n == 0 {
        return Quadrature {
            nodes: Vec::new(),
            weights: Vec::new(),
        };
    }
    let jac = Jacobi::new(alpha, beta);

    // Golub-Welsch 初值
    let mut j = DMatrix::<f64>::zeros(n, n);
    for k in 0..n {
        j[(k, k)] = jac.b(k);
        if k + 1 < n {
            let a = jac.a(k + 1);
            j[(k, k + 1)] = a;
            j[(k + 1, k)] = a;
        }
    }
    let eig = SymmetricEigen::new(j);
    let mut nodes: Vec<f64> = eig.eigenvalues.iter().copied().collect();
    nodes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    // Newton 修正 p_n(x) = 0
    for x in nodes.iter_mut() {
        for _ in 0..3 {
            let (p, dp) = jac.eval_single(n, *x);
            if dp == 0.0 {
                break;
            }
            let step = p / dp;
            *x -= step;
            if step.abs() < 1e-16 {
                break;
            }
        }
    }

    // Christoffel 权重
    let table = jac.eval(n, &nodes);
    let weights = (0..n)
        .map(|q| {
            let s: f64 = (0..n).map(|k| table.get(k, q).powi(2)).sum();
            1.0 / s
        })
        .collect();

    Quadrature { nodes, weights }
}

/// `n` 点 Gauss-Legendre 规则，权重之和为 2（即 `∫ dx`）
pub fn gauss_legendre(n: usize) -> Quadrature {
    gauss_jacobi(n, 0.0, 0.0).scaled(2.0)
}
