// crates/cv_spectral/src/lu.rs

//! 子问题直接求解器
//!
//! 每个模式组的系统规模较小（几十到几百），采用稠密 LU 分解。
//! 分解结果缓存在求解器对象中，右端项变化时只需回代。
//!
//! # 奇异判定
//!
//! ```text
//! pivot = min_i |U_ii| / max_ij |A_ij|
//! ```
//!
//! 当 `pivot < pivot_tolerance` 时分解失败并返回 [`LuError::Singular`]。

use crate::csr::CsrMatrix;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use std::fmt::Debug;
use thiserror::Error;

/// 直接求解错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LuError {
    /// 主元过小
    #[error("矩阵奇异, 相对主元 {pivot:.3e}")]
    Singular {
        /// 相对主元
        pivot: f64,
    },
    /// 非方阵
    #[error("矩阵非方阵: {rows}x{cols}")]
    NotSquare {
        /// 行数
        rows: usize,
        /// 列数
        cols: usize,
    },
}

/// 分解策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LuStrategy {
    /// 部分选主元
    #[default]
    PartialPivot,
    /// 完全选主元
    FullPivot,
}

/// 已分解的线性系统
pub trait MatrixSolver: Send + Sync + Debug {
    /// 求解器名称
    fn name(&self) -> &'static str;

    /// 系统维数
    fn dim(&self) -> usize;

    /// 相对主元
    fn pivot(&self) -> f64;

    /// 求解 `A x = rhs`
    fn solve(&self, rhs: &[Complex64]) -> Vec<Complex64>;
}

/// 部分选主元稠密 LU
#[derive(Debug, Clone)]
pub struct DenseLu {
    lu: nalgebra::LU<Complex64, nalgebra::Dyn, nalgebra::Dyn>,
    dim: usize,
    pivot: f64,
}

/// 完全选主元稠密 LU
#[derive(Debug, Clone)]
pub struct DenseFullPivLu {
    lu: nalgebra::FullPivLU<Complex64, nalgebra::Dyn, nalgebra::Dyn>,
    dim: usize,
    pivot: f64,
}

fn check_square(a: &CsrMatrix<Complex64>) -> Result<(), LuError> {
    if a.n_rows() != a.n_cols() {
        return Err(LuError::NotSquare {
            rows: a.n_rows(),
            cols: a.n_cols(),
        });
    }
    Ok(())
}

fn relative_pivot(u: &DMatrix<Complex64>, scale: f64) -> f64 {
    let n = u.nrows().min(u.ncols());
    if n == 0 {
        return 1.0;
    }
    let min_diag = (0..n).map(|i| u[(i, i)].norm()).fold(f64::INFINITY, f64::min);
    if scale > 0.0 {
        min_diag / scale
    } else {
        0.0
    }
}

impl DenseLu {
    /// 分解矩阵
    pub fn factorize(a: &CsrMatrix<Complex64>, pivot_tolerance: f64) -> Result<Self, LuError> {
        check_square(a)?;
        let dim = a.n_rows();
        let lu = a.to_dense().lu();
        let pivot = relative_pivot(&lu.u(), a.max_abs());
        if dim > 0 && pivot < pivot_tolerance {
            return Err(LuError::Singular { pivot });
        }
        Ok(Self { lu, dim, pivot })
    }
}

impl MatrixSolver for DenseLu {
    fn name(&self) -> &'static str {
        "DenseLu"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn pivot(&self) -> f64 {
        self.pivot
    }

    fn solve(&self, rhs: &[Complex64]) -> Vec<Complex64> {
        if self.dim == 0 {
            return Vec::new();
        }
        let b = DVector::from_column_slice(rhs);
        self.lu
            .solve(&b)
            .map(|x| x.iter().copied().collect())
            .unwrap_or_else(|| vec![Complex64::new(f64::NAN, f64::NAN); self.dim])
    }
}

impl DenseFullPivLu {
    /// 分解矩阵
    pub fn factorize(a: &CsrMatrix<Complex64>, pivot_tolerance: f64) -> Result<Self, LuError> {
        check_square(a)?;
        let dim = a.n_rows();
        let lu = a.to_dense().full_piv_lu();
        let pivot = relative_pivot(&lu.u(), a.max_abs());
        if dim > 0 && pivot < pivot_tolerance {
            return Err(LuError::Singular { pivot });
        }
        Ok(Self { lu, dim, pivot })
    }
}

impl MatrixSolver for DenseFullPivLu {
    fn name(&self) -> &'static str {
        "DenseFullPivLu"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn pivot(&self) -> f64 {
        self.pivot
    }

    fn solve(&self, rhs: &[Complex64]) -> Vec<Complex64> {
        if self.dim == 0 {
            return Vec::new();
        }
        let b = DVector::from_column_slice(rhs);
        self.lu
            .solve(&b)
            .map(|x| x.iter().copied().collect())
            .unwrap_or_else(|| vec![Complex64::new(f64::NAN, f64::NAN); self.dim])
    }
}

/// 按策略分解
pub fn factorize(
    a: &CsrMatrix<Complex64>,
    strategy: LuStrategy,
    pivot_tolerance: f64,
) -> Result<Box<dyn MatrixSolver>, LuError> {
    Ok(match strategy {
        LuStrategy::PartialPivot => Box::new(DenseLu::factorize(a, pivot_tolerance)?),
        LuStrategy::FullPivot => Box::new(DenseFullPivLu::factorize(a, pivot_tolerance)?),
    })
}
