// crates/cv_spectral/src/lib.rs

//! curvispec Spectral Kernel Layer (Layer 2)
//!
//! 与几何无关的谱方法数值核：
//!
//! - [`jacobi`]: Jacobi 多项式三项递推
//! - [`quadrature`]: Gauss-Jacobi / Gauss-Legendre 求积
//! - [`harmonics`]: 自旋加权球谐函数及升降算子系数
//! - [`radial`]: 球体 Zernike 型与球壳 Legendre 径向基
//! - [`fourier`]: 方位向 FFT
//! - [`tensor`]: 自旋/物理标架下的张量分量代数
//! - [`csr`]: 实数与复数 CSR 稀疏矩阵
//! - [`lu`]: 子问题稠密 LU 直接求解
//!
//! # 特性开关
//!
//! - `parallel`: 并行矩阵-向量乘法

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod csr;
pub mod fourier;
pub mod harmonics;
pub mod jacobi;
pub mod lu;
pub mod quadrature;
pub mod radial;
pub mod tensor;

/// 层级标识
pub const LAYER: u8 = 2;

pub use csr::{CsrBuilder, CsrMatrix, CsrMatrixC64, CsrTriplets, SparseScalar};
pub use fourier::AzimuthalTransform;
pub use harmonics::{spin_harmonics, spin_mode_exists, SpinLadder, SpinTable};
pub use lu::{factorize, DenseFullPivLu, DenseLu, LuError, LuStrategy, MatrixSolver};
pub use quadrature::{gauss_jacobi, gauss_legendre, Quadrature};
pub use radial::{RadialFamily, RadialTable};
pub use tensor::{Bilinear, Frame, TensorSig};

/// Prelude 模块
pub mod prelude {
    pub use crate::csr::{CsrBuilder, CsrMatrix, CsrMatrixC64};
    pub use crate::lu::{LuStrategy, MatrixSolver};
    pub use crate::radial::RadialFamily;
    pub use crate::tensor::{Bilinear, Frame, TensorSig};
}
