// crates/cv_spectral/src/fourier.rs

//! 方位向 Fourier 变换
//!
//! 约定：`g(φ_j) = Σ_m c_m e^{imφ_j}`，`φ_j = 2πj/N`，
//! 正变换 `c_m = (1/N) Σ_j g_j e^{-imφ_j}`。
//! 负阶数 `m` 存放在 FFT 的 `m mod N` 频点。

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// 长度固定的方位向变换
#[derive(Clone)]
pub struct AzimuthalTransform {
    n: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for AzimuthalTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzimuthalTransform").field("n", &self.n).finish()
    }
}

impl AzimuthalTransform {
    /// 创建长度为 `n` 的变换
    pub fn new(n: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self {
            n,
            forward: planner.plan_fft_forward(n),
            inverse: planner.plan_fft_inverse(n),
        }
    }

    /// 网格点数
    #[inline]
    pub fn len(&self) -> usize {
        self.n
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// 阶数 `m` 对应的频点
    #[inline]
    pub fn bin(&self, m: i32) -> usize {
        m.rem_euclid(self.n as i32) as usize
    }

    /// 网格点 `φ_j`
    pub fn grid(&self) -> Vec<f64> {
        (0..self.n)
            .map(|j| 2.0 * std::f64::consts::PI * j as f64 / self.n as f64)
            .collect()
    }

    /// 原地正变换（含 `1/N` 归一化）
    pub fn forward(&self, line: &mut [Complex64]) {
        debug_assert_eq!(line.len(), self.n);
        self.forward.process(line);
        let scale = 1.0 / self.n as f64;
        for v in line.iter_mut() {
            *v *= scale;
        }
    }

    /// 原地逆变换
    pub fn backward(&self, line: &mut [Complex64]) {
        debug_assert_eq!(line.len(), self.n);
        self.inverse.process(line);
    }
}
