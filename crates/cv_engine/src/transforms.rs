// crates/cv_engine/src/transforms.rs

//! 网格 ↔ 系数变换
//!
//! 正变换依次为：φ 方向 FFT（`1/N` 归一化）→ 物理分量转自旋分量 →
//! θ 方向 Gauss-Legendre 投影到 `Y^s_ℓm` → 球体上乘 `Q^†` → 径向投影。
//! 逆变换按相反顺序合成。带限输入下二者互为精确逆。
//!
//! 网格数组形状为 `[ncomp, Nφ_s, Nθ_s, Nr_s]`，分量为物理标架。

use crate::basis::{Basis, RadialGrid, Scales};
use crate::layout::FieldLayout;
use cv_foundation::{ensure, CvError, CvResult};
use cv_spectral::fourier::AzimuthalTransform;
use cv_spectral::harmonics::{spin_harmonics, SpinTable};
use cv_spectral::quadrature::gauss_legendre;
use cv_spectral::radial::RadialTable;
use cv_spectral::tensor::{self, TensorSig};
use ndarray::{Array4, Axis};
use num_complex::Complex64;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

const ZERO: Complex64 = Complex64 { re: 0.0, im: 0.0 };

/// 某一网格尺寸下的变换计划
pub struct TransformPlan {
    shape: [usize; 3],
    has_theta: bool,
    ell_max: u32,
    fft: AzimuthalTransform,
    theta_nodes: Vec<f64>,
    theta_weights: Vec<f64>,
    radial: Arc<RadialGrid>,
    harmonics: RwLock<HashMap<(i32, i32), Arc<SpinTable>>>,
    radial_tables: RwLock<HashMap<(u32, usize), Arc<RadialTable>>>,
}

impl std::fmt::Debug for TransformPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPlan").field("shape", &self.shape).finish()
    }
}

impl TransformPlan {
    /// 创建计划
    pub fn new(basis: &Basis, shape: [usize; 3]) -> Self {
        let has_theta = basis.geometry().has_theta();
        let (theta_nodes, theta_weights) = if has_theta {
            let q = gauss_legendre(shape[1]);
            (q.nodes, q.weights)
        } else {
            (vec![0.0], vec![1.0])
        };
        Self {
            shape,
            has_theta,
            ell_max: basis.ell_max(),
            fft: AzimuthalTransform::new(shape[0]),
            theta_nodes,
            theta_weights,
            radial: basis.radial_grid(shape[2]),
            harmonics: RwLock::new(HashMap::new()),
            radial_tables: RwLock::new(HashMap::new()),
        }
    }

    /// 网格尺寸
    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// θ 方向权重（`∫ dx`）
    #[inline]
    pub fn theta_weights(&self) -> &[f64] {
        &self.theta_weights
    }

    /// 径向网格
    #[inline]
    pub fn radial(&self) -> &RadialGrid {
        &self.radial
    }

    /// φ 网格
    pub fn phi_grid(&self) -> Vec<f64> {
        self.fft.grid()
    }

    /// θ 网格（圆周上为 π/2）
    pub fn theta_grid(&self) -> Vec<f64> {
        self.theta_nodes.iter().map(|x| x.acos()).collect()
    }

    /// 径向网格点
    pub fn r_grid(&self) -> Vec<f64> {
        self.radial.r.clone()
    }

    fn harmonic(&self, m: i32, s: i32) -> Arc<SpinTable> {
        if let Some(t) = self.harmonics.read().get(&(m, s)) {
            return t.clone();
        }
        let t = Arc::new(spin_harmonics(m, s, self.ell_max, &self.theta_nodes));
        self.harmonics.write().entry((m, s)).or_insert(t).clone()
    }

    fn radial_table(&self, lambda: u32, count: usize) -> Arc<RadialTable> {
        if let Some(t) = self.radial_tables.read().get(&(lambda, count)) {
            return t.clone();
        }
        let t = Arc::new(self.radial.eval(lambda, count));
        self.radial_tables
            .write()
            .entry((lambda, count))
            .or_insert(t)
            .clone()
    }

    /// `Y^s_ℓm(x_j)`（圆周上恒为 1）
    #[inline]
    fn y(&self, table: &SpinTable, ell: u32, j: usize) -> f64 {
        if self.has_theta {
            table.value(ell, j)
        } else {
            1.0
        }
    }
}

/// 物理分量个数
fn phys_ncomp(sig: TensorSig) -> usize {
    sig.ncomp()
}

/// 将 φ 方向已变换的数组在某个 `m` 上转为自旋分量 `[τ][j][k]`
fn spin_slice(spectrum: &Array4<Complex64>, sig: TensorSig, bin: usize) -> Vec<Vec<Complex64>> {
    let (ncomp, _, nth, nr) = spectrum.dim();
    let mut out = vec![vec![ZERO; nth * nr]; ncomp];
    let mut phys = vec![ZERO; ncomp];
    for j in 0..nth {
        for k in 0..nr {
            for (p, v) in phys.iter_mut().enumerate() {
                *v = spectrum[[p, bin, j, k]];
            }
            let spin = tensor::to_spin(sig, &phys);
            for (t, v) in spin.into_iter().enumerate() {
                out[t][j * nr + k] = v;
            }
        }
    }
    out
}

fn fft_axis(plan: &TransformPlan, data: &mut Array4<Complex64>, forward: bool) {
    let mut line = vec![ZERO; plan.shape[0]];
    for mut lane in data.lanes_mut(Axis(1)) {
        for (dst, src) in line.iter_mut().zip(lane.iter()) {
            *dst = *src;
        }
        if forward {
            plan.fft.forward(&mut line);
        } else {
            plan.fft.backward(&mut line);
        }
        for (dst, src) in lane.iter_mut().zip(&line) {
            *dst = *src;
        }
    }
}

impl Basis {
    /// 网格 → 系数
    pub fn forward(
        &self,
        grid: &Array4<Complex64>,
        layout: &FieldLayout,
        scales: Scales,
    ) -> CvResult<Vec<Complex64>> {
        let plan = self.plan(scales)?;
        let sig = layout.sig;
        let [nphi, nth, nr] = plan.shape;
        ensure!(
            grid.dim() == (phys_ncomp(sig), nphi, nth, nr),
            CvError::configuration(format!(
                "网格形状 {:?} 与期望 {:?} 不符",
                grid.dim(),
                (phys_ncomp(sig), nphi, nth, nr)
            ))
        );
        let mut spectrum = grid.clone();
        fft_axis(&plan, &mut spectrum, true);

        let mut coeffs = vec![ZERO; layout.size()];
        let mut cached_m: Option<(i32, Vec<Vec<Complex64>>)> = None;
        let mut offset = 0;
        for block in layout.blocks() {
            let key = block.key;
            if cached_m.as_ref().map(|(m, _)| *m) != Some(key.m) {
                cached_m = Some((key.m, spin_slice(&spectrum, sig, plan.fft.bin(key.m))));
            }
            let Some((_, spins)) = cached_m.as_ref() else {
                continue;
            };
            for col in &block.columns {
                // b_c(k) = Σ_τ conj(Q) Σ_j w_j Y_j S_τ(j, k)
                let mut profile = vec![ZERO; nr];
                for &(tau, q) in &col.spins {
                    let s = sig.spin(tau);
                    let ytab = plan.harmonic(key.m, s);
                    for j in 0..nth {
                        let yw = plan.theta_weights[j] * plan.y(&ytab, key.ell, j);
                        if yw == 0.0 {
                            continue;
                        }
                        let c = q.conj() * yw;
                        for (k, p) in profile.iter_mut().enumerate() {
                            *p += c * spins[tau][j * nr + k];
                        }
                    }
                }
                let rt = plan.radial_table(col.lambda, col.count);
                for n in 0..col.count {
                    let mut acc = ZERO;
                    for (k, p) in profile.iter().enumerate() {
                        acc += p * (plan.radial.weights[k] * rt.values[n][k]);
                    }
                    coeffs[offset + col.offset + n] = acc;
                }
            }
            offset += block.size;
        }
        Ok(coeffs)
    }

    /// 系数 → 网格
    pub fn backward(
        &self,
        coeffs: &[Complex64],
        layout: &FieldLayout,
        scales: Scales,
    ) -> CvResult<Array4<Complex64>> {
        CvError::check_size("coefficients", layout.size(), coeffs.len())?;
        let plan = self.plan(scales)?;
        let sig = layout.sig;
        let ncomp = sig.ncomp();
        let [nphi, nth, nr] = plan.shape;
        let mut spectrum = Array4::<Complex64>::zeros((ncomp, nphi, nth, nr));

        // 按 m 累加自旋分量，再整体转换到物理标架
        let mut spins: Vec<Vec<Complex64>> = vec![vec![ZERO; nth * nr]; ncomp];
        let mut current_m: Option<i32> = None;
        let flush = |m: i32, spins: &mut Vec<Vec<Complex64>>, spectrum: &mut Array4<Complex64>| {
            let bin = plan.fft.bin(m);
            let mut sv = vec![ZERO; ncomp];
            for j in 0..nth {
                for k in 0..nr {
                    for (t, v) in sv.iter_mut().enumerate() {
                        *v = spins[t][j * nr + k];
                    }
                    let phys = tensor::to_physical(sig, &sv);
                    for (p, v) in phys.into_iter().enumerate() {
                        spectrum[[p, bin, j, k]] += v;
                    }
                }
            }
            for s in spins.iter_mut() {
                s.iter_mut().for_each(|v| *v = ZERO);
            }
        };

        let mut offset = 0;
        for block in layout.blocks() {
            let key = block.key;
            if current_m != Some(key.m) {
                if let Some(m) = current_m {
                    flush(m, &mut spins, &mut spectrum);
                }
                current_m = Some(key.m);
            }
            for col in &block.columns {
                let rt = plan.radial_table(col.lambda, col.count);
                let mut profile = vec![ZERO; nr];
                for n in 0..col.count {
                    let c = coeffs[offset + col.offset + n];
                    if c == ZERO {
                        continue;
                    }
                    for (k, p) in profile.iter_mut().enumerate() {
                        *p += c * rt.values[n][k];
                    }
                }
                for &(tau, q) in &col.spins {
                    let s = sig.spin(tau);
                    let ytab = plan.harmonic(key.m, s);
                    for j in 0..nth {
                        let y = plan.y(&ytab, key.ell, j);
                        if y == 0.0 {
                            continue;
                        }
                        for (k, p) in profile.iter().enumerate() {
                            spins[tau][j * nr + k] += q * y * p;
                        }
                    }
                }
            }
            offset += block.size;
        }
        if let Some(m) = current_m {
            flush(m, &mut spins, &mut spectrum);
        }
        fft_axis(&plan, &mut spectrum, false);
        Ok(spectrum)
    }

    /// 网格坐标 `(φ, θ, r)`
    pub fn grids(&self, scales: Scales) -> CvResult<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        let plan = self.plan(scales)?;
        Ok((plan.phi_grid(), plan.theta_grid(), plan.r_grid()))
    }
}
