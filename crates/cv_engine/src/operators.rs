// crates/cv_engine/src/operators.rs

//! 逐模式线性算子矩阵
//!
//! 所有微分与分量算子在模式组 `(m, ℓ)` 上是块对角的。矩阵以数值投影构建：
//!
//! 1. 对输入块的每一列 `(c, n)`，在算子网格上生成自旋分量剖面
//!    `Q[τ, c] · Z_n(r)` 及其径向导数；
//! 2. 在每个半径上逐点施加算子（角向部分由升降系数 `κ^±` 解析给出）；
//! 3. 用 `Q_out^†` 与输出径向基投影（归一化求积权重），删去可忽略元素。
//!
//! # 梯度（导数指标在前）
//!
//! ```text
//! (∇T)_{0,τ}  = ∂_r T_τ
//! (∇T)_{±,τ'} = (1/r) [ κ^±_{s(τ')} T_{τ'} / √2 + 联络项 ]
//! ```
//!
//! 联络项来自 `e_±`、`e_r` 的方向导数：`+` 分量中，某指标为 `+` 的输入
//! 以系数 `-1` 流向该指标为 `0` 的输出，指标为 `0` 的输入以 `+1` 流向该指标为 `-` 的输出；
//! `-` 分量对称。球面（二维分量）只有 `κ` 项，圆周为 `i m / a`。
//!
//! 球体上结果精确；球壳上含 `1/r` 的算子为截断投影。

use crate::basis::{Basis, RadialGrid};
use crate::coords::Geometry;
use crate::layout::BlockLayout;
use cv_foundation::{ensure, CvError, CvResult, ModeKey};
use cv_spectral::csr::{CsrBuilder, CsrMatrixC64};
use cv_spectral::tensor::{contract, cross_basis, Frame, TensorSig};
use num_complex::Complex64;
use std::f64::consts::FRAC_1_SQRT_2;
use std::sync::Arc;

const ZERO: Complex64 = Complex64 { re: 0.0, im: 0.0 };

/// 自旋标架中的指标
const MINUS: usize = 0;
const PLUS: usize = 1;
const RADIAL: usize = 2;

// =============================================================================
// 算子描述
// =============================================================================

/// 逐模式线性算子
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinearOp {
    /// 梯度
    Gradient,
    /// 散度
    Divergence,
    /// 旋度
    Curl,
    /// 拉普拉斯
    Laplacian,
    /// 切向 90° 旋转（二维球面向量）
    Skew,
    /// 前两个指标的迹
    Trace,
    /// 第一个指标的径向分量
    RadialComponent,
    /// 球面三维向量的切向部分
    AngularComponent,
    /// 在半径 `r` 处取值
    Interpolate(f64),
    /// 把边界球面上的量提升到体基的第 `n` 个径向模式（负数从末尾计）
    Lift(i32),
}

/// 缓存用的算子种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    /// 梯度
    Gradient,
    /// 散度
    Divergence,
    /// 旋度
    Curl,
    /// 拉普拉斯
    Laplacian,
    /// 旋转
    Skew,
    /// 迹
    Trace,
    /// 径向分量
    Radial,
    /// 切向分量
    Angular,
    /// 插值
    Interpolate,
    /// 提升
    Lift,
}

/// 算子矩阵缓存键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperatorKey {
    /// 种类
    pub kind: OperatorKind,
    /// 输入分量维数
    pub dim: usize,
    /// 输入阶数
    pub rank: usize,
    /// 模式
    pub mode: ModeKey,
    /// 参数（半径的位模式或提升序号）
    pub param: u64,
}

impl LinearOp {
    fn kind(&self) -> OperatorKind {
        match self {
            Self::Gradient => OperatorKind::Gradient,
            Self::Divergence => OperatorKind::Divergence,
            Self::Curl => OperatorKind::Curl,
            Self::Laplacian => OperatorKind::Laplacian,
            Self::Skew => OperatorKind::Skew,
            Self::Trace => OperatorKind::Trace,
            Self::RadialComponent => OperatorKind::Radial,
            Self::AngularComponent => OperatorKind::Angular,
            Self::Interpolate(_) => OperatorKind::Interpolate,
            Self::Lift(_) => OperatorKind::Lift,
        }
    }

    fn param(&self) -> u64 {
        match *self {
            Self::Interpolate(r) => r.to_bits(),
            Self::Lift(n) => n as i64 as u64,
            _ => 0,
        }
    }

    /// 名称（用于错误信息）
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gradient => "grad",
            Self::Divergence => "div",
            Self::Curl => "curl",
            Self::Laplacian => "lap",
            Self::Skew => "skew",
            Self::Trace => "trace",
            Self::RadialComponent => "radial",
            Self::AngularComponent => "angular",
            Self::Interpolate(_) => "interp",
            Self::Lift(_) => "lift",
        }
    }

    /// 校验并给出结果的张量形状
    ///
    /// `source` 为操作数所在的基，`target` 为结果所在的基。
    pub fn output_sig(&self, source: &Basis, target: &Basis, sig: TensorSig) -> CvResult<TensorSig> {
        let geo = source.geometry();
        let sig = source.normalize_sig(sig);
        let fail = |why: &str| {
            CvError::configuration(format!("{} 不适用于 {geo} 上 dim={} rank={} 的量: {why}", self.name(), sig.dim, sig.rank))
        };
        let out = match self {
            Self::Gradient | Self::Laplacian => {
                ensure!(
                    !(matches!(geo, Geometry::Sphere { .. }) && sig.dim == 3 && sig.rank > 0),
                    fail("球面三维分量不支持微分")
                );
                let rank = if *self == Self::Gradient { sig.rank + 1 } else { sig.rank };
                TensorSig::new(sig.dim, rank)
            }
            Self::Divergence => {
                ensure!(sig.rank >= 1, fail("需要阶数 ≥ 1"));
                ensure!(
                    !(matches!(geo, Geometry::Sphere { .. }) && sig.dim == 3),
                    fail("球面三维分量不支持微分")
                );
                TensorSig::new(sig.dim, sig.rank - 1)
            }
            Self::Curl => {
                ensure!(sig.rank == 1 && sig.dim == 3 && geo.has_radius(), fail("需要体基上的三维向量"));
                sig
            }
            Self::Skew => {
                ensure!(sig.rank == 1 && sig.dim == 2, fail("需要二维向量"));
                sig
            }
            Self::Trace => {
                ensure!(sig.rank >= 2, fail("需要阶数 ≥ 2"));
                TensorSig::new(sig.dim, sig.rank - 2)
            }
            Self::RadialComponent => {
                ensure!(sig.rank >= 1 && sig.dim == 3, fail("需要三维分量"));
                TensorSig::new(3, sig.rank - 1)
            }
            Self::AngularComponent => {
                ensure!(
                    matches!(geo, Geometry::Sphere { .. }) && sig.rank == 1 && sig.dim == 3,
                    fail("需要球面上的三维向量")
                );
                TensorSig::new(2, 1)
            }
            Self::Interpolate(r) => {
                ensure!(geo.has_radius(), fail("需要体基"));
                ensure!(geo.contains_radius(*r), fail("半径超出定义域"));
                TensorSig::new(3, sig.rank)
            }
            Self::Lift(_) => {
                ensure!(
                    matches!(geo, Geometry::Sphere { .. }) && target.geometry().has_radius(),
                    fail("需要从球面提升到体基")
                );
                ensure!(source.same_angular(target) || same_angular_modes(source, target), fail("角向分辨率不一致"));
                ensure!(sig.rank == 0 || sig.dim == 3, fail("需要三维分量"));
                TensorSig::new(3, sig.rank)
            }
        };
        let out = target.normalize_sig(out);
        target.check_dim(out.dim)?;
        Ok(out)
    }
}

fn same_angular_modes(a: &Basis, b: &Basis) -> bool {
    a.shape()[0] == b.shape()[0] && a.shape()[1] == b.shape()[1]
}

fn block_for(basis: &Basis, sig: TensorSig, key: ModeKey) -> CvResult<Arc<BlockLayout>> {
    basis.block(basis.normalize_sig(sig), key)
}

// =============================================================================
// 入口
// =============================================================================

/// 算子在模式 `key` 上的矩阵（输出块 × 输入块）
pub fn operator_matrix(
    op: LinearOp,
    source: &Basis,
    target: &Basis,
    sig: TensorSig,
    key: ModeKey,
) -> CvResult<Arc<CsrMatrixC64>> {
    let sig = source.normalize_sig(sig);
    let out_sig = op.output_sig(source, target, sig)?;
    let cache_key = OperatorKey {
        kind: op.kind(),
        dim: sig.dim,
        rank: sig.rank,
        mode: key,
        param: op.param(),
    };
    let cache_owner = if matches!(op, LinearOp::Lift(_)) { target } else { source };
    cache_owner.operator_or_insert(cache_key, || {
        let matrix = build_matrix(op, source, target, sig, out_sig, key)?;
        log::trace!(
            "构建算子 {} {key}: {}x{} nnz={}",
            op.name(),
            matrix.n_rows(),
            matrix.n_cols(),
            matrix.nnz()
        );
        Ok(matrix)
    })
}

fn build_matrix(
    op: LinearOp,
    source: &Basis,
    target: &Basis,
    sig: TensorSig,
    out_sig: TensorSig,
    key: ModeKey,
) -> CvResult<CsrMatrixC64> {
    let in_block = block_for(source, sig, key)?;
    match op {
        LinearOp::Laplacian => {
            let grad = operator_matrix(LinearOp::Gradient, source, source, sig, key)?;
            let grad_sig = LinearOp::Gradient.output_sig(source, source, sig)?;
            let div = operator_matrix(LinearOp::Divergence, source, source, grad_sig, key)?;
            Ok(div.matmul(&grad).pruned(source.tolerance().entry))
        }
        LinearOp::Interpolate(r) => {
            let out_block = block_for(target, out_sig, key)?;
            Ok(interpolate(source, &in_block, &out_block, r))
        }
        LinearOp::Lift(n) => {
            let out_block = block_for(target, out_sig, key)?;
            Ok(lift(&in_block, &out_block, n))
        }
        _ => {
            let out_block = block_for(target, out_sig, key)?;
            let grid = source.operator_grid();
            let geo = source.geometry();
            let ladder = Ladder { basis: source, key };
            let in_sig = sig;
            let apply = |p: &Profiles| -> CvResult<Vec<Vec<Complex64>>> {
                match op {
                    LinearOp::Gradient => Ok(gradient(geo, &ladder, in_sig, p)),
                    LinearOp::Divergence => {
                        let g = gradient(geo, &ladder, in_sig, p);
                        let g_sig = TensorSig::new(in_sig.dim, in_sig.rank + 1);
                        pointwise(&g, |v| contract(Frame::Spin, g_sig, v, 0, 1))
                    }
                    LinearOp::Curl => {
                        let g = gradient(geo, &ladder, in_sig, p);
                        pointwise(&g, |v| {
                            let mut out = vec![ZERO; 3];
                            for j in 0..3 {
                                for k in 0..3 {
                                    if let Some((l, c)) = cross_basis(Frame::Spin, j, k) {
                                        out[l] += c * v[j * 3 + k];
                                    }
                                }
                            }
                            Ok(out)
                        })
                    }
                    LinearOp::Skew => {
                        let i = Complex64::new(0.0, 1.0);
                        pointwise(&p.vals, |v| Ok(vec![i * v[MINUS], -i * v[PLUS]]))
                    }
                    LinearOp::Trace => pointwise(&p.vals, |v| contract(Frame::Spin, in_sig, v, 0, 1)),
                    LinearOp::RadialComponent => {
                        let rest = 3usize.pow(in_sig.rank as u32 - 1);
                        pointwise(&p.vals, |v| Ok(v[RADIAL * rest..(RADIAL + 1) * rest].to_vec()))
                    }
                    LinearOp::AngularComponent => pointwise(&p.vals, |v| Ok(vec![v[MINUS], v[PLUS]])),
                    LinearOp::Laplacian | LinearOp::Interpolate(_) | LinearOp::Lift(_) => {
                        Err(CvError::internal("不可逐点求值的算子"))
                    }
                }
            };
            project(source.tolerance().entry, &grid, &in_block, &out_block, in_sig.ncomp(), apply)
        }
    }
}

// =============================================================================
// 逐点构造
// =============================================================================

/// 单个输入列在网格上的自旋分量剖面 `[τ][k]`
pub(crate) struct Profiles {
    pub(crate) vals: Vec<Vec<Complex64>>,
    pub(crate) ders: Vec<Vec<Complex64>>,
    pub(crate) r: Arc<Vec<f64>>,
}

struct Ladder<'a> {
    basis: &'a Basis,
    key: ModeKey,
}

impl Ladder<'_> {
    fn raise(&self, s: i32) -> f64 {
        self.basis.ladder().raise(self.key.m, s, self.key.ell)
    }

    fn lower(&self, s: i32) -> f64 {
        self.basis.ladder().lower(self.key.m, s, self.key.ell)
    }
}

/// 在每个半径上施加分量映射（`data` 为 `[分量][半径]`）
pub(crate) fn pointwise(
    data: &[Vec<Complex64>],
    f: impl Fn(&[Complex64]) -> CvResult<Vec<Complex64>>,
) -> CvResult<Vec<Vec<Complex64>>> {
    let nr = data.first().map_or(0, |d| d.len());
    let mut out: Vec<Vec<Complex64>> = Vec::new();
    let mut point = vec![ZERO; data.len()];
    for k in 0..nr {
        for (t, v) in point.iter_mut().enumerate() {
            *v = data[t][k];
        }
        let res = f(&point)?;
        if out.is_empty() {
            out = vec![vec![ZERO; nr]; res.len()];
        }
        for (t, v) in res.into_iter().enumerate() {
            out[t][k] = v;
        }
    }
    Ok(out)
}

/// 自旋标架下的梯度剖面
fn gradient(geo: Geometry, ladder: &Ladder<'_>, sig: TensorSig, p: &Profiles) -> Vec<Vec<Complex64>> {
    let n_in = sig.ncomp();
    let nr = p.r.len();
    let d = sig.dim;
    let out_sig = TensorSig::new(d, sig.rank + 1);
    let mut out = vec![vec![ZERO; nr]; out_sig.ncomp()];

    if d == 1 {
        // 圆周：∂_s = (1/a) ∂_φ
        let a = geo.outer_radius();
        let factor = Complex64::new(0.0, ladder.key.m as f64 / a);
        for tau in 0..n_in {
            for k in 0..nr {
                out[tau][k] = factor * p.vals[tau][k];
            }
        }
        return out;
    }

    for tau in 0..n_in {
        let s = sig.spin(tau);
        let kp = ladder.raise(s) * FRAC_1_SQRT_2;
        let km = ladder.lower(s) * FRAC_1_SQRT_2;
        for k in 0..nr {
            let inv_r = 1.0 / p.r[k];
            let v = p.vals[tau][k];
            out[PLUS * n_in + tau][k] += v * (kp * inv_r);
            out[MINUS * n_in + tau][k] += v * (km * inv_r);
        }
        if d == 2 {
            continue;
        }
        for k in 0..nr {
            out[RADIAL * n_in + tau][k] = p.ders[tau][k];
        }
        let idx = sig.indices(tau);
        for (slot, &i) in idx.iter().enumerate() {
            let mut shifted = idx.clone();
            // (目标指标, + 分量系数, - 分量系数)
            let links: &[(usize, usize, f64)] = match i {
                PLUS => &[(RADIAL, PLUS, -1.0)],
                MINUS => &[(RADIAL, MINUS, -1.0)],
                _ => &[(MINUS, PLUS, 1.0), (PLUS, MINUS, 1.0)],
            };
            for &(to, sigma, coef) in links {
                shifted[slot] = to;
                let dst = sigma * n_in + sig.flat(&shifted);
                for k in 0..nr {
                    out[dst][k] += p.vals[tau][k] * (coef / p.r[k]);
                }
            }
        }
    }
    out
}

/// 逐列生成剖面、施加算子、投影到输出块
///
/// 小于 `rel_cutoff · max|A|` 的元素被删去。
pub(crate) fn project(
    rel_cutoff: f64,
    grid: &RadialGrid,
    in_block: &BlockLayout,
    out_block: &BlockLayout,
    n_in: usize,
    apply: impl Fn(&Profiles) -> CvResult<Vec<Vec<Complex64>>>,
) -> CvResult<CsrMatrixC64> {
    let nr = grid.len();
    let r = Arc::new(grid.r.clone());
    let out_tables: Vec<_> = out_block
        .columns
        .iter()
        .map(|c| grid.eval(c.lambda, c.count))
        .collect();

    let mut dense = vec![vec![ZERO; in_block.size]; out_block.size];
    let mut max_abs: f64 = 0.0;
    for col in &in_block.columns {
        let table = grid.eval(col.lambda, col.count);
        for n in 0..col.count {
            let mut vals = vec![vec![ZERO; nr]; n_in];
            let mut ders = vec![vec![ZERO; nr]; n_in];
            for &(tau, q) in &col.spins {
                for k in 0..nr {
                    vals[tau][k] = q * table.values[n][k];
                    ders[tau][k] = q * table.derivs[n][k];
                }
            }
            let out = apply(&Profiles {
                vals,
                ders,
                r: r.clone(),
            })?;
            let j = col.offset + n;
            for (oc, otab) in out_block.columns.iter().zip(&out_tables) {
                let mut prof = vec![ZERO; nr];
                for &(tau, q) in &oc.spins {
                    let Some(src) = out.get(tau) else {
                        continue;
                    };
                    for (p, v) in prof.iter_mut().zip(src) {
                        *p += q.conj() * v;
                    }
                }
                for n_out in 0..oc.count {
                    let mut acc = ZERO;
                    for k in 0..nr {
                        acc += prof[k] * (grid.weights[k] * otab.values[n_out][k]);
                    }
                    max_abs = max_abs.max(acc.norm());
                    dense[oc.offset + n_out][j] = acc;
                }
            }
        }
    }

    let cutoff = rel_cutoff * max_abs;
    let mut builder = CsrBuilder::new(out_block.size, in_block.size);
    for (i, row) in dense.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            if v.norm() > cutoff {
                builder.set(i, j, v);
            }
        }
    }
    Ok(builder.build())
}

/// `Σ_c Q[τ, c] Σ_n a_n Z_n(r)` 在单个半径上的取值
fn interpolate(source: &Basis, in_block: &BlockLayout, out_block: &BlockLayout, r: f64) -> CsrMatrixC64 {
    let family = source.geometry().radial_family();
    let mut builder = CsrBuilder::new(out_block.size, in_block.size);
    for col in &in_block.columns {
        let Some(f) = family else {
            continue;
        };
        let table = f.eval(col.lambda, col.count, &[r]);
        for &(tau, q) in &col.spins {
            let Some(oc) = out_block.columns.iter().find(|oc| oc.spins[0].0 == tau) else {
                continue;
            };
            for n in 0..col.count {
                let v = q * table.values[n][0];
                if v.norm() > 0.0 {
                    builder.add(oc.offset, col.offset + n, v);
                }
            }
        }
    }
    builder.build()
}

/// 边界量提升到体基的指定径向模式
///
/// 球体上按 `Q^†` 分配到各正则分量，使自旋分量 `τ` 恰好收到 `tau_τ`。
fn lift(in_block: &BlockLayout, out_block: &BlockLayout, n: i32) -> CsrMatrixC64 {
    let mut builder = CsrBuilder::new(out_block.size, in_block.size);
    for oc in &out_block.columns {
        let count = oc.count as i64;
        let idx = if n < 0 { count + n as i64 } else { n as i64 };
        if idx < 0 || idx >= count {
            continue;
        }
        for &(tau, q) in &oc.spins {
            let Some(ic) = in_block.columns.iter().find(|ic| ic.spins[0].0 == tau) else {
                continue;
            };
            builder.add(oc.offset + idx as usize, ic.offset, q.conj());
        }
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn c(x: f64) -> Complex64 {
        Complex64::new(x, 0.0)
    }

    fn dense(m: &CsrMatrixC64) -> Vec<Vec<Complex64>> {
        (0..m.n_rows())
            .map(|i| (0..m.n_cols()).map(|j| m.get(i, j)).collect())
            .collect()
    }

    #[test]
    fn test_circle_derivative() {
        let b = Basis::circle(2.0, 16, 1.0).unwrap();
        let sig = TensorSig::scalar(1);
        let g = operator_matrix(LinearOp::Gradient, &b, &b, sig, ModeKey::new(3, 0)).unwrap();
        assert_relative_eq!(g.get(0, 0).im, 1.5, epsilon = 1e-14);
        let l = operator_matrix(LinearOp::Laplacian, &b, &b, sig, ModeKey::new(3, 0)).unwrap();
        assert_relative_eq!(l.get(0, 0).re, -9.0 / 4.0, epsilon = 1e-13);
    }

    #[test]
    fn test_sphere_laplacian_eigenvalue() {
        let radius = 2.0;
        let b = Basis::sphere(radius, 16, 12, 1.0).unwrap();
        let sig = TensorSig::scalar(2);
        for &(m, ell) in &[(0, 0), (1, 3), (-2, 5), (4, 7)] {
            let key = ModeKey::new(m, ell);
            let l = operator_matrix(LinearOp::Laplacian, &b, &b, sig, key).unwrap();
            let expected = -(ell as f64) * (ell as f64 + 1.0) / (radius * radius);
            if ell == 0 {
                assert!(l.max_abs() < 1e-12);
            } else {
                assert_relative_eq!(l.get(0, 0).re, expected, max_relative = 1e-11);
            }
        }
    }

    #[test]
    fn test_ball_laplacian_of_r2() {
        // ∇² r² = 6：(0,0) 模式上的精确关系
        let b = Basis::ball(1.0, [8, 8, 10], 1.5).unwrap();
        let sig = TensorSig::scalar(3);
        let key = ModeKey::new(0, 0);
        let block = b.block(sig, key).unwrap();
        let grid = b.operator_grid();
        let table = grid.eval(0, block.columns[0].count);
        // 用网格投影得到 r² 与常数 6 的系数
        let proj = |f: &dyn Fn(f64) -> f64| -> Vec<Complex64> {
            (0..block.size)
                .map(|n| {
                    c((0..grid.len())
                        .map(|k| grid.weights[k] * table.values[n][k] * f(grid.r[k]))
                        .sum())
                })
                .collect()
        };
        let a = proj(&|r| r * r);
        let expected = proj(&|_| 6.0);
        let l = operator_matrix(LinearOp::Laplacian, &b, &b, sig, key).unwrap();
        let mut y = vec![c(0.0); block.size];
        l.mul_vec(&a, &mut y);
        for (u, v) in y.iter().zip(&expected) {
            assert!((u - v).norm() < 1e-10);
        }
    }

    #[test]
    fn test_ball_curl_of_gradient_vanishes() {
        let b = Basis::ball(1.5, [8, 8, 8], 1.5).unwrap();
        for &(m, ell) in &[(0, 1), (1, 2), (-3, 4)] {
            let key = ModeKey::new(m, ell);
            let g = operator_matrix(LinearOp::Gradient, &b, &b, TensorSig::scalar(3), key).unwrap();
            let cu = operator_matrix(LinearOp::Curl, &b, &b, TensorSig::new(3, 1), key).unwrap();
            let prod = cu.matmul(&g);
            let scale = cu.max_abs() * g.max_abs();
            assert!(prod.max_abs() < 1e-12 * scale, "{key}: {}", prod.max_abs());
        }
    }

    #[test]
    fn test_ball_divergence_of_curl_vanishes() {
        let b = Basis::ball(1.0, [8, 8, 8], 1.5).unwrap();
        let key = ModeKey::new(1, 3);
        let v = TensorSig::new(3, 1);
        let cu = operator_matrix(LinearOp::Curl, &b, &b, v, key).unwrap();
        let d = operator_matrix(LinearOp::Divergence, &b, &b, v, key).unwrap();
        assert!(d.matmul(&cu).max_abs() < 1e-12 * d.max_abs() * cu.max_abs());
    }

    #[test]
    fn test_sphere_skew_twice_is_minus_identity() {
        let b = Basis::sphere(1.0, 8, 8, 1.0).unwrap();
        let key = ModeKey::new(1, 2);
        let s = operator_matrix(LinearOp::Skew, &b, &b, TensorSig::new(2, 1), key).unwrap();
        let ss = dense(&s.matmul(&s));
        for (i, row) in ss.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { -1.0 } else { 0.0 };
                assert!((v - c(expected)).norm() < 1e-13);
            }
        }
    }

    #[test]
    fn test_interpolate_matches_backward() {
        let b = Basis::shell(0.5, 1.0, [8, 6, 6], 1.0).unwrap();
        let surface = b.surface(1.0).unwrap();
        let sig = TensorSig::new(3, 1);
        let key = ModeKey::new(0, 2);
        let m = operator_matrix(LinearOp::Interpolate(1.0), &b, &surface, sig, key).unwrap();
        assert_eq!(m.n_rows(), 3);
        assert_eq!(m.n_cols(), 18);
        // Legendre P̂_n(1) = √(2n+1)
        assert_relative_eq!(m.get(0, 5).re, 11f64.sqrt(), max_relative = 1e-12);
    }

    #[test]
    fn test_lift_targets_last_mode() {
        let b = Basis::ball(1.0, [8, 8, 8], 1.5).unwrap();
        let surface = b.surface(1.0).unwrap();
        let key = ModeKey::new(0, 2);
        let m = operator_matrix(LinearOp::Lift(-1), &surface, &b, TensorSig::scalar(2), key).unwrap();
        let block = b.block(TensorSig::scalar(3), key).unwrap();
        assert_eq!(m.nnz(), 1);
        assert_relative_eq!(m.get(block.size - 1, 0).re, 1.0);
    }

    #[test]
    fn test_invalid_operators() {
        let s = Basis::sphere(1.0, 8, 8, 1.0).unwrap();
        let b = Basis::ball(1.0, [8, 8, 8], 1.0).unwrap();
        assert!(LinearOp::Gradient.output_sig(&s, &s, TensorSig::new(3, 1)).is_err());
        assert!(LinearOp::Curl.output_sig(&s, &s, TensorSig::new(2, 1)).is_err());
        assert!(LinearOp::Trace.output_sig(&b, &b, TensorSig::new(3, 1)).is_err());
        assert!(LinearOp::Interpolate(2.0).output_sig(&b, &b, TensorSig::scalar(3)).is_err());
        assert_eq!(
            LinearOp::AngularComponent
                .output_sig(&s, &s, TensorSig::new(3, 1))
                .unwrap(),
            TensorSig::new(2, 1)
        );
    }
}
