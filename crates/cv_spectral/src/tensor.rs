// crates/cv_spectral/src/tensor.rs

//! 张量分量代数
//!
//! # 标架
//!
//! - 物理标架：分量顺序 `(φ, θ, r)`，双线性对偶为恒等
//! - 自旋标架：`e_± = (e_θ ± i e_φ)/√2`，`e_0 = e_r`，分量顺序 `(-, +, 0)`，
//!   自旋分别为 `-1, +1, 0`；对偶 `- ↔ +`，`0 ↔ 0`
//!
//! 分量按第一指标优先展平：`comp = Σ_i τ_i d^{k-1-i}`。
//!
//! 单位变换 `U`（自旋 ← 物理）：
//!
//! ```text
//!        φ        θ      r
//! -   [ i/√2    1/√2    0 ]
//! +   [-i/√2    1/√2    0 ]
//! 0   [  0       0      1 ]
//! ```
//!
//! 乘积核同时服务于网格上的直接求值（物理标架）与 NCC 矩阵构建（自旋标架），
//! 两条路径的一致性来自同一份代码。

use cv_foundation::{CvError, CvResult};
use num_complex::Complex64;
use smallvec::SmallVec;
use std::f64::consts::FRAC_1_SQRT_2;

/// 多重指标
pub type MultiIndex = SmallVec<[usize; 4]>;

/// 分量标架
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frame {
    /// `(φ, θ, r)`
    Physical,
    /// `(-, +, 0)`
    Spin,
}

/// 张量形状：切向维数与阶数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorSig {
    /// 每个指标的取值个数（1、2 或 3）
    pub dim: usize,
    /// 张量阶数
    pub rank: usize,
}

impl TensorSig {
    /// 创建
    pub fn new(dim: usize, rank: usize) -> Self {
        Self { dim, rank }
    }

    /// 标量
    pub fn scalar(dim: usize) -> Self {
        Self { dim, rank: 0 }
    }

    /// 分量个数 `dim^rank`
    #[inline]
    pub fn ncomp(&self) -> usize {
        self.dim.pow(self.rank as u32)
    }

    /// 展平分量 → 多重指标
    pub fn indices(&self, mut comp: usize) -> MultiIndex {
        let mut idx: MultiIndex = SmallVec::from_elem(0, self.rank);
        for slot in (0..self.rank).rev() {
            idx[slot] = comp % self.dim;
            comp /= self.dim;
        }
        idx
    }

    /// 多重指标 → 展平分量
    pub fn flat(&self, idx: &[usize]) -> usize {
        idx.iter().fold(0, |acc, &i| acc * self.dim + i)
    }

    /// 自旋标架下分量 `comp` 的总自旋
    pub fn spin(&self, comp: usize) -> i32 {
        self.indices(comp)
            .iter()
            .map(|&i| slot_spin(self.dim, i))
            .sum()
    }
}

/// 自旋标架下单个指标的自旋
#[inline]
pub fn slot_spin(dim: usize, index: usize) -> i32 {
    match (dim, index) {
        (2 | 3, 0) => -1,
        (2 | 3, 1) => 1,
        _ => 0,
    }
}

/// 双线性对偶指标（`e_i · e_dual(i) = 1`）
#[inline]
pub fn dual(frame: Frame, dim: usize, index: usize) -> usize {
    match frame {
        Frame::Physical => index,
        Frame::Spin => match (dim, index) {
            (2 | 3, 0) => 1,
            (2 | 3, 1) => 0,
            _ => index,
        },
    }
}

/// `e_i × e_j = coef · e_k`（仅三维）
pub fn cross_basis(frame: Frame, i: usize, j: usize) -> Option<(usize, Complex64)> {
    let im = Complex64::new(0.0, 1.0);
    let one = Complex64::new(1.0, 0.0);
    match frame {
        Frame::Physical => match (i, j) {
            (0, 1) => Some((2, -one)),
            (1, 0) => Some((2, one)),
            (2, 1) => Some((0, one)),
            (1, 2) => Some((0, -one)),
            (0, 2) => Some((1, one)),
            (2, 0) => Some((1, -one)),
            _ => None,
        },
        Frame::Spin => match (i, j) {
            (1, 0) => Some((2, -im)),
            (0, 1) => Some((2, im)),
            (2, 1) => Some((1, -im)),
            (1, 2) => Some((1, im)),
            (2, 0) => Some((0, im)),
            (0, 2) => Some((0, -im)),
            _ => None,
        },
    }
}

/// 自旋 ← 物理的单位矩阵元 `U[σ][p]`
pub fn unitary(dim: usize, sigma: usize, p: usize) -> Complex64 {
    let h = FRAC_1_SQRT_2;
    let zero = Complex64::new(0.0, 0.0);
    match dim {
        1 => {
            if sigma == p {
                Complex64::new(1.0, 0.0)
            } else {
                zero
            }
        }
        _ => match (sigma, p) {
            (0, 0) => Complex64::new(0.0, h),
            (0, 1) => Complex64::new(h, 0.0),
            (1, 0) => Complex64::new(0.0, -h),
            (1, 1) => Complex64::new(h, 0.0),
            (2, 2) => Complex64::new(1.0, 0.0),
            _ => zero,
        },
    }
}

fn apply_per_slot(sig: TensorSig, comps: &[Complex64], m: impl Fn(usize, usize) -> Complex64) -> Vec<Complex64> {
    let mut cur = comps.to_vec();
    let d = sig.dim;
    for slot in 0..sig.rank {
        let stride = d.pow((sig.rank - 1 - slot) as u32);
        let mut next = vec![Complex64::new(0.0, 0.0); cur.len()];
        for (comp, out) in next.iter_mut().enumerate() {
            let i = (comp / stride) % d;
            let base = comp - i * stride;
            for j in 0..d {
                let coef = m(i, j);
                if coef.norm() != 0.0 {
                    *out += coef * cur[base + j * stride];
                }
            }
        }
        cur = next;
    }
    cur
}

/// 物理分量 → 自旋分量
pub fn to_spin(sig: TensorSig, phys: &[Complex64]) -> Vec<Complex64> {
    apply_per_slot(sig, phys, |i, j| unitary(sig.dim, i, j))
}

/// 自旋分量 → 物理分量（`U^†`）
pub fn to_physical(sig: TensorSig, spin: &[Complex64]) -> Vec<Complex64> {
    apply_per_slot(sig, spin, |i, j| unitary(sig.dim, j, i).conj())
}

/// 双线性运算种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bilinear {
    /// 张量积（标量时即普通乘法）
    Product,
    /// `a` 的最后一个指标与 `b` 的第一个指标缩并
    Dot,
    /// 三维向量叉积
    Cross,
}

impl Bilinear {
    /// 结果阶数
    pub fn output_rank(&self, dim: usize, ra: usize, rb: usize) -> CvResult<usize> {
        match self {
            Self::Product => Ok(ra + rb),
            Self::Dot => {
                if ra == 0 || rb == 0 {
                    return Err(CvError::configuration("点积要求两侧阶数至少为 1"));
                }
                Ok(ra + rb - 2)
            }
            Self::Cross => {
                if ra != 1 || rb != 1 || dim != 3 {
                    return Err(CvError::configuration(format!(
                        "叉积要求三维向量, 实际 dim={dim}, 阶数 ({ra}, {rb})"
                    )));
                }
                Ok(1)
            }
        }
    }

    /// 单点上的双线性运算
    pub fn apply(
        &self,
        frame: Frame,
        dim: usize,
        ra: usize,
        a: &[Complex64],
        rb: usize,
        b: &[Complex64],
    ) -> CvResult<Vec<Complex64>> {
        let sa = TensorSig::new(dim, ra);
        let sb = TensorSig::new(dim, rb);
        CvError::check_size("tensor a", sa.ncomp(), a.len())?;
        CvError::check_size("tensor b", sb.ncomp(), b.len())?;
        let out_sig = TensorSig::new(dim, self.output_rank(dim, ra, rb)?);
        let mut out = vec![Complex64::new(0.0, 0.0); out_sig.ncomp()];
        match self {
            Self::Product => {
                let nb = b.len();
                for (ia, &va) in a.iter().enumerate() {
                    for (ib, &vb) in b.iter().enumerate() {
                        out[ia * nb + ib] = va * vb;
                    }
                }
            }
            Self::Dot => {
                let nb_rest = dim.pow((rb - 1) as u32);
                for (ia, &va) in a.iter().enumerate() {
                    if va.norm() == 0.0 {
                        continue;
                    }
                    let last = ia % dim;
                    let head = ia / dim;
                    let jb = dual(frame, dim, last);
                    for rest in 0..nb_rest {
                        out[head * nb_rest + rest] += va * b[jb * nb_rest + rest];
                    }
                }
            }
            Self::Cross => {
                for (i, &va) in a.iter().enumerate() {
                    for (j, &vb) in b.iter().enumerate() {
                        if let Some((k, coef)) = cross_basis(frame, i, j) {
                            out[k] += coef * va * vb;
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

/// 缩并指标 `slot_a` 与 `slot_b`（双线性对偶）
pub fn contract(
    frame: Frame,
    sig: TensorSig,
    comps: &[Complex64],
    slot_a: usize,
    slot_b: usize,
) -> CvResult<Vec<Complex64>> {
    if sig.rank < 2 || slot_a == slot_b || slot_a >= sig.rank || slot_b >= sig.rank {
        return Err(CvError::configuration(format!(
            "无法缩并阶数 {} 张量的指标 ({slot_a}, {slot_b})",
            sig.rank
        )));
    }
    let out_sig = TensorSig::new(sig.dim, sig.rank - 2);
    let mut out = vec![Complex64::new(0.0, 0.0); out_sig.ncomp()];
    for (comp, &v) in comps.iter().enumerate() {
        let idx = sig.indices(comp);
        if idx[slot_b] != dual(frame, sig.dim, idx[slot_a]) {
            continue;
        }
        let rest: MultiIndex = idx
            .iter()
            .enumerate()
            .filter(|(s, _)| *s != slot_a && *s != slot_b)
            .map(|(_, &i)| i)
            .collect();
        out[out_sig.flat(&rest)] += v;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn close(a: &[Complex64], b: &[Complex64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).norm() < 1e-13)
    }

    #[test]
    fn test_indices_first_slot_major() {
        let sig = TensorSig::new(3, 2);
        assert_eq!(sig.indices(5).as_slice(), &[1, 2]);
        assert_eq!(sig.flat(&[2, 0]), 6);
        assert_eq!(sig.spin(sig.flat(&[1, 1])), 2);
        assert_eq!(sig.spin(sig.flat(&[0, 2])), -1);
    }

    #[test]
    fn test_unitary_roundtrip() {
        let sig = TensorSig::new(3, 2);
        let phys: Vec<Complex64> = (0..9).map(|k| c(k as f64, 0.5 - k as f64)).collect();
        let back = to_physical(sig, &to_spin(sig, &phys));
        assert!(close(&phys, &back));
    }

    #[test]
    fn test_spin_basis_duals() {
        // e_θ 在自旋标架下：u_- = u_+ = 1/√2
        let sig = TensorSig::new(3, 1);
        let s = to_spin(sig, &[c(0.0, 0.0), c(1.0, 0.0), c(0.0, 0.0)]);
        assert!(close(&s, &[c(FRAC_1_SQRT_2, 0.0), c(FRAC_1_SQRT_2, 0.0), c(0.0, 0.0)]));
    }

    fn vec3() -> impl Strategy<Value = Vec<Complex64>> {
        prop::collection::vec((-2.0..2.0f64, -2.0..2.0f64), 3)
            .prop_map(|v| v.into_iter().map(|(a, b)| c(a, b)).collect())
    }

    proptest! {
        #[test]
        fn prop_frames_agree_dot_and_cross(a in vec3(), b in vec3()) {
            let sig = TensorSig::new(3, 1);
            for op in [Bilinear::Dot, Bilinear::Cross, Bilinear::Product] {
                let phys = op.apply(Frame::Physical, 3, 1, &a, 1, &b).unwrap();
                let spin = op
                    .apply(Frame::Spin, 3, 1, &to_spin(sig, &a), 1, &to_spin(sig, &b))
                    .unwrap();
                let out_sig = TensorSig::new(3, op.output_rank(3, 1, 1).unwrap());
                prop_assert!(close(&to_physical(out_sig, &spin), &phys));
            }
        }
    }

    #[test]
    fn test_cross_physical_orientation() {
        // e_r × e_θ = e_φ
        let er = [c(0.0, 0.0), c(0.0, 0.0), c(1.0, 0.0)];
        let et = [c(0.0, 0.0), c(1.0, 0.0), c(0.0, 0.0)];
        let out = Bilinear::Cross.apply(Frame::Physical, 3, 1, &er, 1, &et).unwrap();
        assert!(close(&out, &[c(1.0, 0.0), c(0.0, 0.0), c(0.0, 0.0)]));
    }

    #[test]
    fn test_trace_matches_frames() {
        let sig = TensorSig::new(3, 2);
        let phys: Vec<Complex64> = (0..9).map(|k| c(1.0 + k as f64, 0.1 * k as f64)).collect();
        let tr_phys = contract(Frame::Physical, sig, &phys, 0, 1).unwrap();
        let tr_spin = contract(Frame::Spin, sig, &to_spin(sig, &phys), 0, 1).unwrap();
        assert!(close(&tr_phys, &tr_spin));
        assert!((tr_phys[0] - c(15.0, 1.2)).norm() < 1e-13);
    }

    #[test]
    fn test_invalid_ranks() {
        assert!(Bilinear::Dot.output_rank(3, 0, 1).is_err());
        assert!(Bilinear::Cross.output_rank(2, 1, 1).is_err());
        assert!(contract(Frame::Spin, TensorSig::new(3, 1), &[c(1.0, 0.0); 3], 0, 0).is_err());
    }
}
