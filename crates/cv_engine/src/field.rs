// crates/cv_engine/src/field.rs

//! 场
//!
//! 场持有网格与系数两种表示，任一时刻至多一种是权威的（同步后二者一致）；
//! 写入其中一种会使另一种失效。每个场有稳定的 `uuid` 标识和修订号，
//! 任何写操作都会递增修订号。
//!
//! `Field` 是共享句柄（内部 `Arc`），克隆不复制数据；需要独立副本时用 [`Field::copy`]。

use crate::basis::{Basis, Scales};
use crate::layout::FieldLayout;
use cv_foundation::{ensure, CvError, CvResult, ModeKey};
use cv_spectral::tensor::TensorSig;
use ndarray::Array4;
use num_complex::Complex64;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use uuid::Uuid;

/// 数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Dtype {
    /// 实数（网格值只保留实部）
    #[default]
    Real,
    /// 复数
    Complex,
}

impl Dtype {
    /// 两个类型的公共类型
    pub fn promote(self, other: Dtype) -> Dtype {
        if self == Dtype::Complex || other == Dtype::Complex {
            Dtype::Complex
        } else {
            Dtype::Real
        }
    }
}

/// 场的静态属性
#[derive(Debug, Clone)]
pub struct FieldMeta {
    /// 基
    pub basis: Arc<Basis>,
    /// 张量形状
    pub sig: TensorSig,
    /// 数据类型
    pub dtype: Dtype,
    /// 是否含角向依赖（false 表示仅 `(m, ℓ) = (0, 0)`）
    pub angular: bool,
}

impl FieldMeta {
    /// 以基的本征维数创建
    pub fn new(basis: &Arc<Basis>, rank: usize) -> Self {
        Self {
            basis: basis.clone(),
            sig: TensorSig::new(basis.geometry().native_dim(), rank),
            dtype: Dtype::Real,
            angular: true,
        }
    }

    /// 设置分量维数
    pub fn with_dim(mut self, dim: usize) -> Self {
        self.sig.dim = dim;
        self
    }

    /// 设置数据类型
    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = dtype;
        self
    }

    /// 仅径向依赖
    pub fn radial_only(mut self) -> Self {
        self.angular = false;
        self
    }

    /// 系数布局
    pub fn layout(&self) -> CvResult<Arc<FieldLayout>> {
        self.basis.layout(self.sig, self.angular)
    }
}

#[derive(Debug, Clone)]
struct FieldState {
    scales: Scales,
    grid: Option<Array4<Complex64>>,
    coeffs: Vec<Complex64>,
    grid_valid: bool,
    coeff_valid: bool,
    revision: u64,
    ncc_vars: Option<Vec<Uuid>>,
}

struct FieldInner {
    id: Uuid,
    name: String,
    meta: FieldMeta,
    layout: Arc<FieldLayout>,
    state: RwLock<FieldState>,
}

/// 场句柄
#[derive(Clone)]
pub struct Field {
    inner: Arc<FieldInner>,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("rank", &self.inner.meta.sig.rank)
            .field("dim", &self.inner.meta.sig.dim)
            .field("basis", &self.inner.meta.basis)
            .finish()
    }
}

impl Field {
    /// 由属性创建零场
    pub fn with_meta(name: impl Into<String>, meta: FieldMeta) -> CvResult<Self> {
        meta.basis.check_dim(meta.sig.dim)?;
        let layout = meta.layout()?;
        let state = FieldState {
            scales: [1.0; 3],
            grid: None,
            coeffs: vec![Complex64::new(0.0, 0.0); layout.size()],
            grid_valid: false,
            coeff_valid: true,
            revision: 0,
            ncc_vars: None,
        };
        Ok(Self {
            inner: Arc::new(FieldInner {
                id: Uuid::new_v4(),
                name: name.into(),
                meta,
                layout,
                state: RwLock::new(state),
            }),
        })
    }

    /// 标量场
    pub fn scalar(name: impl Into<String>, basis: &Arc<Basis>) -> CvResult<Self> {
        Self::with_meta(name, FieldMeta::new(basis, 0))
    }

    /// 向量场
    pub fn vector(name: impl Into<String>, basis: &Arc<Basis>) -> CvResult<Self> {
        Self::with_meta(name, FieldMeta::new(basis, 1))
    }

    /// 任意阶张量场
    pub fn tensor(name: impl Into<String>, basis: &Arc<Basis>, rank: usize) -> CvResult<Self> {
        Self::with_meta(name, FieldMeta::new(basis, rank))
    }

    /// 由系数直接构造
    pub fn from_coefficients(
        name: impl Into<String>,
        meta: FieldMeta,
        coeffs: Vec<Complex64>,
    ) -> CvResult<Self> {
        let f = Self::with_meta(name, meta)?;
        f.set_coefficients(coeffs)?;
        Ok(f)
    }

    // =========================================================================
    // 属性
    // =========================================================================

    /// 唯一标识
    #[inline]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// 名称
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 静态属性
    #[inline]
    pub fn meta(&self) -> &FieldMeta {
        &self.inner.meta
    }

    /// 基
    #[inline]
    pub fn basis(&self) -> &Arc<Basis> {
        &self.inner.meta.basis
    }

    /// 张量形状
    #[inline]
    pub fn sig(&self) -> TensorSig {
        self.inner.meta.sig
    }

    /// 阶数
    #[inline]
    pub fn rank(&self) -> usize {
        self.inner.meta.sig.rank
    }

    /// 数据类型
    #[inline]
    pub fn dtype(&self) -> Dtype {
        self.inner.meta.dtype
    }

    /// 是否含角向依赖
    #[inline]
    pub fn angular(&self) -> bool {
        self.inner.meta.angular
    }

    /// 系数布局
    #[inline]
    pub fn layout(&self) -> &Arc<FieldLayout> {
        &self.inner.layout
    }

    /// 修订号
    pub fn revision(&self) -> u64 {
        self.inner.state.read().revision
    }

    /// 当前网格缩放
    pub fn scales(&self) -> Scales {
        self.inner.state.read().scales
    }

    /// 是否为同一个场
    #[inline]
    pub fn same(&self, other: &Field) -> bool {
        self.inner.id == other.inner.id
    }

    /// 当前网格尺寸
    pub fn grid_shape(&self) -> CvResult<[usize; 3]> {
        self.basis().grid_shape(self.scales())
    }

    // =========================================================================
    // 写入
    // =========================================================================

    /// 设置网格值（当前缩放下，物理标架）
    pub fn set_grid_values(&self, mut data: Array4<Complex64>) -> CvResult<()> {
        let mut st = self.inner.state.write();
        let [a, b, c] = self.basis().grid_shape(st.scales)?;
        let expected = (self.sig().ncomp(), a, b, c);
        ensure!(
            data.dim() == expected,
            CvError::configuration(format!(
                "场 {} 的网格形状 {:?} 与期望 {:?} 不符",
                self.name(),
                data.dim(),
                expected
            ))
        );
        if self.dtype() == Dtype::Real {
            data.mapv_inplace(|z| Complex64::new(z.re, 0.0));
        }
        st.grid = Some(data);
        st.grid_valid = true;
        st.coeff_valid = false;
        st.revision += 1;
        Ok(())
    }

    /// 由函数 `f(φ, θ, r) -> 物理分量` 设置网格值
    pub fn set_grid_from_fn(&self, f: impl Fn(f64, f64, f64) -> Vec<Complex64>) -> CvResult<()> {
        let scales = self.scales();
        let (phi, theta, r) = self.basis().grids(scales)?;
        let ncomp = self.sig().ncomp();
        let mut data = Array4::<Complex64>::zeros((ncomp, phi.len(), theta.len(), r.len()));
        for (i, &p) in phi.iter().enumerate() {
            for (j, &t) in theta.iter().enumerate() {
                for (k, &rr) in r.iter().enumerate() {
                    let v = f(p, t, rr);
                    CvError::check_size("grid function", ncomp, v.len())?;
                    for (c, z) in v.into_iter().enumerate() {
                        data[[c, i, j, k]] = z;
                    }
                }
            }
        }
        self.set_grid_values(data)
    }

    /// 设置系数
    pub fn set_coefficients(&self, coeffs: Vec<Complex64>) -> CvResult<()> {
        CvError::check_size("coefficients", self.layout().size(), coeffs.len())?;
        let mut st = self.inner.state.write();
        st.coeffs = coeffs;
        st.coeff_valid = true;
        st.grid_valid = false;
        st.revision += 1;
        Ok(())
    }

    /// 写入单个模式组的系数
    pub fn set_block(&self, key: ModeKey, block: &[Complex64]) -> CvResult<()> {
        self.to_coefficients()?;
        let mut st = self.inner.state.write();
        self.layout().insert(&mut st.coeffs, key, block)?;
        st.grid_valid = false;
        st.revision += 1;
        Ok(())
    }

    /// 置零
    pub fn set_zero(&self) -> CvResult<()> {
        self.set_coefficients(vec![Complex64::new(0.0, 0.0); self.layout().size()])
    }

    // =========================================================================
    // 同步
    // =========================================================================

    /// 确保系数有效
    pub fn to_coefficients(&self) -> CvResult<()> {
        let mut st = self.inner.state.write();
        if st.coeff_valid {
            return Ok(());
        }
        let coeffs = match st.grid.as_ref() {
            Some(grid) if st.grid_valid => self.basis().forward(grid, self.layout(), st.scales)?,
            _ => vec![Complex64::new(0.0, 0.0); self.layout().size()],
        };
        st.coeffs = coeffs;
        st.coeff_valid = true;
        // 仅径向场的正变换丢弃了角向内容，网格需由投影后的系数重建
        if !self.angular() {
            st.grid_valid = false;
        }
        Ok(())
    }

    /// 确保网格有效
    pub fn to_grid(&self) -> CvResult<()> {
        self.to_coefficients()?;
        let mut st = self.inner.state.write();
        if st.grid_valid {
            return Ok(());
        }
        let mut grid = self.basis().backward(&st.coeffs, self.layout(), st.scales)?;
        if self.dtype() == Dtype::Real {
            grid.mapv_inplace(|z| Complex64::new(z.re, 0.0));
        }
        st.grid = Some(grid);
        st.grid_valid = true;
        Ok(())
    }

    /// 改变网格缩放（网格为权威时先同步到系数）
    pub fn rescale(&self, scales: Scales) -> CvResult<()> {
        self.basis().grid_shape(scales)?;
        if self.scales() == scales {
            return Ok(());
        }
        self.to_coefficients()?;
        let mut st = self.inner.state.write();
        st.scales = scales;
        st.grid = None;
        st.grid_valid = false;
        Ok(())
    }

    /// 同 [`Field::rescale`]
    pub fn require_scales(&self, scales: Scales) -> CvResult<()> {
        self.rescale(scales)
    }

    /// 网格值（当前缩放）
    pub fn grid_values(&self) -> CvResult<Array4<Complex64>> {
        self.to_grid()?;
        let st = self.inner.state.read();
        st.grid
            .clone()
            .ok_or_else(|| CvError::internal(format!("场 {} 网格缺失", self.name())))
    }

    /// 系数
    pub fn coefficients(&self) -> CvResult<Vec<Complex64>> {
        self.to_coefficients()?;
        Ok(self.inner.state.read().coeffs.clone())
    }

    /// 某个模式组的系数（该场不含此模式时返回 `None`）
    pub fn block(&self, key: ModeKey) -> CvResult<Option<Vec<Complex64>>> {
        self.to_coefficients()?;
        let st = self.inner.state.read();
        Ok(self.layout().extract(&st.coeffs, key).map(|b| b.to_vec()))
    }

    // =========================================================================
    // 其它
    // =========================================================================

    /// 声明为非常系数场
    ///
    /// 要求场仅依赖半径，且与每个变量处于相同几何、角向分辨率与分量维数。
    pub fn as_ncc(&self, variables: &[Field]) -> CvResult<()> {
        ensure!(
            !self.angular(),
            CvError::configuration(format!("NCC 场 {} 含角向依赖", self.name()))
        );
        for var in variables {
            ensure!(
                var.basis().geometry() == self.basis().geometry()
                    && var.basis().same_angular(self.basis()),
                CvError::configuration(format!(
                    "NCC 场 {} 与变量 {} 的几何或角向分辨率不同",
                    self.name(),
                    var.name()
                ))
            );
            ensure!(
                var.sig().dim == self.sig().dim,
                CvError::configuration(format!(
                    "NCC 场 {} 与变量 {} 的分量维数不同",
                    self.name(),
                    var.name()
                ))
            );
        }
        self.inner.state.write().ncc_vars = Some(variables.iter().map(|v| v.id()).collect());
        Ok(())
    }

    /// 是否已声明为 NCC
    pub fn is_ncc(&self) -> bool {
        self.inner.state.read().ncc_vars.is_some()
    }

    /// 独立副本（新标识）
    pub fn copy(&self) -> Self {
        let mut state = self.inner.state.read().clone();
        state.revision = 0;
        state.ncc_vars = None;
        Self {
            inner: Arc::new(FieldInner {
                id: Uuid::new_v4(),
                name: self.inner.name.clone(),
                meta: self.inner.meta.clone(),
                layout: self.inner.layout.clone(),
                state: RwLock::new(state),
            }),
        }
    }

    /// 全域积分（仅标量）
    pub fn integrate(&self) -> CvResult<Complex64> {
        let nphi = self.grid_shape()?[0];
        self.integrate_range(0..nphi)
    }

    /// 在 φ 网格下标区间上的积分（分布式归约用）
    pub fn integrate_range(&self, phi_range: Range<usize>) -> CvResult<Complex64> {
        ensure!(
            self.rank() == 0,
            CvError::configuration(format!("只能对标量场积分, {} 的阶数为 {}", self.name(), self.rank()))
        );
        let grid = self.grid_values()?;
        let w = self.basis().grid_weights(self.scales())?;
        let mut acc = Complex64::new(0.0, 0.0);
        for i in phi_range {
            for (j, wt) in w.theta.iter().enumerate() {
                for (k, wr) in w.r.iter().enumerate() {
                    acc += grid[[0, i, j, k]] * (w.phi * wt * wr);
                }
            }
        }
        Ok(acc)
    }
}
