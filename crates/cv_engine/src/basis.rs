// crates/cv_engine/src/basis.rs

//! 谱基与基注册表
//!
//! `Basis` 在构造后不可变；布局、正则性表、变换计划与算子矩阵按需计算，
//! 缓存在基实例自身的 `RwLock` 映射中（无全局状态）。
//!
//! # 模式范围
//!
//! ```text
//! L_max = Nθ - 1
//! |m| ≤ min(Nφ/2 - 1, L_max),   |m| ≤ ℓ ≤ L_max
//! ```
//!
//! 圆周上 `ℓ = 0`，`|m| ≤ Nφ/2 - 1`。

use crate::coords::Geometry;
use crate::layout::{BlockLayout, Column, FieldLayout};
use crate::operators::OperatorKey;
use crate::regularity::{regularity_table, RegularityTable};
use crate::transforms::TransformPlan;
use cv_foundation::{ensure, CvError, CvResult, ModeKey, Tolerance};
use cv_spectral::csr::CsrMatrixC64;
use cv_spectral::harmonics::SpinLadder;
use cv_spectral::radial::{RadialFamily, RadialTable};
use cv_spectral::tensor::{slot_spin, TensorSig};
use num_complex::Complex64;
use parking_lot::RwLock;
use smallvec::smallvec;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

/// 各方向的网格缩放因子 `(φ, θ, r)`
pub type Scales = [f64; 3];

/// 默认算子投影求积的附加点数
pub const DEFAULT_QUADRATURE_PADDING: usize = 4;

/// 径向求积网格（球面、圆周退化为单点）
#[derive(Debug, Clone)]
pub struct RadialGrid {
    /// 半径
    pub r: Vec<f64>,
    /// 归一化权重
    pub weights: Vec<f64>,
    family: Option<RadialFamily>,
}

impl RadialGrid {
    /// 点数
    #[inline]
    pub fn len(&self) -> usize {
        self.r.len()
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.r.is_empty()
    }

    /// 在本网格上求径向基（无径向时为常数 1）
    pub fn eval(&self, lambda: u32, count: usize) -> RadialTable {
        match self.family {
            Some(f) => f.eval(lambda, count, &self.r),
            None => RadialTable {
                values: vec![vec![1.0; self.r.len()]; count],
                derivs: vec![vec![0.0; self.r.len()]; count],
            },
        }
    }
}

/// 网格积分权重（已包含几何因子）
#[derive(Debug, Clone)]
pub struct GridWeights {
    /// φ 方向（均匀）
    pub phi: f64,
    /// θ 方向
    pub theta: Vec<f64>,
    /// 径向
    pub r: Vec<f64>,
}

#[derive(Default)]
struct BasisCaches {
    blocks: RwLock<HashMap<(usize, usize, ModeKey), Arc<BlockLayout>>>,
    layouts: RwLock<HashMap<(usize, usize, bool), Arc<FieldLayout>>>,
    regularity: RwLock<HashMap<(ModeKey, usize), Arc<RegularityTable>>>,
    plans: RwLock<HashMap<[usize; 3], Arc<TransformPlan>>>,
    radial_grids: RwLock<HashMap<usize, Arc<RadialGrid>>>,
    operators: RwLock<HashMap<OperatorKey, Arc<CsrMatrixC64>>>,
    surfaces: RwLock<HashMap<u64, Arc<Basis>>>,
}

/// 谱基
pub struct Basis {
    geometry: Geometry,
    shape: [usize; 3],
    dealias: Scales,
    tolerance: Tolerance,
    quadrature_padding: usize,
    ladder: SpinLadder,
    caches: BasisCaches,
}

impl fmt::Debug for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Basis")
            .field("geometry", &self.geometry)
            .field("shape", &self.shape)
            .field("dealias", &self.dealias)
            .finish()
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}x{}x{}]",
            self.geometry, self.shape[0], self.shape[1], self.shape[2]
        )
    }
}

impl Basis {
    /// 创建基
    ///
    /// `shape = (Nφ, Nθ, Nr)`，几何中不存在的方向必须为 1。
    pub fn new(geometry: Geometry, shape: [usize; 3], dealias: Scales) -> CvResult<Self> {
        geometry.validate()?;
        let [nphi, ntheta, nr] = shape;
        ensure!(
            nphi >= 2 && nphi % 2 == 0,
            CvError::configuration(format!("Nφ 必须为不小于 2 的偶数: {nphi}"))
        );
        ensure!(
            ntheta >= 1 && (geometry.has_theta() || ntheta == 1),
            CvError::configuration(format!("{geometry} 的 Nθ 非法: {ntheta}"))
        );
        ensure!(
            nr >= 1 && (geometry.has_radius() || nr == 1),
            CvError::configuration(format!("{geometry} 的 Nr 非法: {nr}"))
        );
        ensure!(
            dealias.iter().all(|&d| d >= 1.0 && d.is_finite()),
            CvError::configuration(format!("去混叠因子必须 ≥ 1: {dealias:?}"))
        );
        let ell_max = ntheta as u32 - 1;
        Ok(Self {
            geometry,
            shape,
            dealias,
            tolerance: Tolerance::default(),
            quadrature_padding: DEFAULT_QUADRATURE_PADDING,
            ladder: SpinLadder::new(ell_max),
            caches: BasisCaches::default(),
        })
    }

    /// 圆周基
    pub fn circle(radius: f64, nphi: usize, dealias: f64) -> CvResult<Self> {
        Self::new(Geometry::Circle { radius }, [nphi, 1, 1], [dealias; 3])
    }

    /// 球面基
    pub fn sphere(radius: f64, nphi: usize, ntheta: usize, dealias: f64) -> CvResult<Self> {
        Self::new(Geometry::Sphere { radius }, [nphi, ntheta, 1], [dealias; 3])
    }

    /// 球体基
    pub fn ball(radius: f64, shape: [usize; 3], dealias: f64) -> CvResult<Self> {
        Self::new(Geometry::Ball { radius }, shape, [dealias; 3])
    }

    /// 球壳基
    pub fn shell(inner: f64, outer: f64, shape: [usize; 3], dealias: f64) -> CvResult<Self> {
        Self::new(Geometry::Shell { inner, outer }, shape, [dealias; 3])
    }

    /// 设置正交化与元素截断容差
    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// 设置算子投影求积的附加点数
    pub fn with_quadrature_padding(mut self, padding: usize) -> Self {
        self.quadrature_padding = padding;
        self
    }

    /// 半径为 `radius` 的边界球面（保持角向分辨率，同一半径只构造一次）
    pub fn surface(&self, radius: f64) -> CvResult<Arc<Basis>> {
        ensure!(
            self.geometry.has_radius(),
            CvError::configuration(format!("{} 没有径向边界", self.geometry))
        );
        ensure!(
            self.geometry.contains_radius(radius),
            CvError::configuration(format!("半径 {radius} 不在 {} 内", self.geometry))
        );
        if let Some(s) = self.caches.surfaces.read().get(&radius.to_bits()) {
            return Ok(s.clone());
        }
        let surface = Arc::new(
            Basis::new(
                Geometry::Sphere { radius },
                [self.shape[0], self.shape[1], 1],
                [self.dealias[0], self.dealias[1], 1.0],
            )?
            .with_tolerance(self.tolerance),
        );
        Ok(self
            .caches
            .surfaces
            .write()
            .entry(radius.to_bits())
            .or_insert(surface)
            .clone())
    }

    // =========================================================================
    // 基本属性
    // =========================================================================

    /// 几何
    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// 模式数 `(Nφ, Nθ, Nr)`
    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// 去混叠因子
    #[inline]
    pub fn dealias(&self) -> Scales {
        self.dealias
    }

    /// 容差
    #[inline]
    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }

    /// 升降算子系数
    #[inline]
    pub fn ladder(&self) -> &SpinLadder {
        &self.ladder
    }

    /// 最大角度阶数
    #[inline]
    pub fn ell_max(&self) -> u32 {
        self.shape[1] as u32 - 1
    }

    /// 最大方位阶数
    pub fn m_max(&self) -> u32 {
        let nyq = (self.shape[0] / 2) as u32 - 1;
        if self.geometry.has_theta() {
            nyq.min(self.ell_max())
        } else {
            nyq
        }
    }

    /// 两个基是否描述同一个离散空间
    pub fn same_space(&self, other: &Basis) -> bool {
        self.geometry == other.geometry && self.shape == other.shape
    }

    /// 角向分辨率与几何类型是否一致
    pub fn same_angular(&self, other: &Basis) -> bool {
        self.geometry.same_angular_kind(&other.geometry)
            && self.shape[0] == other.shape[0]
            && self.shape[1] == other.shape[1]
    }

    /// 模式键序列（`angular = false` 时仅 `(0, 0)`）
    pub fn mode_keys(&self, angular: bool) -> Vec<ModeKey> {
        if !angular {
            return vec![ModeKey::new(0, 0)];
        }
        let mmax = self.m_max() as i32;
        let mut keys = Vec::new();
        for m in -mmax..=mmax {
            if self.geometry.has_theta() {
                for ell in m.unsigned_abs()..=self.ell_max() {
                    keys.push(ModeKey::new(m, ell));
                }
            } else {
                keys.push(ModeKey::new(m, 0));
            }
        }
        keys
    }

    /// 标量统一使用本征维数（标量布局与维数无关）
    pub fn normalize_sig(&self, sig: TensorSig) -> TensorSig {
        if sig.rank == 0 {
            TensorSig::scalar(self.geometry.native_dim())
        } else {
            sig
        }
    }

    /// 校验张量维数
    pub fn check_dim(&self, dim: usize) -> CvResult<()> {
        ensure!(
            self.geometry.allows_dim(dim),
            CvError::configuration(format!("{} 不支持分量维数 {dim}", self.geometry))
        );
        Ok(())
    }

    // =========================================================================
    // 布局
    // =========================================================================

    /// 球体正则性表
    pub fn regularity(&self, key: ModeKey, rank: usize) -> CvResult<Arc<RegularityTable>> {
        if let Some(t) = self.caches.regularity.read().get(&(key, rank)) {
            return Ok(t.clone());
        }
        let table = Arc::new(regularity_table(key.m, key.ell, rank, self.tolerance.rank)?);
        self.caches
            .regularity
            .write()
            .entry((key, rank))
            .or_insert_with(|| table.clone());
        Ok(table)
    }

    /// 单个模式组的块布局
    pub fn block(&self, sig: TensorSig, key: ModeKey) -> CvResult<Arc<BlockLayout>> {
        self.check_dim(sig.dim)?;
        let cache_key = (sig.dim, sig.rank, key);
        if let Some(b) = self.caches.blocks.read().get(&cache_key) {
            return Ok(b.clone());
        }
        let one = Complex64::new(1.0, 0.0);
        let columns = match self.geometry {
            Geometry::Ball { .. } => {
                let family = self.geometry.radial_family();
                let table = self.regularity(key, sig.rank)?;
                table
                    .columns
                    .iter()
                    .map(|c| Column {
                        spins: c
                            .weights
                            .iter()
                            .enumerate()
                            .filter(|(_, w)| w.norm() > 1e-14)
                            .map(|(i, &w)| (i, w))
                            .collect(),
                        lambda: c.lambda,
                        count: family.map_or(0, |f| f.mode_count(c.lambda, self.shape[2])),
                        offset: 0,
                    })
                    .collect()
            }
            _ => {
                let count = self.shape[2];
                (0..sig.ncomp())
                    .filter(|&c| {
                        !self.geometry.has_theta() || {
                            let s: i32 = sig
                                .indices(c)
                                .iter()
                                .map(|&i| slot_spin(sig.dim, i))
                                .sum();
                            s.unsigned_abs() <= key.ell
                        }
                    })
                    .map(|c| Column {
                        spins: smallvec![(c, one)],
                        lambda: 0,
                        count,
                        offset: 0,
                    })
                    .collect()
            }
        };
        let block = Arc::new(BlockLayout::new(key, sig, columns));
        self.caches
            .blocks
            .write()
            .entry(cache_key)
            .or_insert_with(|| block.clone());
        Ok(block)
    }

    /// 完整系数布局
    pub fn layout(&self, sig: TensorSig, angular: bool) -> CvResult<Arc<FieldLayout>> {
        let cache_key = (sig.dim, sig.rank, angular);
        if let Some(l) = self.caches.layouts.read().get(&cache_key) {
            return Ok(l.clone());
        }
        let blocks = self
            .mode_keys(angular)
            .into_iter()
            .map(|k| self.block(sig, k))
            .collect::<CvResult<Vec<_>>>()?;
        let layout = Arc::new(FieldLayout::new(sig, angular, blocks));
        self.caches
            .layouts
            .write()
            .entry(cache_key)
            .or_insert_with(|| layout.clone());
        Ok(layout)
    }

    // =========================================================================
    // 网格
    // =========================================================================

    /// 给定缩放下的网格尺寸 `(Nφ_s, Nθ_s, Nr_s)`
    pub fn grid_shape(&self, scales: Scales) -> CvResult<[usize; 3]> {
        let mut out = [1usize; 3];
        let used = [true, self.geometry.has_theta(), self.geometry.has_radius()];
        for axis in 0..3 {
            if !used[axis] {
                continue;
            }
            let s = scales[axis];
            ensure!(
                s >= 1.0 - 1e-12 && s.is_finite(),
                CvError::configuration(format!("网格缩放必须 ≥ 1: 轴 {axis}, {s}"))
            );
            out[axis] = ((self.shape[axis] as f64) * s).round().max(1.0) as usize;
        }
        Ok(out)
    }

    /// 变换计划
    pub fn plan(&self, scales: Scales) -> CvResult<Arc<TransformPlan>> {
        let shape = self.grid_shape(scales)?;
        if let Some(p) = self.caches.plans.read().get(&shape) {
            return Ok(p.clone());
        }
        let plan = Arc::new(TransformPlan::new(self, shape));
        self.caches
            .plans
            .write()
            .entry(shape)
            .or_insert_with(|| plan.clone());
        Ok(plan)
    }

    /// `n` 点径向求积网格
    pub fn radial_grid(&self, n: usize) -> Arc<RadialGrid> {
        let family = self.geometry.radial_family();
        let n = if family.is_some() { n.max(1) } else { 1 };
        if let Some(g) = self.caches.radial_grids.read().get(&n) {
            return g.clone();
        }
        let grid = Arc::new(match family {
            Some(f) => {
                let (q, r) = f.quadrature(n);
                RadialGrid {
                    r,
                    weights: q.weights,
                    family,
                }
            }
            None => RadialGrid {
                r: vec![self.geometry.outer_radius()],
                weights: vec![1.0],
                family: None,
            },
        });
        self.caches
            .radial_grids
            .write()
            .entry(n)
            .or_insert_with(|| grid.clone());
        grid
    }

    /// 算子矩阵投影用的径向网格
    pub fn operator_grid(&self) -> Arc<RadialGrid> {
        self.radial_grid(2 * self.shape[2] + self.quadrature_padding)
    }

    /// 网格积分权重
    pub fn grid_weights(&self, scales: Scales) -> CvResult<GridWeights> {
        let plan = self.plan(scales)?;
        let [nphi, _, _] = plan.shape();
        let (phi, theta, r) = match self.geometry {
            Geometry::Circle { radius } => (2.0 * PI * radius / nphi as f64, vec![1.0], vec![1.0]),
            Geometry::Sphere { radius } => (
                2.0 * PI / nphi as f64,
                plan.theta_weights().iter().map(|w| w * radius * radius).collect(),
                vec![1.0],
            ),
            Geometry::Ball { radius } => (
                2.0 * PI / nphi as f64,
                plan.theta_weights().to_vec(),
                plan.radial().weights.iter().map(|w| w * radius.powi(3) / 3.0).collect(),
            ),
            Geometry::Shell { inner, outer } => (
                2.0 * PI / nphi as f64,
                plan.theta_weights().to_vec(),
                plan.radial()
                    .weights
                    .iter()
                    .zip(&plan.radial().r)
                    .map(|(w, r)| w * (outer - inner) * r * r)
                    .collect(),
            ),
        };
        Ok(GridWeights { phi, theta, r })
    }

    // =========================================================================
    // 算子缓存
    // =========================================================================

    /// 查找或构建算子矩阵
    pub(crate) fn operator_or_insert(
        &self,
        key: OperatorKey,
        build: impl FnOnce() -> CvResult<CsrMatrixC64>,
    ) -> CvResult<Arc<CsrMatrixC64>> {
        if let Some(m) = self.caches.operators.read().get(&key) {
            return Ok(m.clone());
        }
        let matrix = Arc::new(build()?);
        Ok(self
            .caches
            .operators
            .write()
            .entry(key)
            .or_insert(matrix)
            .clone())
    }
}

// =============================================================================
// 注册表
// =============================================================================

/// 基的配置键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RegistryKey {
    geometry: [u64; 3],
    kind: u8,
    shape: [usize; 3],
    dealias: [u64; 3],
}

impl RegistryKey {
    fn new(geometry: Geometry, shape: [usize; 3], dealias: Scales) -> Self {
        let (kind, g) = match geometry {
            Geometry::Circle { radius } => (0, [radius, 0.0, 0.0]),
            Geometry::Sphere { radius } => (1, [radius, 0.0, 0.0]),
            Geometry::Ball { radius } => (2, [radius, 0.0, 0.0]),
            Geometry::Shell { inner, outer } => (3, [inner, outer, 0.0]),
        };
        Self {
            geometry: g.map(f64::to_bits),
            kind,
            shape,
            dealias: dealias.map(f64::to_bits),
        }
    }
}

/// 基注册表：同一配置只构造一次
#[derive(Default)]
pub struct BasisRegistry {
    bases: RwLock<HashMap<RegistryKey, Arc<Basis>>>,
}

impl BasisRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或创建基
    pub fn get(&self, geometry: Geometry, shape: [usize; 3], dealias: Scales) -> CvResult<Arc<Basis>> {
        let key = RegistryKey::new(geometry, shape, dealias);
        if let Some(b) = self.bases.read().get(&key) {
            return Ok(b.clone());
        }
        let basis = Arc::new(Basis::new(geometry, shape, dealias)?);
        log::debug!("注册基 {basis}");
        Ok(self.bases.write().entry(key).or_insert(basis).clone())
    }

    /// 某个体基的边界球面
    pub fn surface(&self, basis: &Basis, radius: f64) -> CvResult<Arc<Basis>> {
        ensure!(
            basis.geometry().has_radius(),
            CvError::configuration(format!("{} 没有径向边界", basis.geometry()))
        );
        let shape = basis.shape();
        let dealias = basis.dealias();
        self.get(
            Geometry::Sphere { radius },
            [shape[0], shape[1], 1],
            [dealias[0], dealias[1], 1.0],
        )
    }

    /// 已注册的基数量
    pub fn len(&self) -> usize {
        self.bases.read().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.bases.read().is_empty()
    }
}
