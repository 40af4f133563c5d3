// crates/cv_engine/src/ncc.rs

//! 非常系数（NCC）矩阵
//!
//! 对角向常数的系数场 `C` 与算子作用对象 `V`，乘积 `C ⊗ V`（或 `V ⊗ C`、点积、叉积）
//! 在每个模式组上是一个稀疏矩阵：
//!
//! 1. 取 `C` 在 `(0, 0)` 块的径向系数，删去小于 `ncc_cutoff · max|c|` 的项，
//!    每列至多保留前 `max_ncc_terms` 项；
//! 2. 在去混叠径向求积网格上求 `C` 的自旋分量剖面（乘以 `Y^0_00`）；
//! 3. 对 `V` 块的每个单位列逐点做自旋标架下的双线性运算；
//! 4. 投影到乘积块，删去小于 `entry_cutoff · max|A|` 的元素。
//!
//! 所用求积与直接求值时的去混叠网格相同，因而两条路径给出同一个 L2 投影。
//!
//! 矩阵缓存只追加；系数场改变后需显式调用 [`NccCache::regenerate`]。

use crate::basis::{Basis, RadialGrid};
use crate::expr::{Expr, LinearForm};
use crate::field::{Field, FieldMeta};
use crate::operators::{pointwise, project, Profiles};
use cv_config::NccConfig;
use cv_foundation::{ensure, CvError, CvResult, ModeKey};
use cv_spectral::csr::CsrMatrixC64;
use cv_spectral::tensor::{Bilinear, Frame, TensorSig};
use num_complex::Complex64;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::f64::consts::FRAC_1_SQRT_2;
use std::sync::Arc;
use uuid::Uuid;

const ZERO: Complex64 = Complex64 { re: 0.0, im: 0.0 };

/// 系数场在乘积中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NccSide {
    /// `C ⊗ V`
    Left,
    /// `V ⊗ C`
    Right,
}

/// 矩阵缓存键：系数场、作用对象的形状、乘积种类、模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NccKey {
    /// 系数场标识
    pub coef: Uuid,
    /// 作用对象分量维数
    pub dim: usize,
    /// 作用对象阶数
    pub rank: usize,
    /// 乘积种类
    pub product: Bilinear,
    /// 系数场位置
    pub side: NccSide,
    /// 模式
    pub mode: ModeKey,
}

/// 系数场在去混叠径向网格上的自旋分量剖面
#[derive(Debug)]
struct CoefProfile {
    revision: u64,
    grid: Arc<RadialGrid>,
    values: Vec<Vec<Complex64>>,
}

/// NCC 矩阵缓存（只追加）
#[derive(Debug)]
pub struct NccCache {
    config: NccConfig,
    profiles: RwLock<HashMap<Uuid, Arc<CoefProfile>>>,
    matrices: RwLock<HashMap<NccKey, Arc<CsrMatrixC64>>>,
}

impl Default for NccCache {
    fn default() -> Self {
        Self::new(NccConfig::default())
    }
}

impl NccCache {
    /// 创建空缓存
    pub fn new(config: NccConfig) -> Self {
        Self {
            config,
            profiles: RwLock::new(HashMap::new()),
            matrices: RwLock::new(HashMap::new()),
        }
    }

    /// 截断参数
    pub fn config(&self) -> &NccConfig {
        &self.config
    }

    /// 已缓存矩阵个数
    pub fn len(&self) -> usize {
        self.matrices.read().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.matrices.read().is_empty()
    }

    /// 是否已缓存某个键
    pub fn contains(&self, key: &NccKey) -> bool {
        self.matrices.read().contains_key(key)
    }

    /// 已缓存的矩阵
    pub fn get(&self, key: &NccKey) -> Option<Arc<CsrMatrixC64>> {
        self.matrices.read().get(key).cloned()
    }

    /// 全部缓存键
    pub fn keys(&self) -> Vec<NccKey> {
        self.matrices.read().keys().copied().collect()
    }

    /// 丢弃与某个系数场相关的全部剖面与矩阵，返回删除的矩阵个数
    pub fn regenerate(&self, coef: Uuid) -> usize {
        self.profiles.write().remove(&coef);
        let mut matrices = self.matrices.write();
        let before = matrices.len();
        matrices.retain(|k, _| k.coef != coef);
        let removed = before - matrices.len();
        log::debug!("重建 NCC {coef}: 丢弃 {removed} 个矩阵");
        removed
    }

    /// 查找或构建 NCC 矩阵（作用对象块 → 乘积块）
    pub fn matrix(
        &self,
        coef: &Field,
        operand_basis: &Basis,
        operand_sig: TensorSig,
        product: Bilinear,
        side: NccSide,
        key: ModeKey,
    ) -> CvResult<Arc<CsrMatrixC64>> {
        let operand_sig = operand_basis.normalize_sig(operand_sig);
        let cache_key = NccKey {
            coef: coef.id(),
            dim: operand_sig.dim,
            rank: operand_sig.rank,
            product,
            side,
            mode: key,
        };
        if let Some(m) = self.matrices.read().get(&cache_key) {
            return Ok(m.clone());
        }
        let profile = self.profile(coef, operand_basis)?;
        let matrix = Arc::new(build_ncc_matrix(
            &profile,
            coef.sig(),
            operand_basis,
            operand_sig,
            product,
            side,
            key,
            self.config.entry_cutoff,
        )?);
        log::trace!(
            "NCC {} {:?}/{:?} {key}: {}x{} nnz={}",
            coef.name(),
            product,
            side,
            matrix.n_rows(),
            matrix.n_cols(),
            matrix.nnz()
        );
        Ok(self
            .matrices
            .write()
            .entry(cache_key)
            .or_insert(matrix)
            .clone())
    }

    fn profile(&self, coef: &Field, operand_basis: &Basis) -> CvResult<Arc<CoefProfile>> {
        if let Some(p) = self.profiles.read().get(&coef.id()) {
            if p.revision != coef.revision() {
                log::warn!(
                    "NCC 系数 {} 已修改 (修订 {} → {})，沿用缓存矩阵；需要时调用 regenerate",
                    coef.name(),
                    p.revision,
                    coef.revision()
                );
            }
            return Ok(p.clone());
        }
        let profile = Arc::new(coef_profile(coef, operand_basis, &self.config)?);
        Ok(self
            .profiles
            .write()
            .entry(coef.id())
            .or_insert(profile)
            .clone())
    }
}

// =============================================================================
// 构建
// =============================================================================

/// 截断后的系数剖面
fn coef_profile(coef: &Field, operand_basis: &Basis, config: &NccConfig) -> CvResult<CoefProfile> {
    ensure!(
        !coef.angular(),
        CvError::unsupported_ncc(format!("NCC 系数 {} 含角向依赖", coef.name()))
    );
    let basis = coef.basis();
    ensure!(
        basis.geometry() == operand_basis.geometry() && basis.same_angular(operand_basis),
        CvError::configuration(format!(
            "NCC 系数 {} 与作用对象不在同一离散空间",
            coef.name()
        ))
    );
    let key = ModeKey::new(0, 0);
    let block = coef.block(key)?.unwrap_or_default();
    let (layout, _) = coef
        .layout()
        .block(key)
        .ok_or_else(|| CvError::internal(format!("NCC 系数 {} 缺少 (0,0) 块", coef.name())))?;

    let nr = basis.grid_shape(basis.dealias())?[2];
    let grid = basis.radial_grid(nr);
    let ncomp = coef.sig().ncomp();
    let y00 = if basis.geometry().has_theta() { FRAC_1_SQRT_2 } else { 1.0 };
    let mut values = vec![vec![ZERO; grid.len()]; ncomp];

    let scale = block.iter().map(|c| c.norm()).fold(0.0, f64::max);
    let threshold = config.ncc_cutoff * scale;
    let mut dropped = 0usize;
    let mut kept_total = 0usize;
    for col in &layout.columns {
        let coeffs = &block[col.offset..col.offset + col.count];
        let mut kept: Vec<(usize, Complex64)> = coeffs
            .iter()
            .enumerate()
            .filter(|(_, c)| c.norm() > threshold)
            .map(|(n, &c)| (n, c))
            .collect();
        dropped += col.count - kept.len();
        if let Some(max_terms) = config.max_ncc_terms {
            if kept.iter().any(|&(n, _)| n >= max_terms) {
                log::warn!(
                    "NCC 系数 {} 的径向展开被截断到前 {max_terms} 项",
                    coef.name()
                );
            }
            kept.retain(|&(n, _)| n < max_terms);
        }
        kept_total += kept.len();
        let table = grid.eval(col.lambda, col.count);
        for &(tau, q) in &col.spins {
            for &(n, c) in &kept {
                let w = q * c * y00;
                for (k, v) in values[tau].iter_mut().enumerate() {
                    *v += w * table.values[n][k];
                }
            }
        }
    }
    log::debug!(
        "NCC 系数 {}: 保留 {kept_total} 项, 截断 {dropped} 项",
        coef.name()
    );
    Ok(CoefProfile {
        revision: coef.revision(),
        grid,
        values,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_ncc_matrix(
    profile: &CoefProfile,
    coef_sig: TensorSig,
    basis: &Basis,
    operand_sig: TensorSig,
    product: Bilinear,
    side: NccSide,
    key: ModeKey,
    entry_cutoff: f64,
) -> CvResult<CsrMatrixC64> {
    let dim = if coef_sig.rank > 0 { coef_sig.dim } else { operand_sig.dim };
    ensure!(
        coef_sig.rank == 0 || operand_sig.rank == 0 || coef_sig.dim == operand_sig.dim,
        CvError::configuration("NCC 系数与作用对象的分量维数不同")
    );
    let (ra, rb) = match side {
        NccSide::Left => (coef_sig.rank, operand_sig.rank),
        NccSide::Right => (operand_sig.rank, coef_sig.rank),
    };
    let out_sig = basis.normalize_sig(TensorSig::new(dim, product.output_rank(dim, ra, rb)?));
    let in_block = basis.block(operand_sig, key)?;
    let out_block = basis.block(out_sig, key)?;
    let n_coef = coef_sig.ncomp();

    let apply = |p: &Profiles| -> CvResult<Vec<Vec<Complex64>>> {
        // [C 的分量 | V 的分量] 拼接后逐点计算
        let mut joined = Vec::with_capacity(n_coef + p.vals.len());
        joined.extend(profile.values.iter().cloned());
        joined.extend(p.vals.iter().cloned());
        pointwise(&joined, |v| {
            let (c, u) = v.split_at(n_coef);
            match side {
                NccSide::Left => product.apply(Frame::Spin, dim, ra, c, rb, u),
                NccSide::Right => product.apply(Frame::Spin, dim, ra, u, rb, c),
            }
        })
    };
    project(
        entry_cutoff,
        &profile.grid,
        &in_block,
        &out_block,
        operand_sig.ncomp(),
        apply,
    )
}

// =============================================================================
// NCC 表达式
// =============================================================================

/// 已准备好矩阵求值的表达式
#[derive(Debug, Clone)]
pub struct NccExpression {
    expr: Expr,
    vars: Vec<Field>,
    cache: Arc<NccCache>,
}

impl NccExpression {
    /// 准备表达式（把不含变量的乘积因子求值为场）
    pub fn new(expr: &Expr, vars: &[Field], cache: Arc<NccCache>) -> CvResult<Self> {
        let expr = expr.prepare_ncc(vars)?;
        Ok(Self {
            expr,
            vars: vars.to_vec(),
            cache,
        })
    }

    /// 准备后的表达式
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// 变量
    pub fn variables(&self) -> &[Field] {
        &self.vars
    }

    /// 缓存
    pub fn cache(&self) -> &Arc<NccCache> {
        &self.cache
    }

    /// 某个模式上的线性形式
    pub fn linear_form(&self, key: ModeKey) -> CvResult<LinearForm> {
        self.expr.linear_form(&self.vars, key, &self.cache)
    }

    /// 在给定模式上构建并缓存 NCC 矩阵，返回新增的矩阵个数
    ///
    /// 已存在的键不会重建；重复调用返回 0。
    pub fn store_ncc_matrices(&self, keys: impl IntoIterator<Item = ModeKey>) -> CvResult<usize> {
        let before = self.cache.len();
        for key in keys {
            self.linear_form(key)?;
        }
        Ok(self.cache.len() - before)
    }

    /// 在全部模式上存储
    pub fn store_all(&self) -> CvResult<usize> {
        let keys = self.expr.shape()?.mode_keys()?;
        self.store_ncc_matrices(keys)
    }

    /// 用缓存矩阵作用于变量当前系数
    pub fn evaluate_as_ncc(&self) -> CvResult<Field> {
        let shape = self.expr.shape()?;
        let meta: FieldMeta = shape.meta()?;
        let layout = meta.layout()?;
        let var_coeffs = self
            .vars
            .iter()
            .map(|v| v.coefficients())
            .collect::<CvResult<Vec<_>>>()?;
        let mut out = vec![ZERO; layout.size()];
        for block in layout.blocks() {
            let key = block.key;
            let form = self.linear_form(key)?;
            let mut acc = vec![ZERO; block.size];
            for ((var, coeffs), m) in self.vars.iter().zip(&var_coeffs).zip(&form.blocks) {
                let (Some(m), Some(x)) = (m, var.layout().extract(coeffs, key)) else {
                    continue;
                };
                m.mul_vec_add(Complex64::new(1.0, 0.0), x, &mut acc);
            }
            layout.insert(&mut out, key, &acc)?;
        }
        Field::from_coefficients("ncc", meta, out)
    }
}

impl Expr {
    /// 以新缓存准备 NCC 表达式
    pub fn as_ncc(&self, vars: &[Field], config: NccConfig) -> CvResult<NccExpression> {
        NccExpression::new(self, vars, Arc::new(NccCache::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{grad, mul};
    use std::sync::Arc;

    fn ball() -> Arc<Basis> {
        Arc::new(Basis::ball(1.5, [8, 8, 10], 1.5).unwrap())
    }

    fn radial(name: &str, basis: &Arc<Basis>, f: impl Fn(f64) -> f64) -> Field {
        let field = Field::with_meta(name, FieldMeta::new(basis, 0).radial_only()).unwrap();
        field
            .set_grid_from_fn(|_, _, r| vec![Complex64::new(f(r), 0.0)])
            .unwrap();
        field
    }

    #[test]
    fn test_scalar_ncc_matrix_is_banded() {
        let basis = ball();
        let f = radial("f", &basis, |r| r * r);
        let u = Field::scalar("u", &basis).unwrap();
        f.as_ncc(&[u.clone()]).unwrap();
        let cache = NccCache::default();
        let m = cache
            .matrix(&f, &basis, u.sig(), Bilinear::Product, NccSide::Left, ModeKey::new(1, 2))
            .unwrap();
        // r² 乘法只耦合相邻径向阶
        for i in 0..m.n_rows() {
            for (j, _) in m.row(i).iter() {
                assert!((i as i64 - j as i64).abs() <= 1);
            }
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_regenerate_drops_matrices() {
        let basis = ball();
        let f = radial("f", &basis, |r| 1.0 + r * r);
        let u = Field::scalar("u", &basis).unwrap();
        let expr = mul(f.clone(), u.clone());
        let ncc = expr.as_ncc(&[u.clone()], NccConfig::default()).unwrap();
        let stored = ncc.store_all().unwrap();
        assert_eq!(stored, basis.mode_keys(true).len());
        assert_eq!(ncc.store_all().unwrap(), 0);
        assert_eq!(ncc.cache().regenerate(f.id()), stored);
        assert!(ncc.cache().is_empty());
    }

    #[test]
    fn test_angular_coefficient_rejected() {
        let basis = ball();
        let f = Field::scalar("f", &basis).unwrap();
        f.set_grid_from_fn(|phi, theta, r| vec![Complex64::new(r * theta.sin() * phi.cos(), 0.0)])
            .unwrap();
        let u = Field::scalar("u", &basis).unwrap();
        let err = mul(f, grad(u.clone()))
            .as_ncc(&[u], NccConfig::default())
            .unwrap_err();
        assert!(matches!(err, CvError::UnsupportedNccExpression { .. }));
    }

    #[test]
    fn test_max_terms_truncation() {
        let basis = ball();
        let f = radial("f", &basis, |r| (r * r).exp());
        let u = Field::scalar("u", &basis).unwrap();
        let full = NccCache::default();
        let truncated = NccCache::new(NccConfig {
            max_ncc_terms: Some(1),
            ..NccConfig::default()
        });
        let key = ModeKey::new(0, 1);
        let a = full
            .matrix(&f, &basis, u.sig(), Bilinear::Product, NccSide::Left, key)
            .unwrap();
        let b = truncated
            .matrix(&f, &basis, u.sig(), Bilinear::Product, NccSide::Left, key)
            .unwrap();
        // 只保留常数项时矩阵是对角的
        assert!(b.nnz() <= b.n_rows());
        assert!(a.nnz() > b.nnz());
    }
}
