// crates/cv_engine/src/problem.rs

//! 问题定义与子问题分解
//!
//! 用户登记变量与方程（构造 API 或文本），`build()` 把方程组按模式组
//! `(m, ℓ)` 拆成互相独立的子问题，每个子问题持有：
//!
//! - `M`：时间导数项矩阵
//! - `L`：其余线性项矩阵
//! - 变量列区间与方程行区间
//!
//! # 全局编号
//!
//! 全局行（列）是各子问题行（列）块按模式顺序的拼接，
//! [`SubproblemSet::row_ranges`] 给出各子问题占据的区间。
//!
//! # 边界条件
//!
//! `add_bc` 为边界方程创建隐藏的 tau 变量（定义在边界基上），并把
//! `lift(tau, host_basis, n)` 加到宿主方程左端；同一宿主的第 k 个 tau
//! 提升到径向模式 `n = -k`。

use crate::basis::Basis;
use crate::expr::{lift, Expr, ExprShape};
use crate::field::{Field, FieldMeta};
use crate::ncc::{NccCache, NccExpression};
use crate::parser::{self, Namespace};
use cv_config::{MatSolverKind, SolverConfig};
use cv_foundation::{ensure, CvError, CvResult, ModeKey};
use cv_spectral::csr::{CsrBuilder, CsrMatrixC64, CsrTriplets};
use cv_spectral::lu::{self, LuError, LuStrategy, MatrixSolver};
use num_complex::Complex64;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const ZERO: Complex64 = Complex64 { re: 0.0, im: 0.0 };
const ONE: Complex64 = Complex64 { re: 1.0, im: 0.0 };

// =============================================================================
// 条件
// =============================================================================

/// 条件中的模式变量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeVar {
    /// 方位阶数
    M,
    /// 角度阶数
    Ell,
}

/// 比较运算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// ==
    Eq,
    /// !=
    Ne,
    /// <
    Lt,
    /// <=
    Le,
    /// >
    Gt,
    /// >=
    Ge,
}

/// 方程在哪些模式上生效
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Condition {
    /// 全部模式
    #[default]
    Always,
    /// 比较
    Compare {
        /// 变量
        var: ModeVar,
        /// 运算
        op: CmpOp,
        /// 右端值
        value: i64,
    },
    /// 与
    And(Box<Condition>, Box<Condition>),
    /// 或
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// `ell == value`
    pub fn ell_eq(value: u32) -> Self {
        Self::Compare {
            var: ModeVar::Ell,
            op: CmpOp::Eq,
            value: value as i64,
        }
    }

    /// `ell != value`
    pub fn ell_ne(value: u32) -> Self {
        Self::Compare {
            var: ModeVar::Ell,
            op: CmpOp::Ne,
            value: value as i64,
        }
    }

    /// 与
    pub fn and(self, other: Condition) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// 或
    pub fn or(self, other: Condition) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// 在模式 `key` 上是否成立
    pub fn holds(&self, key: ModeKey) -> bool {
        match self {
            Self::Always => true,
            Self::Compare { var, op, value } => {
                let x = match var {
                    ModeVar::M => key.m as i64,
                    ModeVar::Ell => key.ell as i64,
                };
                match op {
                    CmpOp::Eq => x == *value,
                    CmpOp::Ne => x != *value,
                    CmpOp::Lt => x < *value,
                    CmpOp::Le => x <= *value,
                    CmpOp::Gt => x > *value,
                    CmpOp::Ge => x >= *value,
                }
            }
            Self::And(a, b) => a.holds(key) && b.holds(key),
            Self::Or(a, b) => a.holds(key) || b.holds(key),
        }
    }
}

// =============================================================================
// 方程
// =============================================================================

/// 一条方程 `lhs = rhs`
#[derive(Debug, Clone)]
pub struct Equation {
    /// 左端（关于变量线性）
    pub lhs: Expr,
    /// 右端（显式求值）
    pub rhs: Expr,
    /// 生效条件
    pub condition: Condition,
    /// 是否为边界方程
    pub boundary: bool,
}

/// 分解后的方程
#[derive(Debug, Clone)]
pub(crate) struct PreparedEquation {
    pub(crate) m: Option<Expr>,
    pub(crate) l: Option<Expr>,
    pub(crate) rhs: Expr,
    pub(crate) condition: Condition,
    pub(crate) shape: ExprShape,
}

impl PreparedEquation {
    fn rows(&self, key: ModeKey) -> CvResult<usize> {
        if self.condition.holds(key) {
            self.shape.block_size(key)
        } else {
            Ok(0)
        }
    }

    fn touches(&self, field: &Field) -> bool {
        let fs = std::slice::from_ref(field);
        self.m.as_ref().is_some_and(|e| e.contains_var(fs))
            || self.l.as_ref().is_some_and(|e| e.contains_var(fs))
    }
}

// =============================================================================
// Problem
// =============================================================================

/// 方程组定义
#[derive(Debug)]
pub struct Problem {
    variables: Vec<Field>,
    n_user_vars: usize,
    equations: Vec<Equation>,
    lift_counts: HashMap<usize, i32>,
    namespace: Namespace,
    config: SolverConfig,
}

impl Problem {
    /// 以变量列表创建
    pub fn new(variables: &[Field]) -> Self {
        let mut namespace = Namespace::new();
        for v in variables {
            namespace.insert_field(v);
        }
        if let Some(b) = variables.iter().map(|v| v.basis()).find(|b| b.geometry().has_radius()) {
            namespace.set_lift_basis(b);
        }
        Self {
            variables: variables.to_vec(),
            n_user_vars: variables.len(),
            equations: Vec::new(),
            lift_counts: HashMap::new(),
            namespace,
            config: SolverConfig::default(),
        }
    }

    /// 设置求解器配置
    pub fn with_config(mut self, config: SolverConfig) -> Self {
        self.config = config;
        self
    }

    /// 配置
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// 全部变量（用户变量在前，tau 在后）
    pub fn variables(&self) -> &[Field] {
        &self.variables
    }

    /// 用户变量
    pub fn user_variables(&self) -> &[Field] {
        &self.variables[..self.n_user_vars]
    }

    /// 自动创建的 tau 变量
    pub fn taus(&self) -> &[Field] {
        &self.variables[self.n_user_vars..]
    }

    /// 方程
    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    /// 文本方程使用的名称空间
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// 可修改的名称空间（登记 NCC 场、常数等）
    pub fn namespace_mut(&mut self) -> &mut Namespace {
        &mut self.namespace
    }

    /// 添加方程，返回编号
    pub fn add_equation(&mut self, lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> usize {
        self.add_equation_if(lhs, rhs, Condition::Always)
    }

    /// 添加带条件的方程
    pub fn add_equation_if(
        &mut self,
        lhs: impl Into<Expr>,
        rhs: impl Into<Expr>,
        condition: Condition,
    ) -> usize {
        self.equations.push(Equation {
            lhs: lhs.into(),
            rhs: rhs.into(),
            condition,
            boundary: false,
        });
        self.equations.len() - 1
    }

    /// 解析 `"lhs = rhs"` 并添加；`condition` 为空表示恒成立
    pub fn add_equation_str(&mut self, equation: &str, condition: &str) -> CvResult<usize> {
        let (lhs, rhs) = parser::parse_equation(equation, &self.namespace)?;
        let condition = parser::parse_condition(condition)?;
        Ok(self.add_equation_if(lhs, rhs, condition))
    }

    /// 添加边界方程，返回为其创建的 tau 变量
    pub fn add_bc(&mut self, lhs: impl Into<Expr>, rhs: impl Into<Expr>, host: usize) -> CvResult<Field> {
        let lhs = lhs.into();
        let shape = lhs.shape()?;
        let boundary = shape
            .basis
            .clone()
            .ok_or_else(|| CvError::configuration(format!("边界方程左端是常数: {lhs}")))?;
        let host_eq = self
            .equations
            .get(host)
            .ok_or_else(|| CvError::configuration(format!("宿主方程 {host} 不存在")))?;
        let host_basis: Arc<Basis> = host_eq
            .lhs
            .shape()?
            .basis
            .ok_or_else(|| CvError::configuration("宿主方程左端是常数"))?;

        let tau_meta = FieldMeta {
            basis: boundary,
            sig: shape.sig,
            dtype: shape.dtype,
            angular: true,
        };
        let tau = Field::with_meta(format!("tau_{}", self.taus().len() + 1), tau_meta)?;
        let count = self.lift_counts.entry(host).or_insert(0);
        *count += 1;
        let n = -*count;

        let host_eq = &mut self.equations[host];
        let old = std::mem::replace(&mut host_eq.lhs, Expr::Zero);
        host_eq.lhs = old + lift(&tau, &host_basis, n);
        log::debug!("方程 {host} 添加 tau {} (n = {n})", tau.name());

        self.namespace.insert_field(&tau);
        self.variables.push(tau.clone());
        self.equations.push(Equation {
            lhs,
            rhs: rhs.into(),
            condition: Condition::Always,
            boundary: true,
        });
        Ok(tau)
    }

    /// 解析边界方程文本并添加
    pub fn add_bc_str(&mut self, equation: &str, host: usize) -> CvResult<Field> {
        let (lhs, rhs) = parser::parse_equation(equation, &self.namespace)?;
        self.add_bc(lhs, rhs, host)
    }

    /// 分解方程（NCC 准备 + 时间拆分）
    fn prepare(&self) -> CvResult<Vec<PreparedEquation>> {
        self.equations
            .iter()
            .enumerate()
            .map(|(i, eq)| {
                let shape = eq.lhs.shape()?;
                let rhs_shape = eq.rhs.shape()?;
                ensure!(
                    rhs_shape.is_constant() || rhs_shape.sig == shape.sig,
                    CvError::configuration(format!(
                        "方程 {i} 两端形状不同: {} = {}",
                        eq.lhs, eq.rhs
                    ))
                );
                ensure!(
                    !eq.rhs.contains_dt(),
                    CvError::configuration(format!("方程 {i} 右端含时间导数"))
                );
                let (m, l) = eq.lhs.split_time()?;
                Ok(PreparedEquation {
                    m: m.map(|e| e.prepare_ncc(&self.variables)).transpose()?,
                    l: l.map(|e| e.prepare_ncc(&self.variables)).transpose()?,
                    rhs: eq.rhs.clone(),
                    condition: eq.condition.clone(),
                    shape,
                })
            })
            .collect()
    }

    /// 构建全部子问题
    pub fn build(&self) -> CvResult<SubproblemSet> {
        ensure!(
            !self.variables.is_empty(),
            CvError::configuration("问题没有变量")
        );
        ensure!(
            !self.equations.is_empty(),
            CvError::configuration("问题没有方程")
        );
        let equations = self.prepare()?;
        let ncc = Arc::new(NccCache::new(self.config.ncc.clone()));
        let keys = self.variables[0].basis().mode_keys(true);

        let assemble = |key: ModeKey| assemble_subproblem(key, &equations, &self.variables, &ncc);
        #[cfg(feature = "parallel")]
        let blocks = keys.par_iter().map(|&k| assemble(k)).collect::<CvResult<Vec<_>>>()?;
        #[cfg(not(feature = "parallel"))]
        let blocks = keys.iter().map(|&k| assemble(k)).collect::<CvResult<Vec<_>>>()?;

        let mut subproblems = Vec::with_capacity(blocks.len());
        let mut offset = 0;
        for (index, block) in blocks.into_iter().enumerate() {
            let size = block.size();
            subproblems.push(Subproblem {
                index,
                global: offset..offset + size,
                revision: 0,
                factors: Mutex::new(HashMap::new()),
                block,
            });
            offset += size;
        }
        log::info!(
            "构建 {} 个子问题: {} 个变量, {} 条方程, 总规模 {offset}, NCC 矩阵 {}",
            subproblems.len(),
            self.variables.len(),
            equations.len(),
            ncc.len()
        );
        Ok(SubproblemSet {
            subproblems,
            variables: self.variables.clone(),
            equations,
            ncc,
            config: self.config.clone(),
        })
    }
}

// =============================================================================
// 子问题
// =============================================================================

/// 单个模式组的矩阵与区间
#[derive(Debug, Clone)]
struct SubproblemBlock {
    key: ModeKey,
    var_ranges: Vec<Range<usize>>,
    eq_ranges: Vec<Range<usize>>,
    m: CsrMatrixC64,
    l: CsrMatrixC64,
}

impl SubproblemBlock {
    fn size(&self) -> usize {
        self.var_ranges.last().map_or(0, |r| r.end)
    }
}

/// `y = A x`，启用 `parallel` 特性时按行并行
fn apply(a: &CsrMatrixC64, x: &[Complex64]) -> Vec<Complex64> {
    let mut y = vec![ZERO; a.n_rows()];
    #[cfg(feature = "parallel")]
    a.mul_vec_parallel(x, &mut y);
    #[cfg(not(feature = "parallel"))]
    a.mul_vec(x, &mut y);
    y
}

fn add_form(
    builder: &mut CsrBuilder<Complex64>,
    expr: &Expr,
    rows: &Range<usize>,
    var_ranges: &[Range<usize>],
    vars: &[Field],
    key: ModeKey,
    ncc: &NccCache,
) -> CvResult<()> {
    let form = expr.linear_form(vars, key, ncc)?;
    for (block, cols) in form.blocks.iter().zip(var_ranges) {
        let Some(block) = block else {
            continue;
        };
        CvError::check_size("equation rows", rows.len(), block.n_rows())?;
        CvError::check_size("variable columns", cols.len(), block.n_cols())?;
        builder.add_block(rows.start, cols.start, block, ONE);
    }
    Ok(())
}

fn assemble_subproblem(
    key: ModeKey,
    equations: &[PreparedEquation],
    vars: &[Field],
    ncc: &NccCache,
) -> CvResult<SubproblemBlock> {
    let mut var_ranges = Vec::with_capacity(vars.len());
    let mut cols = 0;
    for v in vars {
        let n = v.layout().block(key).map_or(0, |(b, _)| b.size);
        var_ranges.push(cols..cols + n);
        cols += n;
    }
    let mut eq_ranges = Vec::with_capacity(equations.len());
    let mut rows = 0;
    for eq in equations {
        let n = eq.rows(key)?;
        eq_ranges.push(rows..rows + n);
        rows += n;
    }
    if rows != cols {
        return Err(CvError::inconsistent(key, rows, cols));
    }

    let mut mb = CsrBuilder::new(rows, cols);
    let mut lb = CsrBuilder::new(rows, cols);
    for (eq, range) in equations.iter().zip(&eq_ranges) {
        if range.is_empty() {
            continue;
        }
        if let Some(m) = &eq.m {
            add_form(&mut mb, m, range, &var_ranges, vars, key, ncc)?;
        }
        if let Some(l) = &eq.l {
            add_form(&mut lb, l, range, &var_ranges, vars, key, ncc)?;
        }
    }
    let (m, l) = (mb.build(), lb.build());
    log::trace!("子问题 {key}: 规模 {rows}, nnz(M)={}, nnz(L)={}", m.nnz(), l.nnz());
    Ok(SubproblemBlock {
        key,
        var_ranges,
        eq_ranges,
        m,
        l,
    })
}

/// 一个模式组的独立线性系统
#[derive(Debug)]
pub struct Subproblem {
    index: usize,
    global: Range<usize>,
    revision: u64,
    factors: Mutex<HashMap<(u64, u64), Arc<dyn MatrixSolver>>>,
    block: SubproblemBlock,
}

impl Subproblem {
    /// 模式键
    pub fn key(&self) -> ModeKey {
        self.block.key
    }

    /// 在集合中的序号
    pub fn index(&self) -> usize {
        self.index
    }

    /// 系统规模
    pub fn size(&self) -> usize {
        self.block.size()
    }

    /// 全局行（列）区间
    pub fn global_range(&self) -> Range<usize> {
        self.global.clone()
    }

    /// 第 `i` 个变量的列区间
    pub fn var_range(&self, i: usize) -> Range<usize> {
        self.block.var_ranges[i].clone()
    }

    /// 第 `i` 条方程的行区间（条件不成立时为空）
    pub fn eq_range(&self, i: usize) -> Range<usize> {
        self.block.eq_ranges[i].clone()
    }

    /// 时间导数矩阵
    pub fn m_matrix(&self) -> &CsrMatrixC64 {
        &self.block.m
    }

    /// 线性项矩阵
    pub fn l_matrix(&self) -> &CsrMatrixC64 {
        &self.block.l
    }

    /// 矩阵版本（NCC 重建时递增）
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// 是否含时间导数项
    pub fn has_time_derivative(&self) -> bool {
        self.block.m.nnz() > 0
    }

    /// `M x`
    pub fn apply_m(&self, x: &[Complex64]) -> Vec<Complex64> {
        apply(&self.block.m, x)
    }

    /// `L x`
    pub fn apply_l(&self, x: &[Complex64]) -> Vec<Complex64> {
        apply(&self.block.l, x)
    }

    /// 收集变量在本模式上的系数
    pub fn gather(&self, vars: &[Field]) -> CvResult<Vec<Complex64>> {
        let mut x = vec![ZERO; self.size()];
        for (v, range) in vars.iter().zip(&self.block.var_ranges) {
            if range.is_empty() {
                continue;
            }
            if let Some(b) = v.block(self.key())? {
                x[range.clone()].copy_from_slice(&b);
            }
        }
        Ok(x)
    }

    /// 把解写回变量
    pub fn scatter(&self, vars: &[Field], x: &[Complex64]) -> CvResult<()> {
        CvError::check_size("subproblem solution", self.size(), x.len())?;
        for (v, range) in vars.iter().zip(&self.block.var_ranges) {
            if !range.is_empty() {
                v.set_block(self.key(), &x[range.clone()])?;
            }
        }
        Ok(())
    }

    /// 按方程右端场组装右端向量（`None` 表示该方程右端为零）
    pub fn rhs_vector(&self, rhs: &[Option<Field>]) -> CvResult<Vec<Complex64>> {
        let mut b = vec![ZERO; self.size()];
        for (f, range) in rhs.iter().zip(&self.block.eq_ranges) {
            let (Some(f), false) = (f, range.is_empty()) else {
                continue;
            };
            if let Some(block) = f.block(self.key())? {
                CvError::check_size("rhs block", range.len(), block.len())?;
                b[range.clone()].copy_from_slice(&block);
            }
        }
        Ok(b)
    }

    /// `(a M + b L)` 的分解，按 `(a, b)` 缓存
    pub fn factorization(
        &self,
        a: f64,
        b: f64,
        config: &SolverConfig,
    ) -> CvResult<Arc<dyn MatrixSolver>> {
        let cache_key = (a.to_bits(), b.to_bits());
        if let Some(f) = self.factors.lock().get(&cache_key) {
            return Ok(f.clone());
        }
        let matrix = if a == 0.0 {
            let mut l = self.block.l.clone();
            l.scale(Complex64::new(b, 0.0));
            l
        } else {
            let mut m = self.block.m.clone();
            m.scale(Complex64::new(a, 0.0));
            m.add_scaled(Complex64::new(b, 0.0), &self.block.l)
        };
        let strategy = match config.matsolver {
            MatSolverKind::DenseLu => LuStrategy::PartialPivot,
            MatSolverKind::DenseFullPivLu => LuStrategy::FullPivot,
        };
        let solver: Arc<dyn MatrixSolver> = lu::factorize(&matrix, strategy, config.pivot_tolerance)
            .map_err(|e| match e {
                LuError::Singular { pivot } => CvError::singular(self.key(), pivot),
                other => CvError::internal(format!("子问题 {}: {other}", self.key())),
            })?
            .into();
        log::debug!(
            "分解子问题 {} (a={a:.3e}, b={b:.3e}): 规模 {}, 主元 {:.3e}",
            self.key(),
            self.size(),
            solver.pivot()
        );
        self.factors.lock().insert(cache_key, solver.clone());
        Ok(solver)
    }

    /// 已缓存的分解个数
    pub fn cached_factorizations(&self) -> usize {
        self.factors.lock().len()
    }

    /// 丢弃全部已缓存的分解（矩阵本身保留）
    pub fn clear_factorizations(&self) {
        self.factors.lock().clear();
    }

    fn replace_block(&mut self, block: SubproblemBlock) {
        self.block = block;
        self.revision += 1;
        self.factors.lock().clear();
    }
}

// =============================================================================
// 子问题集合
// =============================================================================

/// 导出的子问题矩阵
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubproblemMatrices {
    /// 模式键
    pub key: ModeKey,
    /// 全局起始行
    pub offset: usize,
    /// 时间导数矩阵
    pub m: CsrTriplets<Complex64>,
    /// 线性项矩阵
    pub l: CsrTriplets<Complex64>,
}

/// 全部子问题
#[derive(Debug)]
pub struct SubproblemSet {
    subproblems: Vec<Subproblem>,
    variables: Vec<Field>,
    equations: Vec<PreparedEquation>,
    ncc: Arc<NccCache>,
    config: SolverConfig,
}

impl SubproblemSet {
    /// 子问题个数
    pub fn len(&self) -> usize {
        self.subproblems.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.subproblems.is_empty()
    }

    /// 子问题
    pub fn subproblems(&self) -> &[Subproblem] {
        &self.subproblems
    }

    /// 丢弃所有子问题的分解缓存
    pub fn clear_factorizations(&self) {
        for sp in &self.subproblems {
            sp.clear_factorizations();
        }
    }

    /// 按模式查找
    pub fn get(&self, key: ModeKey) -> Option<&Subproblem> {
        self.subproblems.iter().find(|s| s.key() == key)
    }

    /// 模式键序列
    pub fn keys(&self) -> Vec<ModeKey> {
        self.subproblems.iter().map(|s| s.key()).collect()
    }

    /// 变量（含 tau）
    pub fn variables(&self) -> &[Field] {
        &self.variables
    }

    /// NCC 缓存
    pub fn ncc_cache(&self) -> &Arc<NccCache> {
        &self.ncc
    }

    /// 配置
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// 全局规模
    pub fn total_size(&self) -> usize {
        self.subproblems.last().map_or(0, |s| s.global.end)
    }

    /// 各子问题的全局区间
    pub fn row_ranges(&self) -> Vec<Range<usize>> {
        self.subproblems.iter().map(|s| s.global_range()).collect()
    }

    /// 是否有方程含时间导数
    pub fn has_time_derivative(&self) -> bool {
        self.equations.iter().any(|e| e.m.is_some())
    }

    /// 求值全部方程右端
    pub fn evaluate_rhs(&self) -> CvResult<Vec<Option<Field>>> {
        self.equations
            .iter()
            .map(|eq| match &eq.rhs {
                Expr::Zero => Ok(None),
                Expr::Scalar(c) if *c == ZERO => Ok(None),
                rhs => {
                    let basis = eq
                        .shape
                        .basis
                        .as_ref()
                        .ok_or_else(|| CvError::internal("方程左端没有基"))?;
                    rhs.evaluate_on(basis).map(Some)
                }
            })
            .collect()
    }

    /// 全部子问题的右端向量
    pub fn rhs_vectors(&self) -> CvResult<Vec<Vec<Complex64>>> {
        let rhs = self.evaluate_rhs()?;
        self.subproblems.iter().map(|s| s.rhs_vector(&rhs)).collect()
    }

    /// 收集全部子问题的当前状态
    pub fn gather(&self) -> CvResult<Vec<Vec<Complex64>>> {
        self.subproblems.iter().map(|s| s.gather(&self.variables)).collect()
    }

    /// 写回全部子问题的状态
    pub fn scatter(&self, states: &[Vec<Complex64>]) -> CvResult<()> {
        CvError::check_size("subproblem states", self.len(), states.len())?;
        for (s, x) in self.subproblems.iter().zip(states) {
            s.scatter(&self.variables, x)?;
        }
        Ok(())
    }

    /// 重建与系数场 `coef` 有关的 NCC 矩阵，返回受影响的子问题数
    pub fn rebuild_ncc(&mut self, coef: &Field) -> CvResult<usize> {
        if !self.equations.iter().any(|e| e.touches(coef)) {
            return Ok(0);
        }
        let dropped = self.ncc.regenerate(coef.id());
        for sp in &mut self.subproblems {
            let block = assemble_subproblem(sp.key(), &self.equations, &self.variables, &self.ncc)?;
            CvError::check_size("rebuilt subproblem", sp.size(), block.size())?;
            sp.replace_block(block);
        }
        log::info!(
            "NCC {} 重建: 丢弃 {dropped} 个矩阵, 重组 {} 个子问题",
            coef.name(),
            self.len()
        );
        Ok(self.len())
    }

    /// 导出全部子问题矩阵
    pub fn export_matrices(&self) -> Vec<SubproblemMatrices> {
        self.subproblems
            .iter()
            .map(|s| SubproblemMatrices {
                key: s.key(),
                offset: s.global.start,
                m: s.block.m.to_triplets(),
                l: s.block.l.to_triplets(),
            })
            .collect()
    }

    /// 导出为 JSON
    pub fn export_json(&self) -> CvResult<String> {
        serde_json::to_string(&self.export_matrices())
            .map_err(|e| CvError::serialization(e.to_string()))
    }

    /// 导出到文件
    pub fn export_to_file<P: AsRef<Path>>(&self, path: P) -> CvResult<()> {
        let json = self.export_json()?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl NccExpression {
    /// 为子问题集合中的全部模式存储矩阵
    pub fn store_for(&self, subproblems: &SubproblemSet) -> CvResult<usize> {
        self.store_ncc_matrices(subproblems.keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{dt, interp, lap};

    fn ball() -> Arc<Basis> {
        Arc::new(Basis::ball(1.0, [8, 6, 6], 1.5).unwrap())
    }

    fn poisson(basis: &Arc<Basis>) -> (Problem, Field) {
        let u = Field::scalar("u", basis).unwrap();
        let mut problem = Problem::new(&[u.clone()]);
        let eq = problem.add_equation(lap(&u), 6.0);
        problem.add_bc(interp(&u, 1.0), 1.0, eq).unwrap();
        (problem, u)
    }

    #[test]
    fn test_condition_holds() {
        let c = Condition::ell_eq(0).or(Condition::ell_ne(0).and(Condition::Compare {
            var: ModeVar::M,
            op: CmpOp::Ge,
            value: 1,
        }));
        assert!(c.holds(ModeKey::new(0, 0)));
        assert!(c.holds(ModeKey::new(1, 2)));
        assert!(!c.holds(ModeKey::new(-1, 2)));
    }

    #[test]
    fn test_add_bc_lifts_into_host() {
        let basis = ball();
        let (problem, _) = poisson(&basis);
        assert_eq!(problem.taus().len(), 1);
        assert_eq!(problem.equations().len(), 2);
        assert!(problem.equations()[1].boundary);
        assert_eq!(problem.equations()[0].lhs.to_string(), "(lap(u) + lift(tau_1, -1))");
    }

    #[test]
    fn test_partition_is_contiguous() {
        let basis = ball();
        let (problem, _) = poisson(&basis);
        let set = problem.build().unwrap();
        assert_eq!(set.len(), basis.mode_keys(true).len());
        let mut next = 0;
        for (s, r) in set.subproblems().iter().zip(set.row_ranges()) {
            assert_eq!(r.start, next);
            assert_eq!(r.len(), s.size());
            assert_eq!(s.m_matrix().n_rows(), s.size());
            assert_eq!(s.l_matrix().n_cols(), s.size());
            next = r.end;
        }
        assert_eq!(next, set.total_size());
        assert!(!set.has_time_derivative());
    }

    #[test]
    fn test_inconsistent_equation_count() {
        let basis = ball();
        let u = Field::scalar("u", &basis).unwrap();
        let mut problem = Problem::new(&[u.clone()]);
        problem.add_equation(lap(&u), 0.0);
        problem.add_equation(interp(&u, 1.0), 0.0);
        match problem.build() {
            Err(CvError::InconsistentEquationSet { rows, cols, .. }) => assert_eq!(rows, cols + 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_equation_conditions_drop_rows() {
        let basis = ball();
        let u = Field::scalar("u", &basis).unwrap();
        let mut problem = Problem::new(&[u.clone()]);
        problem.add_equation_if(lap(&u), 0.0, Condition::ell_ne(0));
        problem.add_equation_if(Expr::from(&u), 0.0, Condition::ell_eq(0));
        let set = problem.build().unwrap();
        let s0 = set.get(ModeKey::new(0, 0)).unwrap();
        assert!(s0.eq_range(0).is_empty());
        assert_eq!(s0.eq_range(1).len(), s0.size());
        let s1 = set.get(ModeKey::new(0, 1)).unwrap();
        assert!(s1.eq_range(1).is_empty());
    }

    #[test]
    fn test_split_into_m_and_l() {
        let basis = ball();
        let u = Field::scalar("u", &basis).unwrap();
        let mut problem = Problem::new(&[u.clone()]);
        let eq = problem.add_equation(dt(&u) - lap(&u), 0.0);
        problem.add_bc(interp(&u, 1.0), 0.0, eq).unwrap();
        let set = problem.build().unwrap();
        assert!(set.has_time_derivative());
        let s = set.get(ModeKey::new(0, 2)).unwrap();
        let n = s.var_range(0).len();
        // M 为变量块上的单位阵
        for i in 0..n {
            assert_eq!(s.m_matrix().get(i, i), ONE);
        }
        assert_eq!(s.m_matrix().nnz(), n);
    }

    #[test]
    fn test_export_roundtrip_json() {
        let basis = ball();
        let (problem, _) = poisson(&basis);
        let set = problem.build().unwrap();
        let json = set.export_json().unwrap();
        let back: Vec<SubproblemMatrices> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), set.len());
        let l = CsrMatrixC64::from_triplets(&back[3].l);
        let orig = set.subproblems()[3].l_matrix();
        assert_eq!(back[3].key, set.subproblems()[3].key());
        assert_eq!(l.nnz(), orig.nnz());
        let diff = l.add_scaled(-ONE, orig).max_abs();
        assert!(diff <= 1e-14 * orig.max_abs());
    }

    #[test]
    fn test_parsed_equations_match_builder() {
        let basis = ball();
        let u = Field::scalar("u", &basis).unwrap();
        let mut a = Problem::new(&[u.clone()]);
        let eq = a.add_equation_str("lap(u) = 6", "").unwrap();
        a.add_bc_str("u(r=1) = 1", eq).unwrap();
        let mut b = Problem::new(&[u.clone()]);
        let eq = b.add_equation(lap(&u), 6.0);
        b.add_bc(interp(&u, 1.0), 1.0, eq).unwrap();
        let (sa, sb) = (a.build().unwrap(), b.build().unwrap());
        for (x, y) in sa.subproblems().iter().zip(sb.subproblems()) {
            assert_eq!(x.l_matrix(), y.l_matrix());
        }
    }
}
