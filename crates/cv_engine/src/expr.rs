// crates/cv_engine/src/expr.rs

//! 算子表达式树
//!
//! 表达式是不可变的树，既可以数值求值得到新场，也可以在给定模式上
//! 展开为关于变量的线性形式（每个变量一个稀疏块），供子问题组装使用。
//!
//! # 求值路径
//!
//! - 乘积类（张量积、点积、叉积）：去混叠网格上逐点计算（物理标架）
//! - 微分与分量算子：系数空间逐模式矩阵，与隐式求解器使用同一批矩阵
//!
//! # 矩阵路径
//!
//! 乘积的一侧不含变量时，该侧先由 [`Expr::prepare_ncc`] 求值为场，
//! 再经 [`NccCache`] 转为逐模式矩阵。两侧都含变量、或左端出现常数项时
//! 返回 `UnsupportedNccExpression`。

use crate::basis::Basis;
use crate::field::{Dtype, Field, FieldMeta};
use crate::ncc::{NccCache, NccSide};
use crate::operators::{operator_matrix, LinearOp};
use cv_foundation::{ensure, CvError, CvResult, ModeKey};
use cv_spectral::csr::{CsrMatrix, CsrMatrixC64};
use cv_spectral::tensor::{Bilinear, Frame, TensorSig};
use ndarray::Array4;
use num_complex::Complex64;
use std::fmt;
use std::ops;
use std::sync::Arc;

const ZERO: Complex64 = Complex64 { re: 0.0, im: 0.0 };
const ONE: Complex64 = Complex64 { re: 1.0, im: 0.0 };

/// 判定角向内容可忽略的相对阈值
const ANGULAR_NEGLIGIBLE: f64 = 1e-12;

/// 表达式节点
#[derive(Debug, Clone)]
pub enum Expr {
    /// 场
    Field(Field),
    /// 零
    Zero,
    /// 常数
    Scalar(Complex64),
    /// 和
    Add(Box<Expr>, Box<Expr>),
    /// 取负
    Neg(Box<Expr>),
    /// 常数倍
    Scale(Complex64, Box<Expr>),
    /// 双线性乘积
    Product(Bilinear, Box<Expr>, Box<Expr>),
    /// 逐模式线性算子
    Operator {
        /// 算子
        op: LinearOp,
        /// 作用对象
        operand: Box<Expr>,
        /// 结果所在的基（仅提升需要显式给出）
        target: Option<Arc<Basis>>,
    },
    /// 时间导数
    TimeDerivative(Box<Expr>),
}

/// 表达式结果的形状
#[derive(Debug, Clone)]
pub struct ExprShape {
    /// 基（常数为 `None`）
    pub basis: Option<Arc<Basis>>,
    /// 张量形状
    pub sig: TensorSig,
    /// 是否含角向依赖
    pub angular: bool,
    /// 数据类型
    pub dtype: Dtype,
}

impl ExprShape {
    fn constant(c: Complex64) -> Self {
        Self {
            basis: None,
            sig: TensorSig::new(0, 0),
            angular: false,
            dtype: if c.im == 0.0 { Dtype::Real } else { Dtype::Complex },
        }
    }

    /// 是否为常数
    pub fn is_constant(&self) -> bool {
        self.basis.is_none()
    }

    /// 对应的场属性
    pub fn meta(&self) -> CvResult<FieldMeta> {
        let basis = self
            .basis
            .as_ref()
            .ok_or_else(|| CvError::configuration("常数表达式没有基"))?;
        Ok(FieldMeta {
            basis: basis.clone(),
            sig: self.sig,
            dtype: self.dtype,
            angular: self.angular,
        })
    }

    /// 模式键序列
    pub fn mode_keys(&self) -> CvResult<Vec<ModeKey>> {
        Ok(self.meta()?.basis.mode_keys(self.angular))
    }

    /// 某模式上的块大小（不含该模式时为 0）
    pub fn block_size(&self, key: ModeKey) -> CvResult<usize> {
        let meta = self.meta()?;
        Ok(meta.layout()?.block(key).map_or(0, |(b, _)| b.size))
    }
}

/// 某模式上关于变量的线性形式
#[derive(Debug, Clone)]
pub struct LinearForm {
    /// 行数（表达式在该模式的块大小）
    pub rows: usize,
    /// 每个变量的块（`None` 表示不依赖该变量）
    pub blocks: Vec<Option<CsrMatrixC64>>,
}

/// 求值中间结果
enum Value {
    Const(Complex64),
    Field(Field),
}

// =============================================================================
// 构造
// =============================================================================

fn op(op: LinearOp, e: impl Into<Expr>) -> Expr {
    Expr::Operator {
        op,
        operand: Box::new(e.into()),
        target: None,
    }
}

/// 梯度
pub fn grad(e: impl Into<Expr>) -> Expr {
    op(LinearOp::Gradient, e)
}

/// 散度
pub fn div(e: impl Into<Expr>) -> Expr {
    op(LinearOp::Divergence, e)
}

/// 旋度
pub fn curl(e: impl Into<Expr>) -> Expr {
    op(LinearOp::Curl, e)
}

/// 拉普拉斯
pub fn lap(e: impl Into<Expr>) -> Expr {
    op(LinearOp::Laplacian, e)
}

/// 球面向量旋转 90°
pub fn skew(e: impl Into<Expr>) -> Expr {
    op(LinearOp::Skew, e)
}

/// 迹
pub fn trace(e: impl Into<Expr>) -> Expr {
    op(LinearOp::Trace, e)
}

/// 径向分量
pub fn radial(e: impl Into<Expr>) -> Expr {
    op(LinearOp::RadialComponent, e)
}

/// 切向分量
pub fn angular(e: impl Into<Expr>) -> Expr {
    op(LinearOp::AngularComponent, e)
}

/// 在半径 `r` 处取值
pub fn interp(e: impl Into<Expr>, r: f64) -> Expr {
    op(LinearOp::Interpolate(r), e)
}

/// 把边界量提升到体基 `basis` 的第 `n` 个径向模式
pub fn lift(e: impl Into<Expr>, basis: &Arc<Basis>, n: i32) -> Expr {
    Expr::Operator {
        op: LinearOp::Lift(n),
        operand: Box::new(e.into()),
        target: Some(basis.clone()),
    }
}

/// 时间导数
pub fn dt(e: impl Into<Expr>) -> Expr {
    Expr::TimeDerivative(Box::new(e.into()))
}

/// 张量积
pub fn mul(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::Product(Bilinear::Product, Box::new(a.into()), Box::new(b.into()))
}

/// 点积
pub fn dot(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::Product(Bilinear::Dot, Box::new(a.into()), Box::new(b.into()))
}

/// 叉积
pub fn cross(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::Product(Bilinear::Cross, Box::new(a.into()), Box::new(b.into()))
}

impl From<Field> for Expr {
    fn from(f: Field) -> Self {
        Expr::Field(f)
    }
}

impl From<&Field> for Expr {
    fn from(f: &Field) -> Self {
        Expr::Field(f.clone())
    }
}

impl From<f64> for Expr {
    fn from(x: f64) -> Self {
        Expr::Scalar(Complex64::new(x, 0.0))
    }
}

impl From<Complex64> for Expr {
    fn from(c: Complex64) -> Self {
        Expr::Scalar(c)
    }
}

impl<T: Into<Expr>> ops::Add<T> for Expr {
    type Output = Expr;
    fn add(self, rhs: T) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> ops::Sub<T> for Expr {
    type Output = Expr;
    fn sub(self, rhs: T) -> Expr {
        Expr::Add(Box::new(self), Box::new(Expr::Neg(Box::new(rhs.into()))))
    }
}

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

impl<T: Into<Expr>> ops::Mul<T> for Expr {
    type Output = Expr;
    fn mul(self, rhs: T) -> Expr {
        match rhs.into() {
            Expr::Scalar(c) => Expr::Scale(c, Box::new(self)),
            other => mul(self, other),
        }
    }
}

impl ops::Mul<Expr> for f64 {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::Scale(Complex64::new(self, 0.0), Box::new(rhs))
    }
}

impl ops::Mul<Expr> for Complex64 {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::Scale(self, Box::new(rhs))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Field(field) => write!(f, "{}", field.name()),
            Expr::Zero => write!(f, "0"),
            Expr::Scalar(c) if c.im == 0.0 => write!(f, "{}", c.re),
            Expr::Scalar(c) => write!(f, "({}{:+}j)", c.re, c.im),
            Expr::Add(a, b) => write!(f, "({a} + {b})"),
            Expr::Neg(a) => write!(f, "-{a}"),
            Expr::Scale(c, a) => write!(f, "{}*{a}", Expr::Scalar(*c)),
            Expr::Product(Bilinear::Product, a, b) => write!(f, "{a}*{b}"),
            Expr::Product(Bilinear::Dot, a, b) => write!(f, "dot({a}, {b})"),
            Expr::Product(Bilinear::Cross, a, b) => write!(f, "cross({a}, {b})"),
            Expr::Operator { op, operand, .. } => match op {
                LinearOp::Interpolate(r) => write!(f, "interp({operand}, r={r})"),
                LinearOp::Lift(n) => write!(f, "lift({operand}, {n})"),
                _ => write!(f, "{}({operand})", op.name()),
            },
            Expr::TimeDerivative(a) => write!(f, "dt({a})"),
        }
    }
}

// =============================================================================
// 形状
// =============================================================================

fn check_same_space(a: &Basis, b: &Basis, what: &str) -> CvResult<()> {
    ensure!(
        a.same_space(b),
        CvError::configuration(format!("{what}: 基 {a} 与 {b} 不一致"))
    );
    Ok(())
}

impl Expr {
    /// 结果形状（同时完成阶数与基的校验）
    pub fn shape(&self) -> CvResult<ExprShape> {
        match self {
            Expr::Field(f) => Ok(ExprShape {
                basis: Some(f.basis().clone()),
                sig: f.basis().normalize_sig(f.sig()),
                angular: f.angular(),
                dtype: f.dtype(),
            }),
            Expr::Zero => Ok(ExprShape::constant(ZERO)),
            Expr::Scalar(c) => Ok(ExprShape::constant(*c)),
            Expr::Neg(a) | Expr::TimeDerivative(a) => a.shape(),
            Expr::Scale(c, a) => {
                let mut s = a.shape()?;
                s.dtype = s.dtype.promote(ExprShape::constant(*c).dtype);
                Ok(s)
            }
            Expr::Add(a, b) => {
                let (sa, sb) = (a.shape()?, b.shape()?);
                let dtype = sa.dtype.promote(sb.dtype);
                match (sa.basis.clone(), sb.basis.clone()) {
                    (None, None) => Ok(ExprShape { dtype, ..sa }),
                    (Some(_), None) | (None, Some(_)) => {
                        let s = if sa.is_constant() { sb } else { sa };
                        ensure!(
                            s.sig.rank == 0,
                            CvError::configuration(format!("常数只能与标量相加: {self}"))
                        );
                        Ok(ExprShape { dtype, ..s })
                    }
                    (Some(ba), Some(bb)) => {
                        check_same_space(&ba, &bb, "加法")?;
                        ensure!(
                            sa.sig == sb.sig,
                            CvError::configuration(format!(
                                "加法两侧形状不同: {a} 为 dim={} rank={}, {b} 为 dim={} rank={}",
                                sa.sig.dim, sa.sig.rank, sb.sig.dim, sb.sig.rank
                            ))
                        );
                        Ok(ExprShape {
                            angular: sa.angular || sb.angular,
                            dtype,
                            ..sa
                        })
                    }
                }
            }
            Expr::Product(kind, a, b) => {
                let (sa, sb) = (a.shape()?, b.shape()?);
                let dtype = sa.dtype.promote(sb.dtype);
                match (sa.basis.clone(), sb.basis.clone()) {
                    (Some(ba), Some(bb)) => {
                        check_same_space(&ba, &bb, "乘积")?;
                        let (ra, rb) = (sa.sig.rank, sb.sig.rank);
                        ensure!(
                            ra == 0 || rb == 0 || sa.sig.dim == sb.sig.dim,
                            CvError::configuration(format!("乘积两侧分量维数不同: {self}"))
                        );
                        let dim = if ra > 0 { sa.sig.dim } else { sb.sig.dim };
                        let rank = kind.output_rank(dim, ra, rb)?;
                        Ok(ExprShape {
                            sig: ba.normalize_sig(TensorSig::new(dim, rank)),
                            angular: sa.angular || sb.angular,
                            dtype,
                            basis: Some(ba),
                        })
                    }
                    (None, None) => {
                        ensure!(
                            *kind == Bilinear::Product,
                            CvError::configuration(format!("常数不能做点积或叉积: {self}"))
                        );
                        Ok(ExprShape { dtype, ..sa })
                    }
                    _ => {
                        ensure!(
                            *kind == Bilinear::Product,
                            CvError::configuration(format!("常数不能做点积或叉积: {self}"))
                        );
                        let s = if sa.is_constant() { sb } else { sa };
                        Ok(ExprShape { dtype, ..s })
                    }
                }
            }
            Expr::Operator { op, operand, target } => {
                let s = operand.shape()?;
                let source = s.basis.clone().ok_or_else(|| {
                    CvError::configuration(format!("{} 不能作用于常数: {self}", op.name()))
                })?;
                let target = self.target_basis(*op, &source, target)?;
                let sig = op.output_sig(&source, &target, s.sig)?;
                Ok(ExprShape {
                    basis: Some(target),
                    sig,
                    angular: s.angular,
                    dtype: s.dtype,
                })
            }
        }
    }

    fn target_basis(
        &self,
        op: LinearOp,
        source: &Arc<Basis>,
        target: &Option<Arc<Basis>>,
    ) -> CvResult<Arc<Basis>> {
        match op {
            LinearOp::Interpolate(r) => source.surface(r),
            LinearOp::Lift(_) => target
                .clone()
                .ok_or_else(|| CvError::configuration(format!("提升缺少目标基: {self}"))),
            _ => Ok(source.clone()),
        }
    }

    /// 是否包含任一变量
    pub fn contains_var(&self, vars: &[Field]) -> bool {
        match self {
            Expr::Field(f) => vars.iter().any(|v| v.same(f)),
            Expr::Zero | Expr::Scalar(_) => false,
            Expr::Neg(a) | Expr::Scale(_, a) | Expr::TimeDerivative(a) => a.contains_var(vars),
            Expr::Operator { operand, .. } => operand.contains_var(vars),
            Expr::Add(a, b) | Expr::Product(_, a, b) => a.contains_var(vars) || b.contains_var(vars),
        }
    }

    /// 是否包含时间导数
    pub fn contains_dt(&self) -> bool {
        match self {
            Expr::TimeDerivative(_) => true,
            Expr::Field(_) | Expr::Zero | Expr::Scalar(_) => false,
            Expr::Neg(a) | Expr::Scale(_, a) => a.contains_dt(),
            Expr::Operator { operand, .. } => operand.contains_dt(),
            Expr::Add(a, b) | Expr::Product(_, a, b) => a.contains_dt() || b.contains_dt(),
        }
    }
}

// =============================================================================
// 数值求值
// =============================================================================

/// 某个场在给定缩放下的网格值（不改变场自身的状态）
fn grid_at(field: &Field, scales: [f64; 3]) -> CvResult<Array4<Complex64>> {
    let coeffs = field.coefficients()?;
    let mut grid = field.basis().backward(&coeffs, field.layout(), scales)?;
    if field.dtype() == Dtype::Real {
        grid.mapv_inplace(|z| Complex64::new(z.re, 0.0));
    }
    Ok(grid)
}

/// 把 `field` 的系数以 `alpha` 倍累加到布局 `out` 中（按模式对齐）
fn accumulate(
    out_layout: &crate::layout::FieldLayout,
    out: &mut [Complex64],
    field: &Field,
    alpha: Complex64,
) -> CvResult<()> {
    let coeffs = field.coefficients()?;
    for key in field.layout().keys() {
        let (Some(src), Some((block, off))) = (field.layout().extract(&coeffs, key), out_layout.block(key))
        else {
            continue;
        };
        CvError::check_size("block", block.size, src.len())?;
        for (dst, s) in out[off..off + block.size].iter_mut().zip(src) {
            *dst += alpha * s;
        }
    }
    Ok(())
}

/// 常数标量场
fn constant_field(basis: &Arc<Basis>, c: Complex64) -> CvResult<Field> {
    let meta = FieldMeta::new(basis, 0)
        .radial_only()
        .with_dtype(Dtype::Complex);
    let f = Field::with_meta(format!("{c}"), meta)?;
    f.set_grid_from_fn(|_, _, _| vec![c])?;
    Ok(f)
}

/// 把只含 `(0, 0)` 内容的场投影为仅径向场
fn radial_projection(field: &Field) -> CvResult<Field> {
    if !field.angular() {
        return Ok(field.clone());
    }
    let coeffs = field.coefficients()?;
    let key = ModeKey::new(0, 0);
    let scale = coeffs.iter().map(|c| c.norm()).fold(0.0, f64::max);
    let mut angular_max: f64 = 0.0;
    for k in field.layout().keys().filter(|&k| k != key) {
        if let Some(b) = field.layout().extract(&coeffs, k) {
            angular_max = b.iter().map(|c| c.norm()).fold(angular_max, f64::max);
        }
    }
    ensure!(
        angular_max <= ANGULAR_NEGLIGIBLE * scale.max(f64::MIN_POSITIVE),
        CvError::unsupported_ncc(format!(
            "NCC 因子 {} 含角向依赖 (相对幅值 {:.2e})",
            field.name(),
            angular_max / scale.max(f64::MIN_POSITIVE)
        ))
    );
    let meta = field.meta().clone().radial_only();
    let block = field
        .layout()
        .extract(&coeffs, key)
        .map(|b| b.to_vec())
        .unwrap_or_default();
    Field::from_coefficients(field.name(), meta, block)
}

impl Expr {
    /// 数值求值
    pub fn evaluate(&self) -> CvResult<Field> {
        match self.eval_node()? {
            Value::Field(f) => Ok(f),
            Value::Const(c) => Err(CvError::configuration(format!(
                "表达式 {self} 的结果是常数 {c}，没有基"
            ))),
        }
    }

    /// 数值求值；常数结果放到基 `basis` 上的常数标量场
    pub fn evaluate_on(&self, basis: &Arc<Basis>) -> CvResult<Field> {
        match self.eval_node()? {
            Value::Field(f) => Ok(f),
            Value::Const(c) => constant_field(basis, c),
        }
    }

    fn eval_node(&self) -> CvResult<Value> {
        match self {
            Expr::Field(f) => Ok(Value::Field(f.clone())),
            Expr::Zero => Ok(Value::Const(ZERO)),
            Expr::Scalar(c) => Ok(Value::Const(*c)),
            Expr::TimeDerivative(_) => Err(CvError::configuration(format!(
                "时间导数不能数值求值: {self}"
            ))),
            Expr::Neg(a) => self.scaled(a, -ONE),
            Expr::Scale(c, a) => self.scaled(a, *c),
            Expr::Add(a, b) => {
                let shape = self.shape()?;
                match (a.eval_node()?, b.eval_node()?) {
                    (Value::Const(x), Value::Const(y)) => Ok(Value::Const(x + y)),
                    (va, vb) => {
                        let meta = shape.meta()?;
                        let layout = meta.layout()?;
                        let mut out = vec![ZERO; layout.size()];
                        for v in [va, vb] {
                            let f = match v {
                                Value::Field(f) => f,
                                Value::Const(c) => constant_field(&meta.basis, c)?,
                            };
                            accumulate(&layout, &mut out, &f, ONE)?;
                        }
                        Ok(Value::Field(Field::from_coefficients(self.to_string(), meta, out)?))
                    }
                }
            }
            Expr::Product(kind, a, b) => {
                let shape = self.shape()?;
                match (a.eval_node()?, b.eval_node()?) {
                    (Value::Const(x), Value::Const(y)) => Ok(Value::Const(x * y)),
                    (Value::Const(c), Value::Field(f)) | (Value::Field(f), Value::Const(c)) => {
                        self.scaled_field(&f, c, shape)
                    }
                    (Value::Field(fa), Value::Field(fb)) => {
                        self.grid_product(*kind, &fa, &fb, shape).map(Value::Field)
                    }
                }
            }
            Expr::Operator { op, operand, .. } => {
                let shape = self.shape()?;
                let x = match operand.eval_node()? {
                    Value::Field(f) => f,
                    Value::Const(_) => {
                        return Err(CvError::configuration(format!(
                            "{} 不能作用于常数: {self}",
                            op.name()
                        )))
                    }
                };
                self.apply_operator(*op, &x, shape).map(Value::Field)
            }
        }
    }

    fn scaled(&self, a: &Expr, c: Complex64) -> CvResult<Value> {
        match a.eval_node()? {
            Value::Const(x) => Ok(Value::Const(c * x)),
            Value::Field(f) => self.scaled_field(&f, c, self.shape()?),
        }
    }

    fn scaled_field(&self, f: &Field, c: Complex64, shape: ExprShape) -> CvResult<Value> {
        let meta = shape.meta()?;
        let coeffs = f.coefficients()?.into_iter().map(|x| c * x).collect();
        Ok(Value::Field(Field::from_coefficients(self.to_string(), meta, coeffs)?))
    }

    fn grid_product(&self, kind: Bilinear, a: &Field, b: &Field, shape: ExprShape) -> CvResult<Field> {
        let meta = shape.meta()?;
        let scales = meta.basis.dealias();
        let ga = grid_at(a, scales)?;
        let gb = grid_at(b, scales)?;
        let (na, nphi, nth, nr) = ga.dim();
        let nb = gb.dim().0;
        let (ra, rb) = (a.rank(), b.rank());
        let dim = if ra > 0 { a.sig().dim } else { b.sig().dim };
        let ncomp = meta.sig.ncomp();
        let mut out = Array4::<Complex64>::zeros((ncomp, nphi, nth, nr));
        let mut va = vec![ZERO; na];
        let mut vb = vec![ZERO; nb];
        for i in 0..nphi {
            for j in 0..nth {
                for k in 0..nr {
                    for (c, v) in va.iter_mut().enumerate() {
                        *v = ga[[c, i, j, k]];
                    }
                    for (c, v) in vb.iter_mut().enumerate() {
                        *v = gb[[c, i, j, k]];
                    }
                    let p = kind.apply(Frame::Physical, dim, ra, &va, rb, &vb)?;
                    for (c, v) in p.into_iter().enumerate() {
                        out[[c, i, j, k]] = v;
                    }
                }
            }
        }
        let result = Field::with_meta(self.to_string(), meta)?;
        result.rescale(scales)?;
        result.set_grid_values(out)?;
        result.to_coefficients()?;
        Ok(result)
    }

    fn apply_operator(&self, op: LinearOp, x: &Field, shape: ExprShape) -> CvResult<Field> {
        let meta = shape.meta()?;
        let layout = meta.layout()?;
        let coeffs = x.coefficients()?;
        let mut out = vec![ZERO; layout.size()];
        for block in layout.blocks() {
            let key = block.key;
            let Some(input) = x.layout().extract(&coeffs, key) else {
                continue;
            };
            let m = operator_matrix(op, x.basis(), &meta.basis, x.sig(), key)?;
            let mut y = vec![ZERO; block.size];
            m.mul_vec(input, &mut y);
            layout.insert(&mut out, key, &y)?;
        }
        Field::from_coefficients(self.to_string(), meta, out)
    }
}

// =============================================================================
// 时间分裂与 NCC 准备
// =============================================================================

fn add_opt(a: Option<Expr>, b: Option<Expr>) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Expr::Add(Box::new(a), Box::new(b))),
        (a, None) => a,
        (None, b) => b,
    }
}

impl Expr {
    /// 拆分为 `(M 部分, L 部分)`：`expr = dt(M) + L`
    pub fn split_time(&self) -> CvResult<(Option<Expr>, Option<Expr>)> {
        if !self.contains_dt() {
            return Ok(match self {
                Expr::Zero => (None, None),
                _ => (None, Some(self.clone())),
            });
        }
        match self {
            Expr::TimeDerivative(x) => {
                ensure!(
                    !x.contains_dt(),
                    CvError::unsupported_ncc(format!("不支持高阶时间导数: {self}"))
                );
                Ok((Some((**x).clone()), None))
            }
            Expr::Add(a, b) => {
                let (am, al) = a.split_time()?;
                let (bm, bl) = b.split_time()?;
                Ok((add_opt(am, bm), add_opt(al, bl)))
            }
            Expr::Neg(a) => {
                let (m, l) = a.split_time()?;
                Ok((m.map(|e| -e), l.map(|e| -e)))
            }
            Expr::Scale(c, a) => {
                let (m, l) = a.split_time()?;
                let wrap = |e: Expr| Expr::Scale(*c, Box::new(e));
                Ok((m.map(wrap), l.map(wrap)))
            }
            Expr::Product(kind, a, b) => {
                ensure!(
                    !(a.contains_dt() && b.contains_dt()),
                    CvError::unsupported_ncc(format!("乘积两侧都含时间导数: {self}"))
                );
                if a.contains_dt() {
                    let (m, l) = a.split_time()?;
                    let wrap = |e: Expr| Expr::Product(*kind, Box::new(e), b.clone());
                    Ok((m.map(wrap), l.map(wrap)))
                } else {
                    let (m, l) = b.split_time()?;
                    let wrap = |e: Expr| Expr::Product(*kind, a.clone(), Box::new(e));
                    Ok((m.map(wrap), l.map(wrap)))
                }
            }
            Expr::Operator { op, operand, target } => {
                let (m, l) = operand.split_time()?;
                let wrap = |e: Expr| Expr::Operator {
                    op: *op,
                    operand: Box::new(e),
                    target: target.clone(),
                };
                Ok((m.map(wrap), l.map(wrap)))
            }
            Expr::Field(_) | Expr::Zero | Expr::Scalar(_) => Ok((None, Some(self.clone()))),
        }
    }

    /// 把乘积中不含变量的一侧求值为（仅径向的）场
    pub fn prepare_ncc(&self, vars: &[Field]) -> CvResult<Expr> {
        match self {
            Expr::Product(kind, a, b) => {
                let (av, bv) = (a.contains_var(vars), b.contains_var(vars));
                match (av, bv) {
                    (true, true) => Err(CvError::unsupported_ncc(format!(
                        "乘积两侧都含变量: {self}"
                    ))),
                    (true, false) => Ok(Expr::Product(
                        *kind,
                        Box::new(a.prepare_ncc(vars)?),
                        Box::new(b.freeze()?),
                    )),
                    (false, true) => Ok(Expr::Product(
                        *kind,
                        Box::new(a.freeze()?),
                        Box::new(b.prepare_ncc(vars)?),
                    )),
                    (false, false) => Ok(self.clone()),
                }
            }
            Expr::Add(a, b) => Ok(Expr::Add(
                Box::new(a.prepare_ncc(vars)?),
                Box::new(b.prepare_ncc(vars)?),
            )),
            Expr::Neg(a) => Ok(Expr::Neg(Box::new(a.prepare_ncc(vars)?))),
            Expr::Scale(c, a) => Ok(Expr::Scale(*c, Box::new(a.prepare_ncc(vars)?))),
            Expr::TimeDerivative(a) => Ok(Expr::TimeDerivative(Box::new(a.prepare_ncc(vars)?))),
            Expr::Operator { op, operand, target } => Ok(Expr::Operator {
                op: *op,
                operand: Box::new(operand.prepare_ncc(vars)?),
                target: target.clone(),
            }),
            Expr::Field(_) | Expr::Zero | Expr::Scalar(_) => Ok(self.clone()),
        }
    }

    /// 求值不含变量的因子；已是仅径向场时保持原场（标识不变）
    fn freeze(&self) -> CvResult<Expr> {
        match self {
            Expr::Zero | Expr::Scalar(_) => Ok(self.clone()),
            Expr::Field(f) if !f.angular() => Ok(self.clone()),
            Expr::Field(f) => Ok(Expr::Field(radial_projection(f)?)),
            _ => match self.eval_node()? {
                Value::Const(c) => Ok(Expr::Scalar(c)),
                Value::Field(f) => Ok(Expr::Field(radial_projection(&f)?)),
            },
        }
    }
}

// =============================================================================
// 线性形式
// =============================================================================

fn add_blocks(a: Option<CsrMatrixC64>, b: Option<CsrMatrixC64>) -> Option<CsrMatrixC64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.add_scaled(ONE, &b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl LinearForm {
    fn scaled(mut self, c: Complex64) -> Self {
        for m in self.blocks.iter_mut().flatten() {
            m.scale(c);
        }
        self
    }

    fn compose(self, left: &CsrMatrixC64) -> Self {
        Self {
            rows: left.n_rows(),
            blocks: self
                .blocks
                .into_iter()
                .map(|m| m.map(|m| left.matmul(&m)))
                .collect(),
        }
    }
}

impl Expr {
    /// 在模式 `key` 上关于 `vars` 的线性形式
    ///
    /// 表达式须已经过 [`Expr::prepare_ncc`]，且不含时间导数。
    pub fn linear_form(&self, vars: &[Field], key: ModeKey, ncc: &NccCache) -> CvResult<LinearForm> {
        match self.form(vars, key, ncc)? {
            Some(f) => Ok(f),
            None => Ok(LinearForm {
                rows: 0,
                blocks: vec![None; vars.len()],
            }),
        }
    }

    fn form(&self, vars: &[Field], key: ModeKey, ncc: &NccCache) -> CvResult<Option<LinearForm>> {
        match self {
            Expr::Zero => Ok(None),
            Expr::Scalar(c) => Err(CvError::unsupported_ncc(format!(
                "线性项中出现常数 {}",
                Expr::Scalar(*c)
            ))),
            Expr::Field(f) => {
                let Some(i) = vars.iter().position(|v| v.same(f)) else {
                    return Err(CvError::unsupported_ncc(format!(
                        "线性项中出现非变量场 {}",
                        f.name()
                    )));
                };
                // 仅径向的变量在非 (0,0) 模式上没有分量
                let Some((block, _)) = f.layout().block(key) else {
                    return Ok(None);
                };
                let n = block.size;
                let mut blocks = vec![None; vars.len()];
                blocks[i] = Some(CsrMatrix::identity(n));
                Ok(Some(LinearForm { rows: n, blocks }))
            }
            Expr::TimeDerivative(_) => Err(CvError::configuration(format!(
                "线性形式中不能含时间导数（先调用 split_time）: {self}"
            ))),
            Expr::Neg(a) => Ok(a.form(vars, key, ncc)?.map(|f| f.scaled(-ONE))),
            Expr::Scale(c, a) => Ok(a.form(vars, key, ncc)?.map(|f| f.scaled(*c))),
            Expr::Add(a, b) => match (a.form(vars, key, ncc)?, b.form(vars, key, ncc)?) {
                (Some(fa), Some(fb)) => {
                    ensure!(
                        fa.rows == fb.rows,
                        CvError::internal(format!(
                            "加法两侧行数不同 {key}: {} != {}",
                            fa.rows, fb.rows
                        ))
                    );
                    let blocks = fa
                        .blocks
                        .into_iter()
                        .zip(fb.blocks)
                        .map(|(x, y)| add_blocks(x, y))
                        .collect();
                    Ok(Some(LinearForm { rows: fa.rows, blocks }))
                }
                (f, None) | (None, f) => Ok(f),
            },
            Expr::Operator { op, operand, target } => {
                let Some(inner) = operand.form(vars, key, ncc)? else {
                    return Ok(None);
                };
                let s = operand.shape()?;
                let source = s
                    .basis
                    .ok_or_else(|| CvError::internal("算子作用对象没有基"))?;
                let target = self.target_basis(*op, &source, target)?;
                let m = operator_matrix(*op, &source, &target, s.sig, key)?;
                Ok(Some(inner.compose(&m)))
            }
            Expr::Product(kind, a, b) => {
                let (av, bv) = (a.contains_var(vars), b.contains_var(vars));
                let (coef, operand, side) = match (av, bv) {
                    (true, false) => (b, a, NccSide::Right),
                    (false, true) => (a, b, NccSide::Left),
                    (true, true) => {
                        return Err(CvError::unsupported_ncc(format!("乘积两侧都含变量: {self}")))
                    }
                    (false, false) => {
                        return Err(CvError::unsupported_ncc(format!("线性项中出现常数乘积: {self}")))
                    }
                };
                let Some(inner) = operand.form(vars, key, ncc)? else {
                    return Ok(None);
                };
                match coef.as_ref() {
                    Expr::Zero => Ok(None),
                    Expr::Scalar(c) => {
                        ensure!(
                            *kind == Bilinear::Product,
                            CvError::configuration(format!("常数不能做点积或叉积: {self}"))
                        );
                        Ok(Some(inner.scaled(*c)))
                    }
                    Expr::Field(f) => {
                        ensure!(
                            !f.angular(),
                            CvError::unsupported_ncc(format!("NCC 因子 {} 含角向依赖", f.name()))
                        );
                        let s = operand.shape()?;
                        let basis = s
                            .basis
                            .ok_or_else(|| CvError::internal("NCC 作用对象没有基"))?;
                        let m = ncc.matrix(f, &basis, s.sig, *kind, side, key)?;
                        Ok(Some(inner.compose(&m)))
                    }
                    other => Err(CvError::unsupported_ncc(format!(
                        "NCC 因子 {other} 未求值（需先 prepare_ncc）"
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn c(x: f64) -> Complex64 {
        Complex64::new(x, 0.0)
    }

    fn sphere() -> Arc<Basis> {
        Arc::new(Basis::sphere(1.0, 16, 12, 1.5).unwrap())
    }

    #[test]
    fn test_shape_rules() {
        let b = Arc::new(Basis::ball(1.0, [8, 8, 8], 1.5).unwrap());
        let u = Field::vector("u", &b).unwrap();
        let f = Field::scalar("f", &b).unwrap();
        assert_eq!(grad(&u).shape().unwrap().sig.rank, 2);
        assert_eq!(div(grad(&u)).shape().unwrap().sig.rank, 1);
        assert_eq!(dot(&u, &u).shape().unwrap().sig.rank, 0);
        assert_eq!(mul(&u, &u).shape().unwrap().sig.rank, 2);
        assert_eq!(trace(mul(&u, &u)).shape().unwrap().sig.rank, 0);
        assert_eq!(radial(grad(&f)).shape().unwrap().sig.rank, 0);
        let bc = interp(&u, 1.0).shape().unwrap();
        assert_eq!(bc.sig, TensorSig::new(3, 1));
        assert!(matches!(
            bc.basis.unwrap().geometry(),
            crate::coords::Geometry::Sphere { .. }
        ));
        assert!((Expr::from(&u) + &f).shape().is_err());
        assert!(cross(&f, &u).shape().is_err());
        assert!(grad(Expr::from(2.0)).shape().is_err());
    }

    #[test]
    fn test_evaluate_sphere_laplacian() {
        // ∇² (cos θ) = -2 cos θ
        let basis = sphere();
        let f = Field::scalar("f", &basis).unwrap();
        f.set_grid_from_fn(|_, theta, _| vec![c(theta.cos())]).unwrap();
        let l = lap(&f).evaluate().unwrap();
        let g = l.grid_values().unwrap();
        let (_, theta, _) = basis.grids([1.0; 3]).unwrap();
        for (j, t) in theta.iter().enumerate() {
            assert_relative_eq!(g[[0, 3, j, 0]].re, -2.0 * t.cos(), epsilon = 1e-11);
        }
    }

    #[test]
    fn test_evaluate_sphere_gradient() {
        // ∇(sin θ cos φ) 的 θ 分量为 cos θ cos φ，φ 分量为 -sin φ
        let basis = sphere();
        let f = Field::scalar("f", &basis).unwrap();
        f.set_grid_from_fn(|phi, theta, _| vec![c(theta.sin() * phi.cos())])
            .unwrap();
        let g = grad(&f).evaluate().unwrap().grid_values().unwrap();
        let (phi, theta, _) = basis.grids([1.0; 3]).unwrap();
        for &(i, j) in &[(0, 0), (3, 5), (7, 11)] {
            assert_relative_eq!(g[[0, i, j, 0]].re, -phi[i].sin(), epsilon = 1e-11);
            assert_relative_eq!(g[[1, i, j, 0]].re, theta[j].cos() * phi[i].cos(), epsilon = 1e-11);
        }
    }

    #[test]
    fn test_constant_addition_and_scaling() {
        let basis = sphere();
        let f = Field::scalar("f", &basis).unwrap();
        f.set_grid_from_fn(|_, theta, _| vec![c(theta.cos())]).unwrap();
        let e = 2.0 * Expr::from(&f) + 1.0;
        let g = e.evaluate().unwrap().grid_values().unwrap();
        let (_, theta, _) = basis.grids([1.0; 3]).unwrap();
        assert_relative_eq!(g[[0, 1, 4, 0]].re, 2.0 * theta[4].cos() + 1.0, epsilon = 1e-12);
        assert!(Expr::from(3.0).evaluate().is_err());
        assert!(dt(&f).evaluate().is_err());
    }

    #[test]
    fn test_split_time() {
        let basis = sphere();
        let u = Field::scalar("u", &basis).unwrap();
        let e = dt(&u) - 2.0 * lap(&u) + 3.0 * dt(lap(&u));
        let (m, l) = e.split_time().unwrap();
        assert_eq!(m.unwrap().to_string(), "(u + 3*lap(u))");
        assert_eq!(l.unwrap().to_string(), "-2*lap(u)");
        assert!(dt(dt(&u)).split_time().is_err());
    }

    #[test]
    fn test_linear_form_rejects_nonlinear() {
        let basis = Arc::new(Basis::ball(1.0, [8, 8, 8], 1.5).unwrap());
        let u = Field::scalar("u", &basis).unwrap();
        let vars = [u.clone()];
        let cache = NccCache::default();
        let key = ModeKey::new(0, 1);
        assert!(matches!(
            mul(&u, &u).prepare_ncc(&vars),
            Err(CvError::UnsupportedNccExpression { .. })
        ));
        let with_const = Expr::from(&u) + 1.0;
        assert!(matches!(
            with_const.linear_form(&vars, key, &cache),
            Err(CvError::UnsupportedNccExpression { .. })
        ));
        let form = lap(&u).linear_form(&vars, key, &cache).unwrap();
        assert_eq!(form.rows, basis.block(u.sig(), key).unwrap().size);
    }
}
