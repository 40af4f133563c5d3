// crates/cv_engine/src/parser.rs

//! 方程文本解析
//!
//! 把 `"dt(u) - lap(u) + lift(tau) = f*u"` 这类文本解析为与构造 API
//! 相同的 [`Expr`] 树。名称从 [`Namespace`] 查找。
//!
//! # 文法
//!
//! ```text
//! equation := expr '=' expr
//! expr     := term (('+' | '-') term)*
//! term     := unary (('*' | '/') unary)*
//! unary    := ('-' | '+') unary | primary
//! primary  := number | number 'j' | name | name '(' 'r' '=' number ')'
//!           | call '(' args ')' | '(' expr ')'
//!
//! cond     := conj ('or' conj)*
//! conj     := cmp ('and' cmp)*
//! cmp      := ('m' | 'ell') op integer | 'true' | '(' cond ')'
//! ```
//!
//! 除法只允许除以常数。

use crate::basis::Basis;
use crate::expr::{self, Expr};
use crate::field::Field;
use crate::problem::{CmpOp, Condition, ModeVar};
use cv_foundation::{CvError, CvResult};
use num_complex::Complex64;
use std::collections::HashMap;
use std::sync::Arc;

/// 提升的默认径向模式（最高阶）
pub const DEFAULT_LIFT_MODE: i32 = -1;

// =============================================================================
// 名称空间
// =============================================================================

/// 解析时可见的名称
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    fields: HashMap<String, Field>,
    scalars: HashMap<String, Complex64>,
    bases: HashMap<String, Arc<Basis>>,
    lift_basis: Option<Arc<Basis>>,
}

impl Namespace {
    /// 空名称空间
    pub fn new() -> Self {
        Self::default()
    }

    /// 以场自身的名字登记
    pub fn insert_field(&mut self, field: &Field) {
        self.fields.insert(field.name().to_string(), field.clone());
    }

    /// 以别名登记场
    pub fn insert_field_as(&mut self, name: impl Into<String>, field: &Field) {
        self.fields.insert(name.into(), field.clone());
    }

    /// 登记常数
    pub fn insert_scalar(&mut self, name: impl Into<String>, value: impl Into<Complex64>) {
        self.scalars.insert(name.into(), value.into());
    }

    /// 登记基（供 `lift(x, basis, n)` 使用）
    pub fn insert_basis(&mut self, name: impl Into<String>, basis: &Arc<Basis>) {
        self.bases.insert(name.into(), basis.clone());
    }

    /// 设置 `lift(x)` 的默认目标基
    pub fn set_lift_basis(&mut self, basis: &Arc<Basis>) {
        self.lift_basis = Some(basis.clone());
    }

    /// 链式登记场
    pub fn with_field(mut self, field: &Field) -> Self {
        self.insert_field(field);
        self
    }

    /// 链式登记常数
    pub fn with_scalar(mut self, name: impl Into<String>, value: impl Into<Complex64>) -> Self {
        self.insert_scalar(name, value);
        self
    }

    /// 链式设置默认提升基
    pub fn with_lift_basis(mut self, basis: &Arc<Basis>) -> Self {
        self.set_lift_basis(basis);
        self
    }

    /// 查找场
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }
}

// =============================================================================
// 词法
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Imag(f64),
    Ident(String),
    Sym(&'static str),
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Num(x) => format!("数字 {x}"),
            Tok::Imag(x) => format!("虚数 {x}j"),
            Tok::Ident(s) => format!("名称 '{s}'"),
            Tok::Sym(s) => format!("'{s}'"),
        }
    }
}

const SYMBOLS: [&str; 14] = [
    "==", "!=", "<=", ">=", "<", ">", "=", "+", "-", "*", "/", "(", ")", ",",
];

fn is_id_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_id(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// 词法分析，返回 `(token, 字节位置)`
fn lex(s: &str) -> CvResult<Vec<(Tok, usize)>> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())) {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let value: f64 = s[start..i]
                .parse()
                .map_err(|_| CvError::parse(start, format!("无法解析数字 '{}'", &s[start..i])))?;
            if i < bytes.len() && bytes[i] == b'j' && !bytes.get(i + 1).is_some_and(|b| is_id(*b as char)) {
                i += 1;
                out.push((Tok::Imag(value), start));
            } else {
                out.push((Tok::Num(value), start));
            }
            continue;
        }
        if is_id_start(c) {
            let start = i;
            while i < bytes.len() && is_id(bytes[i] as char) {
                i += 1;
            }
            out.push((Tok::Ident(s[start..i].to_string()), start));
            continue;
        }
        let Some(&sym) = SYMBOLS.iter().find(|sym| s[i..].starts_with(**sym)) else {
            return Err(CvError::parse(i, format!("无法识别的字符 '{c}'")));
        };
        out.push((Tok::Sym(sym), i));
        i += sym.len();
    }
    Ok(out)
}

// =============================================================================
// 语法
// =============================================================================

struct Parser<'a> {
    toks: Vec<(Tok, usize)>,
    i: usize,
    end: usize,
    ns: &'a Namespace,
}

impl<'a> Parser<'a> {
    fn new(src: &str, ns: &'a Namespace) -> CvResult<Self> {
        Ok(Self {
            toks: lex(src)?,
            i: 0,
            end: src.len(),
            ns,
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.i).map(|(t, _)| t)
    }

    fn pos(&self) -> usize {
        self.toks.get(self.i).map_or(self.end, |(_, p)| *p)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.i).map(|(t, _)| t.clone());
        if t.is_some() {
            self.i += 1;
        }
        t
    }

    fn eat(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Sym(s)) if *s == sym) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Ident(s)) if s == word) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, sym: &str) -> CvResult<()> {
        if self.eat(sym) {
            return Ok(());
        }
        Err(self.unexpected(&format!("'{sym}'")))
    }

    fn unexpected(&self, wanted: &str) -> CvError {
        match self.peek() {
            Some(t) => CvError::parse(self.pos(), format!("期望 {wanted}, 得到 {}", t.describe())),
            None => CvError::parse(self.end, format!("期望 {wanted}, 输入已结束")),
        }
    }

    fn finish(&self) -> CvResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(CvError::parse(self.pos(), format!("多余的 {}", t.describe()))),
        }
    }

    // ---- 表达式 ----

    fn parse_expr(&mut self) -> CvResult<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            if self.eat("+") {
                lhs = lhs + self.parse_term()?;
            } else if self.eat("-") {
                lhs = lhs - self.parse_term()?;
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_term(&mut self) -> CvResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            if self.eat("*") {
                let rhs = self.parse_unary()?;
                lhs = times(lhs, rhs);
            } else if self.eat("/") {
                let pos = self.pos();
                match self.parse_unary()? {
                    Expr::Scalar(c) if c.norm() > 0.0 => lhs = times(lhs, Expr::Scalar(c.inv())),
                    Expr::Scalar(_) => return Err(CvError::parse(pos, "除以零")),
                    _ => return Err(CvError::parse(pos, "只能除以常数")),
                }
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_unary(&mut self) -> CvResult<Expr> {
        if self.eat("-") {
            return Ok(match self.parse_unary()? {
                Expr::Scalar(c) => Expr::Scalar(-c),
                e => -e,
            });
        }
        if self.eat("+") {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> CvResult<Expr> {
        let pos = self.pos();
        match self.bump() {
            Some(Tok::Num(x)) => Ok(Expr::Scalar(Complex64::new(x, 0.0))),
            Some(Tok::Imag(x)) => Ok(Expr::Scalar(Complex64::new(0.0, x))),
            Some(Tok::Sym("(")) => {
                let e = self.parse_expr()?;
                self.expect(")")?;
                Ok(e)
            }
            Some(Tok::Ident(name)) => {
                if self.eat("(") {
                    self.parse_call(&name, pos)
                } else {
                    self.lookup(&name, pos)
                }
            }
            Some(t) => Err(CvError::parse(pos, format!("意外的 {}", t.describe()))),
            None => Err(self.unexpected("表达式")),
        }
    }

    fn lookup(&self, name: &str, pos: usize) -> CvResult<Expr> {
        if let Some(f) = self.ns.fields.get(name) {
            return Ok(Expr::Field(f.clone()));
        }
        if let Some(c) = self.ns.scalars.get(name) {
            return Ok(Expr::Scalar(*c));
        }
        Err(CvError::parse(pos, format!("未定义的名称 '{name}'")))
    }

    /// `(` 之后的参数表，直到 `)`
    fn parse_args(&mut self) -> CvResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(")") {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(")") {
                return Ok(args);
            }
            self.expect(",")?;
        }
    }

    /// `r = number`
    fn parse_radius(&mut self) -> CvResult<f64> {
        if !self.eat_word("r") {
            return Err(self.unexpected("'r='"));
        }
        self.expect("=")?;
        let neg = self.eat("-");
        let pos = self.pos();
        match self.bump() {
            Some(Tok::Num(x)) => Ok(if neg { -x } else { x }),
            _ => Err(CvError::parse(pos, "半径必须是数字")),
        }
    }

    fn parse_call(&mut self, name: &str, pos: usize) -> CvResult<Expr> {
        // name(r=...) 为插值
        if matches!(self.peek(), Some(Tok::Ident(s)) if s == "r")
            && matches!(self.toks.get(self.i + 1), Some((Tok::Sym("="), _)))
        {
            let r = self.parse_radius()?;
            self.expect(")")?;
            return Ok(expr::interp(self.lookup(name, pos)?, r));
        }
        if name == "interp" {
            let e = self.parse_expr()?;
            self.expect(",")?;
            let r = if matches!(self.peek(), Some(Tok::Ident(s)) if s == "r") {
                self.parse_radius()?
            } else {
                scalar_arg(&self.parse_expr()?, pos)?
            };
            self.expect(")")?;
            return Ok(expr::interp(e, r));
        }
        if name == "lift" {
            return self.parse_lift(pos);
        }

        let mut args = self.parse_args()?;
        let argc = args.len();
        let arity = |n: usize| -> CvResult<()> {
            if argc == n {
                Ok(())
            } else {
                Err(CvError::parse(pos, format!("{name} 需要 {n} 个参数, 得到 {argc}")))
            }
        };
        let unary: Option<fn(Expr) -> Expr> = match name {
            "grad" => Some(expr::grad),
            "div" => Some(expr::div),
            "curl" => Some(expr::curl),
            "lap" => Some(expr::lap),
            "dt" => Some(expr::dt),
            "skew" => Some(expr::skew),
            "trace" => Some(expr::trace),
            "radial" => Some(expr::radial),
            "angular" => Some(expr::angular),
            _ => None,
        };
        if let Some(f) = unary {
            arity(1)?;
            return Ok(f(args.remove(0)));
        }
        match name {
            "dot" | "cross" => {
                arity(2)?;
                let mut it = args.into_iter();
                let (Some(a), Some(b)) = (it.next(), it.next()) else {
                    return Err(CvError::parse(pos, format!("{name} 需要 2 个参数")));
                };
                Ok(if name == "dot" { expr::dot(a, b) } else { expr::cross(a, b) })
            }
            _ => Err(CvError::parse(pos, format!("未知函数 '{name}'"))),
        }
    }

    /// `lift(x)`, `lift(x, n)`, `lift(x, basis, n)`
    fn parse_lift(&mut self, pos: usize) -> CvResult<Expr> {
        let e = self.parse_expr()?;
        let mut basis = self.ns.lift_basis.clone();
        let mut n = DEFAULT_LIFT_MODE;
        if self.eat(",") {
            if let Some(Tok::Ident(b)) = self.peek().cloned() {
                if let Some(found) = self.ns.bases.get(&b) {
                    basis = Some(found.clone());
                    self.i += 1;
                    if !self.eat(",") {
                        self.expect(")")?;
                        return self.make_lift(e, basis, n, pos);
                    }
                }
            }
            let npos = self.pos();
            let value = scalar_arg(&self.parse_expr()?, npos)?;
            if value.fract() != 0.0 {
                return Err(CvError::parse(npos, "提升模式必须是整数"));
            }
            n = value as i32;
        }
        self.expect(")")?;
        self.make_lift(e, basis, n, pos)
    }

    fn make_lift(&self, e: Expr, basis: Option<Arc<Basis>>, n: i32, pos: usize) -> CvResult<Expr> {
        let basis = basis.ok_or_else(|| CvError::parse(pos, "lift 缺少目标基（名称空间未设置默认提升基）"))?;
        Ok(expr::lift(e, &basis, n))
    }

    // ---- 条件 ----

    fn parse_cond(&mut self) -> CvResult<Condition> {
        let mut lhs = self.parse_conj()?;
        while self.eat_word("or") {
            lhs = lhs.or(self.parse_conj()?);
        }
        Ok(lhs)
    }

    fn parse_conj(&mut self) -> CvResult<Condition> {
        let mut lhs = self.parse_cmp()?;
        while self.eat_word("and") {
            lhs = lhs.and(self.parse_cmp()?);
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> CvResult<Condition> {
        if self.eat("(") {
            let c = self.parse_cond()?;
            self.expect(")")?;
            return Ok(c);
        }
        if self.eat_word("true") {
            return Ok(Condition::Always);
        }
        let pos = self.pos();
        let var = match self.bump() {
            Some(Tok::Ident(s)) if s == "m" => ModeVar::M,
            Some(Tok::Ident(s)) if s == "ell" || s == "l" => ModeVar::Ell,
            _ => return Err(CvError::parse(pos, "条件变量必须是 m 或 ell")),
        };
        let pos = self.pos();
        let op = match self.bump() {
            Some(Tok::Sym("==")) => CmpOp::Eq,
            Some(Tok::Sym("!=")) => CmpOp::Ne,
            Some(Tok::Sym("<")) => CmpOp::Lt,
            Some(Tok::Sym("<=")) => CmpOp::Le,
            Some(Tok::Sym(">")) => CmpOp::Gt,
            Some(Tok::Sym(">=")) => CmpOp::Ge,
            _ => return Err(CvError::parse(pos, "期望比较运算符")),
        };
        let neg = self.eat("-");
        let pos = self.pos();
        let value = match self.bump() {
            Some(Tok::Num(x)) if x.fract() == 0.0 => x as i64,
            _ => return Err(CvError::parse(pos, "比较值必须是整数")),
        };
        Ok(Condition::Compare {
            var,
            op,
            value: if neg { -value } else { value },
        })
    }
}

/// 乘法：常数因子折叠为缩放
fn times(a: Expr, b: Expr) -> Expr {
    match (a, b) {
        (Expr::Scalar(x), Expr::Scalar(y)) => Expr::Scalar(x * y),
        (Expr::Scalar(c), e) | (e, Expr::Scalar(c)) => Expr::Scale(c, Box::new(e)),
        (a, b) => expr::mul(a, b),
    }
}

fn scalar_arg(e: &Expr, pos: usize) -> CvResult<f64> {
    match e {
        Expr::Scalar(c) if c.im == 0.0 => Ok(c.re),
        _ => Err(CvError::parse(pos, "期望实数参数")),
    }
}

// =============================================================================
// 入口
// =============================================================================

/// 解析表达式
pub fn parse_expr(src: &str, ns: &Namespace) -> CvResult<Expr> {
    let mut p = Parser::new(src, ns)?;
    let e = p.parse_expr()?;
    p.finish()?;
    Ok(e)
}

/// 解析方程 `lhs = rhs`
pub fn parse_equation(src: &str, ns: &Namespace) -> CvResult<(Expr, Expr)> {
    let mut p = Parser::new(src, ns)?;
    let lhs = p.parse_expr()?;
    p.expect("=")?;
    let rhs = p.parse_expr()?;
    p.finish()?;
    Ok((lhs, rhs))
}

/// 解析模式条件，空串视为恒真
pub fn parse_condition(src: &str) -> CvResult<Condition> {
    if src.trim().is_empty() {
        return Ok(Condition::Always);
    }
    let ns = Namespace::default();
    let mut p = Parser::new(src, &ns)?;
    let c = p.parse_cond()?;
    p.finish()?;
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_foundation::ModeKey;

    fn setup() -> (Arc<Basis>, Namespace) {
        let basis = Arc::new(Basis::ball(1.0, [8, 8, 8], 1.5).unwrap());
        let u = Field::scalar("u", &basis).unwrap();
        let f = Field::scalar("f", &basis).unwrap();
        let tau = Field::with_meta(
            "tau",
            crate::field::FieldMeta::new(&basis.surface(1.0).unwrap(), 0),
        )
        .unwrap();
        let ns = Namespace::new()
            .with_field(&u)
            .with_field(&f)
            .with_field(&tau)
            .with_scalar("kappa", 0.5)
            .with_lift_basis(&basis);
        (basis, ns)
    }

    #[test]
    fn test_lex_numbers() {
        let toks: Vec<Tok> = lex("1.5 1e-3 2j .5 x2").unwrap().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            toks,
            vec![
                Tok::Num(1.5),
                Tok::Num(1e-3),
                Tok::Imag(2.0),
                Tok::Num(0.5),
                Tok::Ident("x2".into())
            ]
        );
    }

    #[test]
    fn test_parse_equation_structure() {
        let (_, ns) = setup();
        let (lhs, rhs) = parse_equation("dt(u) - kappa*lap(u) + lift(tau) = f*u", &ns).unwrap();
        assert_eq!(lhs.to_string(), "((dt(u) + -0.5*lap(u)) + lift(tau, -1))");
        assert_eq!(rhs.to_string(), "f*u");
        assert_eq!(lhs.shape().unwrap().sig.rank, 0);
    }

    #[test]
    fn test_parse_interp_forms() {
        let (_, ns) = setup();
        let a = parse_expr("u(r=1.0)", &ns).unwrap();
        let b = parse_expr("interp(u, r=1.0)", &ns).unwrap();
        assert_eq!(a.to_string(), b.to_string());
        assert!(a.shape().is_ok());
        let c = parse_expr("radial(grad(u))(r=1)", &ns);
        assert!(c.is_err());
    }

    #[test]
    fn test_division_and_imaginary() {
        let (_, ns) = setup();
        let e = parse_expr("u/2 + 2j*u", &ns).unwrap();
        assert_eq!(e.to_string(), "(0.5*u + (0+2j)*u)");
        let err = parse_expr("u/u", &ns).unwrap_err();
        assert!(matches!(err, CvError::Parse { position: 2, .. }));
    }

    #[test]
    fn test_parse_errors_carry_position() {
        let (_, ns) = setup();
        match parse_expr("grad(v)", &ns) {
            Err(CvError::Parse { position, .. }) => assert_eq!(position, 5),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_equation("u + ", &ns) {
            Err(CvError::Parse { position, .. }) => assert_eq!(position, 4),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_expr("u $ f", &ns).is_err());
        assert!(parse_expr("foo(u)", &ns).is_err());
        assert!(parse_expr("dot(u)", &ns).is_err());
    }

    #[test]
    fn test_parse_condition() {
        let c = parse_condition("ell == 0 or m >= 2 and ell != 3").unwrap();
        assert!(c.holds(ModeKey::new(0, 0)));
        assert!(c.holds(ModeKey::new(2, 4)));
        assert!(!c.holds(ModeKey::new(2, 3)));
        assert!(!c.holds(ModeKey::new(1, 1)));
        assert_eq!(parse_condition("").unwrap(), Condition::Always);
        assert!(parse_condition("n == 1").is_err());
    }
}
