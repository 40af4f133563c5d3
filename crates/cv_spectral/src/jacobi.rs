// crates/cv_spectral/src/jacobi.rs

//! Jacobi 多项式
//!
//! 采用正交归一三项递推：
//!
//! ```text
//! x p_n = a_{n+1} p_{n+1} + b_n p_n + a_n p_{n-1},   p_0 = 1
//! ```
//!
//! 其中 `p_n` 关于**归一化**测度 `(1-x)^α (1+x)^β dx / μ₀` 正交归一。
//! 需要关于非归一化权重的正交归一性时，调用方再除以 `sqrt(μ₀)`。
//!
//! 导数由递推式逐项求导得到，不依赖参数平移恒等式。

/// 多项式求值表，行为阶数 `n`，列为求值点
#[derive(Debug, Clone)]
pub struct PolyTable {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl PolyTable {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// 阶数个数
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// 求值点个数
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// 第 `n` 阶在第 `q` 个点的值
    #[inline]
    pub fn get(&self, n: usize, q: usize) -> f64 {
        self.data[n * self.cols + q]
    }

    /// 第 `n` 阶在所有点的值
    #[inline]
    pub fn row(&self, n: usize) -> &[f64] {
        &self.data[n * self.cols..(n + 1) * self.cols]
    }

    #[inline]
    fn set(&mut self, n: usize, q: usize, v: f64) {
        self.data[n * self.cols + q] = v;
    }
}

/// Jacobi 参数 `(α, β)`，权重 `(1-x)^α (1+x)^β`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jacobi {
    /// `(1-x)` 指数
    pub alpha: f64,
    /// `(1+x)` 指数
    pub beta: f64,
}

impl Jacobi {
    /// 创建参数对
    pub fn new(alpha: f64, beta: f64) -> Self {
        debug_assert!(alpha > -1.0 && beta > -1.0, "Jacobi 参数必须大于 -1");
        Self { alpha, beta }
    }

    /// Legendre 情形 `(0, 0)`
    pub fn legendre() -> Self {
        Self::new(0.0, 0.0)
    }

    /// 递推系数 `a_n`（`n >= 1`）
    pub fn a(&self, n: usize) -> f64 {
        debug_assert!(n >= 1);
        let (a, b) = (self.alpha, self.beta);
        let n = n as f64;
        let s = 2.0 * n + a + b;
        let num = n * (n + a) * (n + b) * (n + a + b);
        let den = (s - 1.0) * (s + 1.0);
        2.0 / s * (num / den).sqrt()
    }

    /// 递推系数 `b_n`
    pub fn b(&self, n: usize) -> f64 {
        let (a, b) = (self.alpha, self.beta);
        if n == 0 {
            return (b - a) / (a + b + 2.0);
        }
        let s = 2.0 * n as f64 + a + b;
        (b * b - a * a) / (s * (s + 2.0))
    }

    /// 在给定点求 `p_0 .. p_{count-1}`
    pub fn eval(&self, count: usize, x: &[f64]) -> PolyTable {
        self.eval_with_derivative(count, x).0
    }

    /// 同时求值与一阶导数
    pub fn eval_with_derivative(&self, count: usize, x: &[f64]) -> (PolyTable, PolyTable) {
        let mut p = PolyTable::zeros(count, x.len());
        let mut dp = PolyTable::zeros(count, x.len());
        if count == 0 {
            return (p, dp);
        }
        for (q, &xq) in x.iter().enumerate() {
            let mut prev = 0.0;
            let mut dprev = 0.0;
            let mut cur = 1.0;
            let mut dcur = 0.0;
            p.set(0, q, cur);
            for n in 0..count - 1 {
                let an1 = self.a(n + 1);
                let bn = self.b(n);
                let an = if n == 0 { 0.0 } else { self.a(n) };
                let next = ((xq - bn) * cur - an * prev) / an1;
                let dnext = ((xq - bn) * dcur + cur - an * dprev) / an1;
                prev = cur;
                dprev = dcur;
                cur = next;
                dcur = dnext;
                p.set(n + 1, q, cur);
                dp.set(n + 1, q, dcur);
            }
        }
        (p, dp)
    }

    /// 单点求值 `p_n(x)` 及导数
    pub fn eval_single(&self, n: usize, x: f64) -> (f64, f64) {
        let (p, dp) = self.eval_with_derivative(n + 1, &[x]);
        (p.get(n, 0), dp.get(n, 0))
    }
}

/// 整数参数权重的总质量 `∫_{-1}^{1} (1-x)^a (1+x)^b dx = 2^{a+b+1} a! b! / (a+b+1)!`
pub fn integer_mass(a: u32, b: u32) -> f64 {
    let ln_fact = |k: u32| (1..=k).map(|i| (i as f64).ln()).sum::<f64>();
    let ln = (a + b + 1) as f64 * std::f64::consts::LN_2 + ln_fact(a) + ln_fact(b)
        - ln_fact(a + b + 1);
    ln.exp()
}
