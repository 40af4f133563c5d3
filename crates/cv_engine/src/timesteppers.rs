// crates/cv_engine/src/timesteppers.rs

//! IMEX 时间推进格式
//!
//! 半离散系统按模式组拆成互相独立的块：
//!
//! ```text
//! M dX/dt + L X = F(X, t)
//! ```
//!
//! `L` 隐式处理，`F` 显式处理。
//!
//! ## 多步格式 (SBDF / CNAB)
//!
//! ```text
//! Σ_j a_j M X^{n+1-j} + Σ_j b_j L X^{n+1-j} = Σ_{j≥1} c_j F^{n+1-j}
//! ```
//!
//! 每步只需求解 `(a_0 M + b_0 L) X^{n+1} = ...`。历史不足时自动降阶启动。
//! 系数表按等步长推导；步长改变时清空历史并重新从一阶启动。
//!
//! ## 多级格式 (RK111 / RK222)
//!
//! ```text
//! (M + dt H_ii L) X_i = M X_0 + dt Σ_{j<i} (A_ij F_j - H_ij L X_j)
//! ```
//!
//! ## 参考文献
//!
//! 1. Ascher, U. M., Ruuth, S. J., & Wetton, B. T. R. (1995). Implicit-explicit
//!    methods for time-dependent PDEs. SIAM J. Numer. Anal., 32(3), 797-823.
//!
//! 2. Ascher, U. M., Ruuth, S. J., & Spiteri, R. J. (1997). Implicit-explicit
//!    Runge-Kutta methods for time-dependent partial differential equations.
//!    Appl. Numer. Math., 25(2-3), 151-167.

use cv_config::SchemeKind;
use cv_foundation::CvResult;
use num_complex::Complex64;
use std::collections::VecDeque;
use std::fmt::Debug;

const ZERO: Complex64 = Complex64 { re: 0.0, im: 0.0 };

/// 每个子问题一个向量
pub type BlockVectors = Vec<Vec<Complex64>>;

/// 被推进的分块系统
///
/// 实现者负责状态读写、显式项求值以及带缓存的隐式求解。
pub trait ImexSystem {
    /// 块数
    fn n_blocks(&self) -> usize;

    /// 当前状态
    fn state(&self) -> CvResult<BlockVectors>;

    /// 写入状态
    fn set_state(&mut self, x: &BlockVectors) -> CvResult<()>;

    /// 以当前状态求值显式项 `F`
    fn explicit_rhs(&mut self, time: f64) -> CvResult<BlockVectors>;

    /// `M x`
    fn apply_m(&self, block: usize, x: &[Complex64]) -> Vec<Complex64>;

    /// `L x`
    fn apply_l(&self, block: usize, x: &[Complex64]) -> Vec<Complex64>;

    /// 求解 `(a M + b L) x = rhs`（全部块）
    fn solve(&self, a: f64, b: f64, rhs: &BlockVectors) -> CvResult<BlockVectors>;
}

/// 时间推进器
pub trait TimeStepper: Send + Sync + Debug {
    /// 格式名称
    fn name(&self) -> &'static str;

    /// 时间精度阶数
    fn order(&self) -> u8;

    /// 每步的隐式求解次数
    fn stages(&self) -> u8;

    /// 推进一步
    fn advance(&mut self, system: &mut dyn ImexSystem, time: f64, dt: f64) -> CvResult<()>;

    /// 清空历史
    fn reset(&mut self);
}

/// 按名称创建推进器
pub fn stepper(kind: SchemeKind) -> Box<dyn TimeStepper> {
    match kind {
        SchemeKind::Sbdf1 => Box::new(Multistep::new(MultistepFamily::Sbdf, 1)),
        SchemeKind::Sbdf2 => Box::new(Multistep::new(MultistepFamily::Sbdf, 2)),
        SchemeKind::Sbdf3 => Box::new(Multistep::new(MultistepFamily::Sbdf, 3)),
        SchemeKind::Sbdf4 => Box::new(Multistep::new(MultistepFamily::Sbdf, 4)),
        SchemeKind::Cnab1 => Box::new(Multistep::new(MultistepFamily::Cnab, 1)),
        SchemeKind::Cnab2 => Box::new(Multistep::new(MultistepFamily::Cnab, 2)),
        SchemeKind::Rk111 => Box::new(RungeKutta::rk111()),
        SchemeKind::Rk222 => Box::new(RungeKutta::rk222()),
    }
}

fn axpy(y: &mut [Complex64], alpha: f64, x: &[Complex64]) {
    if alpha == 0.0 {
        return;
    }
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += xi * alpha;
    }
}

// =============================================================================
// 多步格式
// =============================================================================

/// 多步格式族
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultistepFamily {
    /// 半隐式 BDF
    Sbdf,
    /// Crank-Nicolson / Adams-Bashforth
    Cnab,
}

/// 多步格式系数（下标 0 为新时间层）
#[derive(Debug, Clone, PartialEq)]
pub struct MultistepCoefficients {
    /// `M` 系数
    pub a: Vec<f64>,
    /// `L` 系数
    pub b: Vec<f64>,
    /// `F` 系数（`c[0]` 恒为 0）
    pub c: Vec<f64>,
}

impl MultistepFamily {
    /// 阶数 `order`、步长 `dt` 下的系数
    pub fn coefficients(&self, order: usize, dt: f64) -> MultistepCoefficients {
        let (a, b, c): (Vec<f64>, Vec<f64>, Vec<f64>) = match (self, order) {
            (Self::Sbdf, 1) => (vec![1.0, -1.0], vec![1.0, 0.0], vec![0.0, 1.0]),
            (Self::Sbdf, 2) => (
                vec![1.5, -2.0, 0.5],
                vec![1.0, 0.0, 0.0],
                vec![0.0, 2.0, -1.0],
            ),
            (Self::Sbdf, 3) => (
                vec![11.0 / 6.0, -3.0, 1.5, -1.0 / 3.0],
                vec![1.0, 0.0, 0.0, 0.0],
                vec![0.0, 3.0, -3.0, 1.0],
            ),
            (Self::Sbdf, _) => (
                vec![25.0 / 12.0, -4.0, 3.0, -4.0 / 3.0, 0.25],
                vec![1.0, 0.0, 0.0, 0.0, 0.0],
                vec![0.0, 4.0, -6.0, 4.0, -1.0],
            ),
            (Self::Cnab, 1) => (vec![1.0, -1.0], vec![0.5, 0.5], vec![0.0, 1.0]),
            (Self::Cnab, _) => (vec![1.0, -1.0, 0.0], vec![0.5, 0.5, 0.0], vec![0.0, 1.5, -0.5]),
        };
        MultistepCoefficients {
            a: a.into_iter().map(|x| x / dt).collect(),
            b,
            c,
        }
    }
}

/// 一个时间层的历史量
#[derive(Debug, Clone)]
struct HistoryLevel {
    mx: BlockVectors,
    lx: BlockVectors,
    f: BlockVectors,
}

/// 多步 IMEX 推进器
#[derive(Debug)]
pub struct Multistep {
    family: MultistepFamily,
    order: usize,
    history: VecDeque<HistoryLevel>,
    last_dt: Option<f64>,
}

impl Multistep {
    /// 创建
    pub fn new(family: MultistepFamily, order: usize) -> Self {
        Self {
            family,
            order,
            history: VecDeque::with_capacity(order),
            last_dt: None,
        }
    }

    /// 下一步实际使用的阶数
    pub fn current_order(&self) -> usize {
        self.order.min(self.history.len() + 1)
    }
}

impl TimeStepper for Multistep {
    fn name(&self) -> &'static str {
        match (self.family, self.order) {
            (MultistepFamily::Sbdf, 1) => "SBDF1",
            (MultistepFamily::Sbdf, 2) => "SBDF2",
            (MultistepFamily::Sbdf, 3) => "SBDF3",
            (MultistepFamily::Sbdf, _) => "SBDF4",
            (MultistepFamily::Cnab, 1) => "CNAB1",
            (MultistepFamily::Cnab, _) => "CNAB2",
        }
    }

    fn order(&self) -> u8 {
        self.order as u8
    }

    fn stages(&self) -> u8 {
        1
    }

    fn reset(&mut self) {
        self.history.clear();
        self.last_dt = None;
    }

    fn advance(&mut self, system: &mut dyn ImexSystem, time: f64, dt: f64) -> CvResult<()> {
        if let Some(prev) = self.last_dt {
            if (prev - dt).abs() > 1e-12 * dt.abs() {
                log::warn!(
                    "{}: 步长由 {prev:.6e} 变为 {dt:.6e}, 历史清空并重新启动",
                    self.name()
                );
                self.history.clear();
            }
        }
        self.last_dt = Some(dt);

        let x = system.state()?;
        let f = system.explicit_rhs(time)?;
        let n = system.n_blocks();
        let level = HistoryLevel {
            mx: (0..n).map(|i| system.apply_m(i, &x[i])).collect(),
            lx: (0..n).map(|i| system.apply_l(i, &x[i])).collect(),
            f,
        };
        self.history.push_front(level);
        self.history.truncate(self.order);

        let order = self.order.min(self.history.len());
        let coef = self.family.coefficients(order, dt);
        let mut rhs: BlockVectors = x.iter().map(|xi| vec![ZERO; xi.len()]).collect();
        for (j, level) in self.history.iter().take(order).enumerate() {
            let k = j + 1;
            for (i, r) in rhs.iter_mut().enumerate() {
                axpy(r, coef.c[k], &level.f[i]);
                axpy(r, -coef.a[k], &level.mx[i]);
                axpy(r, -coef.b[k], &level.lx[i]);
            }
        }
        let x_new = system.solve(coef.a[0], coef.b[0], &rhs)?;
        system.set_state(&x_new)
    }
}

// =============================================================================
// 多级格式
// =============================================================================

/// IMEX Runge-Kutta 系数表（含初始级）
#[derive(Debug, Clone)]
pub struct RungeKutta {
    name: &'static str,
    order: u8,
    /// 级时间
    c: Vec<f64>,
    /// 显式表
    a: Vec<Vec<f64>>,
    /// 隐式表
    h: Vec<Vec<f64>>,
}

impl RungeKutta {
    /// 前向/后向 Euler
    pub fn rk111() -> Self {
        Self {
            name: "RK111",
            order: 1,
            c: vec![0.0, 1.0],
            a: vec![vec![0.0, 0.0], vec![1.0, 0.0]],
            h: vec![vec![0.0, 0.0], vec![0.0, 1.0]],
        }
    }

    /// ARS(2,2,2)
    pub fn rk222() -> Self {
        let gamma = 1.0 - 1.0 / std::f64::consts::SQRT_2;
        let delta = 1.0 - 1.0 / (2.0 * gamma);
        Self {
            name: "RK222",
            order: 2,
            c: vec![0.0, gamma, 1.0],
            a: vec![
                vec![0.0, 0.0, 0.0],
                vec![gamma, 0.0, 0.0],
                vec![delta, 1.0 - delta, 0.0],
            ],
            h: vec![
                vec![0.0, 0.0, 0.0],
                vec![0.0, gamma, 0.0],
                vec![0.0, 1.0 - gamma, gamma],
            ],
        }
    }
}

impl TimeStepper for RungeKutta {
    fn name(&self) -> &'static str {
        self.name
    }

    fn order(&self) -> u8 {
        self.order
    }

    fn stages(&self) -> u8 {
        (self.c.len() - 1) as u8
    }

    fn reset(&mut self) {}

    fn advance(&mut self, system: &mut dyn ImexSystem, time: f64, dt: f64) -> CvResult<()> {
        let n = system.n_blocks();
        let x0 = system.state()?;
        let mx0: BlockVectors = (0..n).map(|i| system.apply_m(i, &x0[i])).collect();
        let mut fs: Vec<BlockVectors> = Vec::with_capacity(self.c.len());
        let mut ls: Vec<BlockVectors> = Vec::with_capacity(self.c.len());
        let mut x = x0;
        for stage in 1..self.c.len() {
            fs.push(system.explicit_rhs(time + self.c[stage - 1] * dt)?);
            ls.push((0..n).map(|i| system.apply_l(i, &x[i])).collect());
            let mut rhs = mx0.clone();
            for j in 0..stage {
                for (i, r) in rhs.iter_mut().enumerate() {
                    axpy(r, dt * self.a[stage][j], &fs[j][i]);
                    axpy(r, -dt * self.h[stage][j], &ls[j][i]);
                }
            }
            x = system.solve(1.0, dt * self.h[stage][stage], &rhs)?;
            system.set_state(&x)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `dx/dt = -(λ_i + μ_i) x`，`λ` 隐式、`μ` 显式，每块一个未知量
    struct Decay {
        x: Vec<Complex64>,
        implicit: Vec<f64>,
        explicit: Vec<f64>,
    }

    impl ImexSystem for Decay {
        fn n_blocks(&self) -> usize {
            self.x.len()
        }

        fn state(&self) -> CvResult<BlockVectors> {
            Ok(self.x.iter().map(|&v| vec![v]).collect())
        }

        fn set_state(&mut self, x: &BlockVectors) -> CvResult<()> {
            for (dst, v) in self.x.iter_mut().zip(x) {
                *dst = v[0];
            }
            Ok(())
        }

        fn explicit_rhs(&mut self, _time: f64) -> CvResult<BlockVectors> {
            Ok(self
                .x
                .iter()
                .zip(&self.explicit)
                .map(|(&v, &mu)| vec![-v * mu])
                .collect())
        }

        fn apply_m(&self, _block: usize, x: &[Complex64]) -> Vec<Complex64> {
            x.to_vec()
        }

        fn apply_l(&self, block: usize, x: &[Complex64]) -> Vec<Complex64> {
            vec![x[0] * self.implicit[block]]
        }

        fn solve(&self, a: f64, b: f64, rhs: &BlockVectors) -> CvResult<BlockVectors> {
            Ok(rhs
                .iter()
                .zip(&self.implicit)
                .map(|(r, &lam)| vec![r[0] / (a + b * lam)])
                .collect())
        }
    }

    fn run(kind: SchemeKind, dt: f64, t_end: f64) -> f64 {
        let mut sys = Decay {
            x: vec![Complex64::new(1.0, 0.0), Complex64::new(0.5, 0.5)],
            implicit: vec![0.7, 2.0],
            explicit: vec![0.3, 0.5],
        };
        let mut ts = stepper(kind);
        let steps = (t_end / dt).round() as usize;
        for k in 0..steps {
            ts.advance(&mut sys, k as f64 * dt, dt).unwrap();
        }
        let exact0 = (-t_end).exp();
        let exact1 = Complex64::new(0.5, 0.5) * (-2.5 * t_end).exp();
        (sys.x[0].re - exact0).abs().max((sys.x[1] - exact1).norm())
    }

    #[test]
    fn test_all_schemes_decay() {
        for kind in SchemeKind::ALL {
            let err = run(kind, 0.01, 1.0);
            assert!(err < 5e-3, "{kind}: 误差 {err}");
        }
    }

    #[test]
    fn test_convergence_orders() {
        let cases = [
            (SchemeKind::Sbdf1, 1),
            (SchemeKind::Sbdf2, 2),
            (SchemeKind::Cnab1, 1),
            (SchemeKind::Cnab2, 2),
            (SchemeKind::Rk111, 1),
            (SchemeKind::Rk222, 2),
        ];
        for (kind, order) in cases {
            let e1 = run(kind, 0.02, 1.0);
            let e2 = run(kind, 0.01, 1.0);
            let ratio = e1 / e2;
            let expected = 2f64.powi(order);
            assert!(
                ratio > 0.7 * expected && ratio < 1.4 * expected,
                "{kind}: 误差比 {ratio}, 期望约 {expected}"
            );
        }
    }

    fn exact(t: f64) -> Vec<Complex64> {
        vec![
            Complex64::new((-t).exp(), 0.0),
            Complex64::new(0.5, 0.5) * (-2.5 * t).exp(),
        ]
    }

    /// 以精确历史启动的 SBDF，排除降阶启动误差
    fn run_sbdf_exact_start(order: usize, dt: f64, t_end: f64) -> f64 {
        let mut sys = Decay {
            x: exact(0.0),
            implicit: vec![0.7, 2.0],
            explicit: vec![0.3, 0.5],
        };
        let mut ts = Multistep::new(MultistepFamily::Sbdf, order);
        ts.last_dt = Some(dt);
        // 队首为最近的时间层
        for j in 1..order {
            let x = exact((order - 1 - j) as f64 * dt);
            ts.history.push_back(HistoryLevel {
                mx: x.iter().map(|&v| vec![v]).collect(),
                lx: x.iter().zip(&sys.implicit).map(|(&v, &l)| vec![v * l]).collect(),
                f: x.iter().zip(&sys.explicit).map(|(&v, &m)| vec![-v * m]).collect(),
            });
        }
        let t0 = (order - 1) as f64 * dt;
        sys.x = exact(t0);
        let steps = ((t_end - t0) / dt).round() as usize;
        for k in 0..steps {
            ts.advance(&mut sys, t0 + k as f64 * dt, dt).unwrap();
        }
        let reference = exact(t0 + steps as f64 * dt);
        sys.x
            .iter()
            .zip(&reference)
            .map(|(a, b)| (a - b).norm())
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_high_order_sbdf_convergence() {
        for order in [3usize, 4] {
            let e1 = run_sbdf_exact_start(order, 0.04, 1.0);
            let e2 = run_sbdf_exact_start(order, 0.02, 1.0);
            let ratio = e1 / e2;
            let expected = 2f64.powi(order as i32);
            assert!(
                ratio > 0.6 * expected && ratio < 1.6 * expected,
                "SBDF{order}: 误差比 {ratio}, 期望约 {expected}"
            );
        }
        let e2 = run_sbdf_exact_start(2, 0.01, 1.0);
        let e3 = run_sbdf_exact_start(3, 0.01, 1.0);
        let e4 = run_sbdf_exact_start(4, 0.01, 1.0);
        assert!(e4 < e3 && e3 < e2, "{e2:.3e} {e3:.3e} {e4:.3e}");
    }

    #[test]
    fn test_coefficients_are_consistent() {
        // Σ a_j = 0 且 Σ c_j = 1（常数解与常数强迫）
        for family in [MultistepFamily::Sbdf, MultistepFamily::Cnab] {
            for order in 1..=4 {
                let k = family.coefficients(order, 0.1);
                assert!(k.a.iter().sum::<f64>().abs() < 1e-12);
                assert!((k.c.iter().sum::<f64>() - 1.0).abs() < 1e-12);
                assert!((k.b.iter().sum::<f64>() - 1.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_startup_and_dt_change() {
        let mut sys = Decay {
            x: vec![Complex64::new(1.0, 0.0)],
            implicit: vec![1.0],
            explicit: vec![0.0],
        };
        let mut ts = Multistep::new(MultistepFamily::Sbdf, 3);
        assert_eq!(ts.current_order(), 1);
        ts.advance(&mut sys, 0.0, 0.1).unwrap();
        assert_eq!(ts.current_order(), 2);
        ts.advance(&mut sys, 0.1, 0.1).unwrap();
        ts.advance(&mut sys, 0.2, 0.1).unwrap();
        assert_eq!(ts.current_order(), 3);
        ts.advance(&mut sys, 0.3, 0.05).unwrap();
        assert_eq!(ts.current_order(), 2);
    }
}
