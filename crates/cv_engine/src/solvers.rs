// crates/cv_engine/src/solvers.rs

//! 线性边值问题与初值问题求解器
//!
//! # 生命周期
//!
//! ```text
//! LBVP: Built ──factorize──> Factorized ──solve──> Solved
//!                  ^                                  │
//!                  └──────────── rebuild_ncc ─────────┘
//!
//! IVP:  Built ──step──> Stepping ──(停止条件 / 失败)──> Stopped
//! ```
//!
//! 子问题之间互相独立；启用 `parallel` 特性时分解与回代按子问题并行。

use crate::field::Field;
use crate::problem::{Problem, Subproblem, SubproblemSet};
use crate::timesteppers::{stepper, BlockVectors, ImexSystem, TimeStepper};
use chrono::{DateTime, Utc};
use cv_foundation::{ensure, CvError, CvResult};
use num_complex::Complex64;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// 对全部子问题求解 `(a M + b L) x = rhs`
fn solve_blocks(set: &SubproblemSet, a: f64, b: f64, rhs: &BlockVectors) -> CvResult<BlockVectors> {
    CvError::check_size("rhs blocks", set.len(), rhs.len())?;
    let config = set.config();
    let solve_one = |(sp, r): (&Subproblem, &Vec<Complex64>)| -> CvResult<Vec<Complex64>> {
        let f = sp.factorization(a, b, config)?;
        CvError::check_size("subproblem rhs", sp.size(), r.len())?;
        Ok(f.solve(r))
    };
    #[cfg(feature = "parallel")]
    {
        set.subproblems()
            .par_iter()
            .zip(rhs.par_iter())
            .map(solve_one)
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        set.subproblems().iter().zip(rhs.iter()).map(solve_one).collect()
    }
}

// =============================================================================
// LBVP
// =============================================================================

/// LBVP 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbvpState {
    /// 矩阵已组装
    Built,
    /// 已分解
    Factorized,
    /// 已求解
    Solved,
}

/// 线性边值问题求解器
#[derive(Debug)]
pub struct LinearBoundaryValueSolver {
    subproblems: SubproblemSet,
    factored: Vec<Option<u64>>,
    state: LbvpState,
}

impl LinearBoundaryValueSolver {
    /// 由问题构建
    pub fn new(problem: &Problem) -> CvResult<Self> {
        Self::from_subproblems(problem.build()?)
    }

    /// 由已构建的子问题集合创建
    pub fn from_subproblems(subproblems: SubproblemSet) -> CvResult<Self> {
        ensure!(
            !subproblems.has_time_derivative(),
            CvError::configuration("边值问题不能含时间导数")
        );
        log::info!(
            "LBVP: {} 个子问题, 总规模 {}",
            subproblems.len(),
            subproblems.total_size()
        );
        let n = subproblems.len();
        Ok(Self {
            subproblems,
            factored: vec![None; n],
            state: LbvpState::Built,
        })
    }

    /// 当前状态
    pub fn state(&self) -> LbvpState {
        self.state
    }

    /// 子问题
    pub fn subproblems(&self) -> &SubproblemSet {
        &self.subproblems
    }

    /// 变量（含 tau）
    pub fn variables(&self) -> &[Field] {
        self.subproblems.variables()
    }

    /// 分解矩阵版本变化过的子问题，返回本次分解的个数
    pub fn factorize(&mut self) -> CvResult<usize> {
        let set = &self.subproblems;
        let stale: Vec<usize> = set
            .subproblems()
            .iter()
            .filter(|sp| self.factored[sp.index()] != Some(sp.revision()))
            .map(|sp| sp.index())
            .collect();
        let work = |&i: &usize| -> CvResult<()> {
            set.subproblems()[i].factorization(0.0, 1.0, set.config()).map(|_| ())
        };
        #[cfg(feature = "parallel")]
        stale.par_iter().try_for_each(work)?;
        #[cfg(not(feature = "parallel"))]
        stale.iter().try_for_each(work)?;

        for &i in &stale {
            self.factored[i] = Some(set.subproblems()[i].revision());
        }
        if !stale.is_empty() {
            log::debug!("LBVP: 分解 {} 个子问题", stale.len());
        }
        self.state = LbvpState::Factorized;
        Ok(stale.len())
    }

    /// 求解并把结果写回变量
    pub fn solve(&mut self) -> CvResult<()> {
        self.factorize()?;
        let rhs = self.subproblems.rhs_vectors()?;
        let x = solve_blocks(&self.subproblems, 0.0, 1.0, &rhs)?;
        self.subproblems.scatter(&x)?;
        self.state = LbvpState::Solved;
        log::info!("LBVP: 求解完成");
        Ok(())
    }

    /// 系数场变化后重建相关 NCC 矩阵，返回受影响的子问题数
    pub fn rebuild_ncc(&mut self, coef: &Field) -> CvResult<usize> {
        let n = self.subproblems.rebuild_ncc(coef)?;
        if n > 0 {
            self.state = LbvpState::Built;
        }
        Ok(n)
    }
}

// =============================================================================
// IVP
// =============================================================================

/// IVP 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvpState {
    /// 矩阵已组装
    Built,
    /// 推进中
    Stepping,
    /// 已停止
    Stopped,
}

/// 把子问题集合接到时间推进器上
struct SubproblemSystem<'a> {
    set: &'a SubproblemSet,
}

impl ImexSystem for SubproblemSystem<'_> {
    fn n_blocks(&self) -> usize {
        self.set.len()
    }

    fn state(&self) -> CvResult<BlockVectors> {
        self.set.gather()
    }

    fn set_state(&mut self, x: &BlockVectors) -> CvResult<()> {
        self.set.scatter(x)
    }

    fn explicit_rhs(&mut self, _time: f64) -> CvResult<BlockVectors> {
        self.set.rhs_vectors()
    }

    fn apply_m(&self, block: usize, x: &[Complex64]) -> Vec<Complex64> {
        self.set.subproblems()[block].apply_m(x)
    }

    fn apply_l(&self, block: usize, x: &[Complex64]) -> Vec<Complex64> {
        self.set.subproblems()[block].apply_l(x)
    }

    fn solve(&self, a: f64, b: f64, rhs: &BlockVectors) -> CvResult<BlockVectors> {
        solve_blocks(self.set, a, b, rhs)
    }
}

/// 初值问题求解器
#[derive(Debug)]
pub struct InitialValueSolver {
    subproblems: SubproblemSet,
    stepper: Box<dyn TimeStepper>,
    state: IvpState,
    sim_time: f64,
    iteration: u64,
    last_dt: Option<f64>,
    start: DateTime<Utc>,
    stop_sim_time: Option<f64>,
    stop_iteration: Option<u64>,
    stop_wall_time: Option<f64>,
}

impl InitialValueSolver {
    /// 由问题构建，时间格式与停止条件取自问题配置
    pub fn new(problem: &Problem) -> CvResult<Self> {
        Self::from_subproblems(problem.build()?)
    }

    /// 由已构建的子问题集合创建
    pub fn from_subproblems(subproblems: SubproblemSet) -> CvResult<Self> {
        ensure!(
            subproblems.has_time_derivative(),
            CvError::configuration("初值问题至少需要一个时间导数项")
        );
        let time = subproblems.config().time.clone();
        let stepper = stepper(time.scheme);
        log::info!(
            "IVP: {} 个子问题, 总规模 {}, 格式 {}",
            subproblems.len(),
            subproblems.total_size(),
            stepper.name()
        );
        Ok(Self {
            subproblems,
            stepper,
            state: IvpState::Built,
            sim_time: 0.0,
            iteration: 0,
            last_dt: None,
            start: Utc::now(),
            stop_sim_time: time.stop_sim_time,
            stop_iteration: time.stop_iteration,
            stop_wall_time: time.stop_wall_time,
        })
    }

    /// 当前状态
    pub fn state(&self) -> IvpState {
        self.state
    }

    /// 模拟时间
    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    /// 已完成步数
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// 自创建起经过的墙钟时间 [s]
    pub fn wall_time(&self) -> f64 {
        (Utc::now() - self.start).num_milliseconds() as f64 * 1e-3
    }

    /// 时间格式名称
    pub fn scheme_name(&self) -> &'static str {
        self.stepper.name()
    }

    /// 子问题
    pub fn subproblems(&self) -> &SubproblemSet {
        &self.subproblems
    }

    /// 设置模拟时间停止条件
    pub fn set_stop_sim_time(&mut self, t: Option<f64>) {
        self.stop_sim_time = t;
    }

    /// 设置步数停止条件
    pub fn set_stop_iteration(&mut self, n: Option<u64>) {
        self.stop_iteration = n;
    }

    /// 设置墙钟停止条件
    pub fn set_stop_wall_time(&mut self, seconds: Option<f64>) {
        self.stop_wall_time = seconds;
    }

    /// 是否应继续推进
    pub fn proceed(&self) -> bool {
        if self.state == IvpState::Stopped {
            return false;
        }
        if self.stop_sim_time.is_some_and(|t| self.sim_time >= t - 1e-12 * t.abs().max(1.0)) {
            return false;
        }
        if self.stop_iteration.is_some_and(|n| self.iteration >= n) {
            return false;
        }
        if self.stop_wall_time.is_some_and(|w| self.wall_time() >= w) {
            return false;
        }
        true
    }

    /// 推进一步
    pub fn step(&mut self, dt: f64) -> CvResult<()> {
        ensure!(
            self.state != IvpState::Stopped,
            CvError::configuration("求解器已停止")
        );
        ensure!(
            dt.is_finite() && dt > 0.0,
            CvError::configuration(format!("无效步长 {dt}"))
        );
        // 分解只对当前步长保留
        if self.last_dt.is_some_and(|prev| (prev - dt).abs() > 1e-12 * dt) {
            log::debug!("IVP: 步长变为 {dt:.6e}, 丢弃已缓存的分解");
            self.subproblems.clear_factorizations();
        }
        self.last_dt = Some(dt);
        self.state = IvpState::Stepping;
        let mut system = SubproblemSystem {
            set: &self.subproblems,
        };
        if let Err(err) = self.stepper.advance(&mut system, self.sim_time, dt) {
            self.state = IvpState::Stopped;
            log::warn!(
                "IVP: 第 {} 步失败, 停止推进: {err}",
                self.iteration + 1
            );
            return Err(err);
        }
        self.sim_time += dt;
        self.iteration += 1;
        log::trace!("IVP: 第 {} 步, t = {:.6e}", self.iteration, self.sim_time);
        if !self.proceed() {
            self.state = IvpState::Stopped;
            log::info!(
                "IVP: 停止于 t = {:.6e}, 共 {} 步, 墙钟 {:.3} s",
                self.sim_time,
                self.iteration,
                self.wall_time()
            );
        }
        Ok(())
    }

    /// 以固定步长推进直到停止条件满足
    pub fn evolve(&mut self, dt: f64) -> CvResult<()> {
        ensure!(
            self.stop_sim_time.is_some() || self.stop_iteration.is_some() || self.stop_wall_time.is_some(),
            CvError::configuration("未设置任何停止条件")
        );
        while self.proceed() {
            self.step(dt)?;
        }
        Ok(())
    }
}
