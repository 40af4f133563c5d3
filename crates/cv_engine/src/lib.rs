// crates/cv_engine/src/lib.rs

//! curvispec Engine Layer (Layer 3)
//!
//! 曲线坐标谱方法引擎：
//!
//! - [`coords`] / [`basis`]: 圆周、球面、球体、球壳几何与谱基
//! - [`layout`] / [`regularity`]: 模式组内系数排布与正则性分量
//! - [`transforms`] / [`field`]: 网格-系数变换与场句柄
//! - [`operators`]: 梯度、散度、旋度、拉普拉斯、插值、提升等线性算子矩阵
//! - [`expr`] / [`parser`]: 算子树与方程字符串解析
//! - [`ncc`]: 非常系数乘积矩阵及缓存
//! - [`problem`]: 方程组、边界条件与子问题分解
//! - [`timesteppers`] / [`solvers`]: IMEX 时间推进、LBVP/IVP 求解器
//! - [`distributor`]: 进程组通信与全局归约
//!
//! # 特性开关
//!
//! - `parallel`: 子问题组装与求解使用 rayon
//!
//! # 示例
//!
//! ```no_run
//! use cv_engine::prelude::*;
//! use std::sync::Arc;
//!
//! let basis = Arc::new(Basis::ball(1.0, [8, 8, 12], 1.5)?);
//! let u = Field::scalar("u", &basis)?;
//! let mut problem = Problem::new(&[u.clone()]);
//! let eq = problem.add_equation_str("lap(u) = 6", "")?;
//! problem.add_bc_str("u(r=1) = 1", eq)?;
//! let mut solver = LinearBoundaryValueSolver::new(&problem)?;
//! solver.solve()?;
//! # Ok::<(), cv_engine::CvError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod basis;
pub mod coords;
pub mod distributor;
pub mod expr;
pub mod field;
pub mod layout;
pub mod ncc;
pub mod operators;
pub mod parser;
pub mod problem;
pub mod regularity;
pub mod solvers;
pub mod timesteppers;
pub mod transforms;

/// 层级标识
pub const LAYER: u8 = 3;

pub use basis::{Basis, BasisRegistry, Scales};
pub use coords::Geometry;
pub use cv_foundation::{CvError, CvResult, ModeKey};
pub use distributor::{Communicator, Distributor, GlobalArrayReducer, ReduceOp, SelfComm, ThreadComm};
pub use expr::{Expr, ExprShape, LinearForm};
pub use field::{Dtype, Field, FieldMeta};
pub use layout::{BlockLayout, FieldLayout};
pub use ncc::{NccCache, NccExpression, NccSide};
pub use operators::{operator_matrix, LinearOp};
pub use parser::{parse_condition, parse_equation, parse_expr, Namespace};
pub use problem::{Condition, Equation, Problem, Subproblem, SubproblemMatrices, SubproblemSet};
pub use solvers::{InitialValueSolver, IvpState, LbvpState, LinearBoundaryValueSolver};
pub use timesteppers::{stepper, ImexSystem, TimeStepper};

/// Prelude 模块
pub mod prelude {
    pub use crate::basis::Basis;
    pub use crate::expr::{
        angular, cross, curl, div, dot, dt, grad, interp, lap, lift, mul, radial, skew, trace, Expr,
    };
    pub use crate::field::Field;
    pub use crate::problem::{Condition, Problem};
    pub use crate::solvers::{InitialValueSolver, LinearBoundaryValueSolver};
    pub use cv_config::{SchemeKind, SolverConfig};
    pub use cv_foundation::{CvError, CvResult, ModeKey};
}
