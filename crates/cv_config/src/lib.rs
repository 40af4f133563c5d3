// crates/cv_config/src/lib.rs

//! curvispec Config Layer (Layer 2)
//!
//! 配置层，提供 NCC 截断、时间推进和矩阵求解器的可序列化配置。
//!
//! # 模块概览
//!
//! - [`solver_config`]: SolverConfig / NccConfig / TimeConfig
//! - [`scheme`]: 时间格式与求解器后端枚举
//! - [`error`]: 配置错误类型
//!
//! # 层级架构
//!
//! ```text
//! Layer 3: cv_engine     ─> uses SolverConfig
//! Layer 2: cv_config     ─> SolverConfig, SchemeKind (本层)
//! Layer 2: cv_spectral
//! Layer 1: cv_foundation
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod scheme;
pub mod solver_config;

/// 层级标识
pub const LAYER: u8 = 2;

// 重导出核心类型
pub use error::ConfigError;
pub use scheme::{MatSolverKind, SchemeKind};
pub use solver_config::{NccConfig, SolverConfig, TimeConfig};
