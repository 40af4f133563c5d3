// crates/cv_foundation/src/lib.rs

//! curvispec Foundation Layer
//!
//! 基础层，提供整个项目共享的最小抽象。
//!
//! # 模块概览
//!
//! - [`error`]: 统一错误类型 `CvError` / `CvResult`
//! - [`mode`]: 子问题模式组键 `ModeKey`
//! - [`tolerance`]: 数值容差
//!
//! # 设计原则
//!
//! 1. **最少依赖**: 仅依赖 serde 和 thiserror
//! 2. **错误前置**: 配置类错误在构建期立即返回，不做恢复
//! 3. **无全局状态**: 容差等参数以值注入

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod mode;
pub mod tolerance;

/// 层级标识
pub const LAYER: u8 = 1;

// 重导出常用类型
pub use error::{CvError, CvResult};
pub use mode::ModeKey;
pub use tolerance::Tolerance;

/// Prelude 模块，包含常用类型
pub mod prelude {
    pub use crate::ensure;
    pub use crate::error::{CvError, CvResult};
    pub use crate::mode::ModeKey;
    pub use crate::tolerance::Tolerance;
}
