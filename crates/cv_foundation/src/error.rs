// crates/cv_foundation/src/error.rs

//! 错误处理模块，定义统一错误类型
//!
//! 提供 `CvError` 枚举和 `CvResult` 类型别名，用于整个项目的错误处理。
//!
//! # 错误分类
//!
//! | 变体 | 触发时机 | 是否可恢复 |
//! |------|----------|------------|
//! | `Configuration` | 构建基、场、算子时 | 否，立即返回 |
//! | `UnsupportedNccExpression` | 表达式构建/矩阵化时 | 否 |
//! | `InconsistentEquationSet` | 问题构建时 | 否 |
//! | `SingularSystem` | 因式分解时 | 否，携带模式键 |
//!
//! # 示例
//!
//! ```
//! use cv_foundation::error::{CvError, CvResult};
//!
//! fn check_rank(rank: usize) -> CvResult<()> {
//!     if rank > 4 {
//!         return Err(CvError::configuration("张量阶数过高"));
//!     }
//!     Ok(())
//! }
//! assert!(check_rank(5).is_err());
//! ```

use crate::mode::ModeKey;
use thiserror::Error;

/// 统一结果类型
pub type CvResult<T> = Result<T, CvError>;

/// curvispec 错误类型
#[derive(Error, Debug)]
pub enum CvError {
    // ========================================================================
    // 构建期错误
    // ========================================================================
    /// 张量阶数/基不兼容、张量指标非法等
    #[error("配置错误: {message}")]
    Configuration {
        /// 具体错误信息
        message: String,
    },

    /// 矩阵构建器无法表示的表达式结构
    #[error("不支持的 NCC 表达式: {message}")]
    UnsupportedNccExpression {
        /// 具体错误信息
        message: String,
    },

    /// 某个模式组的方程行数与未知量列数不一致
    #[error("方程组不一致: 模式 {key} 有 {rows} 行, {cols} 列")]
    InconsistentEquationSet {
        /// 出错的模式组
        key: ModeKey,
        /// 方程行数
        rows: usize,
        /// 未知量列数
        cols: usize,
    },

    /// 方程文本解析失败
    #[error("解析错误 (位置 {position}): {message}")]
    Parse {
        /// 出错的字符位置
        position: usize,
        /// 错误信息
        message: String,
    },

    // ========================================================================
    // 求解期错误
    // ========================================================================
    /// 因式分解失败（矩阵奇异）
    #[error("奇异线性系统: 模式 {key}, 最小主元 {pivot:.3e}")]
    SingularSystem {
        /// 出错的模式组
        key: ModeKey,
        /// 最小主元模长（相对）
        pivot: f64,
    },

    /// 数组大小不匹配
    #[error("数组大小不匹配: {name} 期望{expected}, 实际{actual}")]
    SizeMismatch {
        /// 数据名称
        name: &'static str,
        /// 期望大小
        expected: usize,
        /// 实际大小
        actual: usize,
    },

    // ========================================================================
    // 外部错误
    // ========================================================================
    /// IO 错误
    #[error("IO错误: {message}")]
    Io {
        /// 描述性错误信息
        message: String,
        #[source]
        /// 底层 IO 错误
        source: Option<std::io::Error>,
    },

    /// 序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        /// 序列化失败原因
        message: String,
    },

    /// 内部错误
    #[error("内部错误: {message}")]
    Internal {
        /// 内部错误描述
        message: String,
    },
}

// ========================================================================
// 便捷构造方法
// ========================================================================

impl CvError {
    /// 配置错误
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// 不支持的 NCC 表达式
    pub fn unsupported_ncc(message: impl Into<String>) -> Self {
        Self::UnsupportedNccExpression {
            message: message.into(),
        }
    }

    /// 方程组不一致
    pub fn inconsistent(key: ModeKey, rows: usize, cols: usize) -> Self {
        Self::InconsistentEquationSet { key, rows, cols }
    }

    /// 奇异系统
    pub fn singular(key: ModeKey, pivot: f64) -> Self {
        Self::SingularSystem { key, pivot }
    }

    /// 解析错误
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }

    /// 数组大小不匹配
    pub fn size_mismatch(name: &'static str, expected: usize, actual: usize) -> Self {
        Self::SizeMismatch {
            name,
            expected,
            actual,
        }
    }

    /// 序列化错误
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// 内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// 错误是否携带模式键
    pub fn mode_key(&self) -> Option<ModeKey> {
        match self {
            Self::InconsistentEquationSet { key, .. } | Self::SingularSystem { key, .. } => {
                Some(*key)
            }
            _ => None,
        }
    }
}

// ========================================================================
// 验证辅助方法
// ========================================================================

impl CvError {
    /// 检查数组大小是否匹配
    #[inline]
    pub fn check_size(name: &'static str, expected: usize, actual: usize) -> CvResult<()> {
        if expected != actual {
            Err(Self::size_mismatch(name, expected, actual))
        } else {
            Ok(())
        }
    }
}

/// 条件不满足时返回错误
///
/// ```
/// use cv_foundation::{ensure, CvError, CvResult};
///
/// fn positive(x: f64) -> CvResult<f64> {
///     ensure!(x > 0.0, CvError::configuration("x 必须为正"));
///     Ok(x)
/// }
/// assert!(positive(-1.0).is_err());
/// ```
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err.into());
        }
    };
}

// ========================================================================
// 标准库错误转换
// ========================================================================

impl From<std::io::Error> for CvError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

// ========================================================================
// 测试
// ========================================================================
