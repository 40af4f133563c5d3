// crates/cv_foundation/src/tolerance.rs

//! 数值容差
//!
//! 不使用全局可变状态：容差以值的形式注入到需要它的组件中。

use serde::{Deserialize, Serialize};

/// 机器精度量级的舍入噪声阈值
pub const ROUNDOFF: f64 = 1e-14;

/// 数值容差集合
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    /// 正交化秩判定的相对阈值
    pub rank: f64,
    /// LU 主元的相对奇异阈值
    pub pivot: f64,
    /// 稀疏矩阵元素的相对丢弃阈值
    pub entry: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rank: 1e-10,
            pivot: 1e-13,
            entry: ROUNDOFF,
        }
    }
}

impl Tolerance {
    /// 判断 `value` 相对 `scale` 是否可忽略
    #[inline]
    pub fn negligible(value: f64, scale: f64, rel: f64) -> bool {
        value.abs() <= rel * scale.abs().max(f64::MIN_POSITIVE)
    }
}
