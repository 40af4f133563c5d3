// crates/cv_foundation/src/mode.rs

//! 模式组键
//!
//! 每个子问题由 `(m, ℓ)` 唯一标识：`m` 为方位阶数，`ℓ` 为角度阶数。
//! 圆周（S1）几何只有方位模式，此时 `ell` 恒为 0。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 模式组键 `(m, ℓ)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModeKey {
    /// 方位阶数
    pub m: i32,
    /// 角度阶数
    pub ell: u32,
}

impl ModeKey {
    /// 创建模式键
    #[inline]
    pub const fn new(m: i32, ell: u32) -> Self {
        Self { m, ell }
    }

    /// 方位阶数绝对值
    #[inline]
    pub fn abs_m(&self) -> u32 {
        self.m.unsigned_abs()
    }
}

impl fmt::Display for ModeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(m={}, ell={})", self.m, self.ell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_m_major() {
        let mut keys = vec![ModeKey::new(1, 1), ModeKey::new(-1, 2), ModeKey::new(0, 3)];
        keys.sort();
        assert_eq!(keys[0], ModeKey::new(-1, 2));
        assert_eq!(keys[2], ModeKey::new(1, 1));
    }

    #[test]
    fn test_serde_roundtrip() {
        let key = ModeKey::new(-3, 7);
        let json = serde_json::to_string(&key).unwrap();
        let back: ModeKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
        assert_eq!(back.abs_m(), 3);
    }
}
