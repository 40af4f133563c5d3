// crates/cv_config/src/scheme.rs

//! 时间推进格式与矩阵求解器的名称枚举

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IMEX 时间推进格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemeKind {
    /// 一阶半隐式 BDF
    Sbdf1,
    /// 二阶半隐式 BDF
    #[default]
    Sbdf2,
    /// 三阶半隐式 BDF
    Sbdf3,
    /// 四阶半隐式 BDF
    Sbdf4,
    /// 一阶 Crank-Nicolson / Adams-Bashforth
    Cnab1,
    /// 二阶 Crank-Nicolson / Adams-Bashforth
    Cnab2,
    /// 一阶 IMEX Runge-Kutta（前向/后向 Euler）
    Rk111,
    /// 二阶二级 IMEX Runge-Kutta (ARS 222)
    Rk222,
}

impl SchemeKind {
    /// 是否为多步格式
    pub fn is_multistep(&self) -> bool {
        !matches!(self, Self::Rk111 | Self::Rk222)
    }

    /// 全部格式
    pub const ALL: [SchemeKind; 8] = [
        Self::Sbdf1,
        Self::Sbdf2,
        Self::Sbdf3,
        Self::Sbdf4,
        Self::Cnab1,
        Self::Cnab2,
        Self::Rk111,
        Self::Rk222,
    ];
}

impl fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sbdf1 => "SBDF1",
            Self::Sbdf2 => "SBDF2",
            Self::Sbdf3 => "SBDF3",
            Self::Sbdf4 => "SBDF4",
            Self::Cnab1 => "CNAB1",
            Self::Cnab2 => "CNAB2",
            Self::Rk111 => "RK111",
            Self::Rk222 => "RK222",
        };
        f.write_str(name)
    }
}

impl FromStr for SchemeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::Unknown {
                kind: "时间格式",
                name: s.to_string(),
            })
    }
}

/// 直接求解器后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatSolverKind {
    /// 稠密 LU（部分主元）
    #[default]
    DenseLu,
    /// 稠密 LU（完全主元），更稳健但更慢
    DenseFullPivLu,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scheme_names() {
        assert_eq!("sbdf4".parse::<SchemeKind>().unwrap(), SchemeKind::Sbdf4);
        assert_eq!("CNAB2".parse::<SchemeKind>().unwrap(), SchemeKind::Cnab2);
        assert!("RK443".parse::<SchemeKind>().is_err());
    }

    #[test]
    fn test_serde_uppercase() {
        let json = serde_json::to_string(&SchemeKind::Rk222).unwrap();
        assert_eq!(json, "\"RK222\"");
        assert!(SchemeKind::Sbdf2.is_multistep());
        assert!(!SchemeKind::Rk111.is_multistep());
    }
}
