// crates/cv_config/src/solver_config.rs

//! SolverConfig - 求解器配置
//!
//! 汇总 NCC 截断、时间推进停止条件与矩阵求解器选择，支持 JSON 读写。
//!
//! # NCC 截断参数
//!
//! - `ncc_cutoff`: 系数场径向展开中，模长低于 `ncc_cutoff · max|c|` 的项被丢弃。
//!   取值越大矩阵越稀疏，但 NCC 乘积与直接计算的偏差上界随之增大。
//! - `max_ncc_terms`: 保留的展开项数上限（按径向阶数截断）。
//! - `entry_cutoff`: 组装后矩阵元素的相对丢弃阈值，仅用于清除舍入噪声。

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::scheme::{MatSolverKind, SchemeKind};

/// 求解器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// NCC 矩阵构建参数
    #[serde(default)]
    pub ncc: NccConfig,

    /// 时间推进参数
    #[serde(default)]
    pub time: TimeConfig,

    /// 直接求解器
    #[serde(default)]
    pub matsolver: MatSolverKind,

    /// LU 相对主元阈值，低于该值视为奇异
    #[serde(default = "default_pivot_tolerance")]
    pub pivot_tolerance: f64,

    /// 算子矩阵径向求积的额外节点数
    #[serde(default = "default_quadrature_padding")]
    pub quadrature_padding: usize,
}

fn default_pivot_tolerance() -> f64 { 1e-13 }
fn default_quadrature_padding() -> usize { 4 }

/// NCC 矩阵构建配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NccConfig {
    /// 系数展开的相对截断阈值
    #[serde(default = "default_ncc_cutoff")]
    pub ncc_cutoff: f64,

    /// 保留的展开项数上限
    #[serde(default)]
    pub max_ncc_terms: Option<usize>,

    /// 矩阵元素的相对丢弃阈值
    #[serde(default = "default_entry_cutoff")]
    pub entry_cutoff: f64,
}

fn default_ncc_cutoff() -> f64 { 1e-6 }
fn default_entry_cutoff() -> f64 { 1e-14 }

impl Default for NccConfig {
    fn default() -> Self {
        Self {
            ncc_cutoff: default_ncc_cutoff(),
            max_ncc_terms: None,
            entry_cutoff: default_entry_cutoff(),
        }
    }
}

/// 时间推进配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    /// 时间格式
    #[serde(default)]
    pub scheme: SchemeKind,

    /// 停止的模拟时间
    #[serde(default)]
    pub stop_sim_time: Option<f64>,

    /// 停止的迭代步数
    #[serde(default)]
    pub stop_iteration: Option<u64>,

    /// 停止的墙钟时间 [s]
    #[serde(default)]
    pub stop_wall_time: Option<f64>,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            scheme: SchemeKind::default(),
            stop_sim_time: None,
            stop_iteration: None,
            stop_wall_time: None,
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            ncc: NccConfig::default(),
            time: TimeConfig::default(),
            matsolver: MatSolverKind::default(),
            pivot_tolerance: default_pivot_tolerance(),
            quadrature_padding: default_quadrature_padding(),
        }
    }
}

impl SolverConfig {
    /// 高精度预设：不截断 NCC 展开
    pub fn accurate() -> Self {
        Self {
            ncc: NccConfig {
                ncc_cutoff: 0.0,
                max_ncc_terms: None,
                entry_cutoff: 0.0,
            },
            matsolver: MatSolverKind::DenseFullPivLu,
            quadrature_padding: 8,
            ..Default::default()
        }
    }

    /// 快速预设：激进截断以提高稀疏度
    pub fn fast() -> Self {
        Self {
            ncc: NccConfig {
                ncc_cutoff: 1e-4,
                max_ncc_terms: Some(16),
                entry_cutoff: 1e-12,
            },
            ..Default::default()
        }
    }

    /// 设置停止条件（构建器风格）
    pub fn with_stop(mut self, sim_time: Option<f64>, iteration: Option<u64>) -> Self {
        self.time.stop_sim_time = sim_time;
        self.time.stop_iteration = iteration;
        self
    }

    /// 设置时间格式（构建器风格）
    pub fn with_scheme(mut self, scheme: SchemeKind) -> Self {
        self.time.scheme = scheme;
        self
    }

    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        let config: SolverConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ncc.ncc_cutoff >= 0.0 && self.ncc.ncc_cutoff < 1.0) {
            return Err(ConfigError::invalid(
                "ncc.ncc_cutoff",
                self.ncc.ncc_cutoff,
                "必须在 [0, 1) 范围内",
            ));
        }
        if !(self.ncc.entry_cutoff >= 0.0 && self.ncc.entry_cutoff < 1.0) {
            return Err(ConfigError::invalid(
                "ncc.entry_cutoff",
                self.ncc.entry_cutoff,
                "必须在 [0, 1) 范围内",
            ));
        }
        if self.ncc.max_ncc_terms == Some(0) {
            return Err(ConfigError::invalid("ncc.max_ncc_terms", 0, "至少保留一项"));
        }
        if !(self.pivot_tolerance > 0.0) {
            return Err(ConfigError::invalid(
                "pivot_tolerance",
                self.pivot_tolerance,
                "必须为正",
            ));
        }
        if let Some(t) = self.time.stop_sim_time {
            if !t.is_finite() || t < 0.0 {
                return Err(ConfigError::invalid("time.stop_sim_time", t, "必须为非负有限值"));
            }
        }
        if let Some(t) = self.time.stop_wall_time {
            if !(t > 0.0) {
                return Err(ConfigError::invalid("time.stop_wall_time", t, "必须为正"));
            }
        }
        if self.ncc.ncc_cutoff > 1e-3 {
            log::warn!(
                "ncc_cutoff = {:.1e} 较大, NCC 乘积精度将受限",
                self.ncc.ncc_cutoff
            );
        }
        Ok(())
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SolverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.time.scheme, SchemeKind::Sbdf2);
        assert_eq!(config.matsolver, MatSolverKind::DenseLu);
    }

    #[test]
    fn test_presets_validate() {
        assert!(SolverConfig::accurate().validate().is_ok());
        assert!(SolverConfig::fast().validate().is_ok());
        assert!(SolverConfig::fast().ncc.ncc_cutoff > SolverConfig::default().ncc.ncc_cutoff);
    }

    #[test]
    fn test_invalid_cutoff() {
        let mut config = SolverConfig::default();
        config.ncc.ncc_cutoff = -1.0;
        assert!(config.validate().is_err());
        config.ncc.ncc_cutoff = 1e-6;
        config.ncc.max_ncc_terms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "time": { "scheme": "CNAB2", "stop_iteration": 10 } }"#;
        let config: SolverConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.time.scheme, SchemeKind::Cnab2);
        assert_eq!(config.time.stop_iteration, Some(10));
        assert_eq!(config.ncc.ncc_cutoff, 1e-6);
        assert_eq!(config.quadrature_padding, 4);
    }

    #[test]
    fn test_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("cv_config_{}.json", std::process::id()));
        let config = SolverConfig::fast().with_stop(Some(1.5), None);
        config.save_to_file(&path).unwrap();
        let loaded = SolverConfig::from_file(&path).unwrap();
        assert_eq!(loaded.time.stop_sim_time, Some(1.5));
        assert_eq!(loaded.ncc.max_ncc_terms, Some(16));
        let _ = std::fs::remove_file(&path);
    }
}
