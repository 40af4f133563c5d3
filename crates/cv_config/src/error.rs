// crates/cv_config/src/error.rs

//! 配置层错误类型

use cv_foundation::CvError;

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 解析错误
    #[error("解析错误: {0}")]
    Parse(String),

    /// 无效值
    #[error("无效值 '{key}': {value} - {reason}")]
    InvalidValue {
        /// 配置键
        key: String,
        /// 配置值
        value: String,
        /// 原因
        reason: String,
    },

    /// 未知名称（时间格式、求解器等）
    #[error("未知{kind}: {name}")]
    Unknown {
        /// 类别
        kind: &'static str,
        /// 名称
        name: String,
    },
}

impl ConfigError {
    /// 无效值的便捷构造
    pub fn invalid(key: &str, value: impl ToString, reason: &str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<ConfigError> for CvError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(source) => CvError::from(source),
            ConfigError::Parse(message) => CvError::serialization(message),
            other => CvError::configuration(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("ncc.ncc_cutoff", -1.0, "必须非负");
        assert!(err.to_string().contains("ncc_cutoff"));
    }

    #[test]
    fn test_into_cv_error() {
        let err: CvError = ConfigError::Unknown {
            kind: "时间格式",
            name: "RK999".into(),
        }
        .into();
        assert!(matches!(err, CvError::Configuration { .. }));

        let err: CvError = ConfigError::Parse("缺少字段 ncc".into()).into();
        assert!(matches!(err, CvError::Serialization { .. }));

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.json");
        let err: CvError = ConfigError::from(io).into();
        assert!(matches!(err, CvError::Io { source: Some(_), .. }));
    }
}
