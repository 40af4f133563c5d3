// crates/cv_engine/src/coords.rs

//! 坐标系与几何
//!
//! 四种几何为封闭枚举；每种几何给出本征切向维数与径向基族。

use cv_foundation::{ensure, CvError, CvResult};
use cv_spectral::RadialFamily;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 几何类型
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    /// 圆周 S1
    Circle {
        /// 半径
        radius: f64,
    },
    /// 二维球面 S2
    Sphere {
        /// 半径
        radius: f64,
    },
    /// 实心球
    Ball {
        /// 半径
        radius: f64,
    },
    /// 球壳
    Shell {
        /// 内半径
        inner: f64,
        /// 外半径
        outer: f64,
    },
}

impl Geometry {
    /// 校验几何参数
    pub fn validate(&self) -> CvResult<()> {
        match *self {
            Self::Circle { radius } | Self::Sphere { radius } | Self::Ball { radius } => {
                ensure!(
                    radius > 0.0 && radius.is_finite(),
                    CvError::configuration(format!("半径必须为正: {radius}"))
                );
            }
            Self::Shell { inner, outer } => {
                ensure!(
                    inner > 0.0 && outer > inner && outer.is_finite(),
                    CvError::configuration(format!("球壳半径非法: ({inner}, {outer})"))
                );
            }
        }
        Ok(())
    }

    /// 本征切向维数
    pub fn native_dim(&self) -> usize {
        match self {
            Self::Circle { .. } => 1,
            Self::Sphere { .. } => 2,
            Self::Ball { .. } | Self::Shell { .. } => 3,
        }
    }

    /// 是否带有 θ 方向
    #[inline]
    pub fn has_theta(&self) -> bool {
        !matches!(self, Self::Circle { .. })
    }

    /// 是否带有径向
    #[inline]
    pub fn has_radius(&self) -> bool {
        matches!(self, Self::Ball { .. } | Self::Shell { .. })
    }

    /// 径向基族（无径向时为 `None`）
    pub fn radial_family(&self) -> Option<RadialFamily> {
        match *self {
            Self::Ball { radius } => Some(RadialFamily::Zernike { radius }),
            Self::Shell { inner, outer } => Some(RadialFamily::Legendre { inner, outer }),
            _ => None,
        }
    }

    /// 角向是否相同（φ、θ 方向的存在性一致）
    pub fn same_angular_kind(&self, other: &Geometry) -> bool {
        self.has_theta() == other.has_theta()
    }

    /// 外边界半径
    pub fn outer_radius(&self) -> f64 {
        match *self {
            Self::Circle { radius } | Self::Sphere { radius } | Self::Ball { radius } => radius,
            Self::Shell { outer, .. } => outer,
        }
    }

    /// 三维体几何是否包含半径 `r`
    pub fn contains_radius(&self, r: f64) -> bool {
        self.radial_family().is_some_and(|f| f.contains(r))
    }

    /// 允许的分量维数
    pub fn allows_dim(&self, dim: usize) -> bool {
        match self {
            Self::Circle { .. } => dim == 1,
            Self::Sphere { .. } => dim == 2 || dim == 3,
            Self::Ball { .. } | Self::Shell { .. } => dim == 3,
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Circle { radius } => write!(f, "Circle(R={radius})"),
            Self::Sphere { radius } => write!(f, "Sphere(R={radius})"),
            Self::Ball { radius } => write!(f, "Ball(R={radius})"),
            Self::Shell { inner, outer } => write!(f, "Shell({inner}, {outer})"),
        }
    }
}
