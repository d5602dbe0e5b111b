use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// 检测阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    NoDetection,
    VisualDetectionWithoutDepth,
    VisualDetectionWithDepth,
    OnlyDepthDetection,
    TooNearToDetect,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown phase: {0}")]
pub struct UnknownPhase(pub String);

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::NoDetection => "NO_DETECTION",
            Phase::VisualDetectionWithoutDepth => "VISUAL_DETECTION_WITHOUT_DEPTH",
            Phase::VisualDetectionWithDepth => "VISUAL_DETECTION_WITH_DEPTH",
            Phase::OnlyDepthDetection => "ONLY_DEPTH_DETECTION",
            Phase::TooNearToDetect => "TOO_NEAR_TO_DETECT",
        }
    }

    /// 点云细化只在这两个阶段进行
    pub fn uses_point_cloud(&self) -> bool {
        matches!(self, Phase::VisualDetectionWithDepth | Phase::OnlyDepthDetection)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "NO_DETECTION" => Ok(Phase::NoDetection),
            "VISUAL_DETECTION_WITHOUT_DEPTH" => Ok(Phase::VisualDetectionWithoutDepth),
            "VISUAL_DETECTION_WITH_DEPTH" => Ok(Phase::VisualDetectionWithDepth),
            "ONLY_DEPTH_DETECTION" => Ok(Phase::OnlyDepthDetection),
            "TOO_NEAR_TO_DETECT" => Ok(Phase::TooNearToDetect),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}
