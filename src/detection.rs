use nalgebra::{Isometry3, Point3, Vector3};
use vision_msgs::msg::Detection2D;

use crate::camera::{CameraModel, DepthImage};

/// 取第一个假设的 2D 检测
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: String,
    pub class_id: String,
    pub score: f64,
    pub center: (f64, f64),
    pub size: (f64, f64),
}

impl Detection {
    /// 没有任何假设的检测无法分类, 返回 None
    pub fn from_msg(msg: &Detection2D) -> Option<Self> {
        let hypothesis = &msg.results.first()?.hypothesis;
        Some(Self {
            id: msg.id.clone(),
            class_id: hypothesis.class_id.clone(),
            score: hypothesis.score,
            center: (msg.bbox.center.position.x, msg.bbox.center.position.y),
            size: (msg.bbox.size_x, msg.bbox.size_y),
        })
    }
}

/// 检测框左上角与宽高, 像素; 不依赖假设, 未分类的检测同样可画
pub fn bbox_rect(msg: &Detection2D) -> (f64, f64, f64, f64) {
    let (cx, cy) = (msg.bbox.center.position.x, msg.bbox.center.position.y);
    let (w, h) = (msg.bbox.size_x, msg.bbox.size_y);
    (cx - w / 2.0, cy - h / 2.0, w, h)
}

/// 一次检测对应的三维观测
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub detection_id: String,
    pub class_id: String,
    pub score: f64,
    /// 深度无效时为 None
    pub point: Option<Vector3<f64>>,
}

impl Observation {
    pub fn transformed(self, transform: &Isometry3<f64>) -> Self {
        Self {
            point: self.point.map(|p| transform.transform_point(&Point3::from(p)).coords),
            ..self
        }
    }
}

/// 检测框中心反投影到相机光学系
pub fn locate(detections: &[Detection], camera: &CameraModel, depth: &DepthImage) -> Vec<Observation> {
    detections
        .iter()
        .map(|d| Observation {
            detection_id: d.id.clone(),
            class_id: d.class_id.clone(),
            score: d.score,
            point: depth.point_at(camera, d.center.0, d.center.1),
        })
        .collect()
}
