use std::sync::Arc;

use anyhow::{anyhow, Result};
use rclrs::*;

use crate::tracker::TrackerConfig;

/// launch 文件中声明的参数及默认值, 需与 launch/rviz_depthtection_launch.py 保持一致
pub const LAUNCH_DEFAULTS: &[(&str, &str)] = &[
    ("namespace", "quadrotor_1"),
    ("use_sim_time", "false"),
    ("camera_topic", "slot0"),
    ("detection_topic", "detector_node/detections"),
    ("ground_truth_topic", "\"\""),
    ("base_frame", "quadrotor_1"),
    ("show_detection", "true"),
    ("target_object", "small_blue_box"),
    ("rviz_config", "depthtection/rviz/depthtection_tests.rviz"),
    ("same_object_distance_threshold", "1.0"),
];

/// launch 透传给节点的参数
pub const FORWARDED_PARAMETERS: &[&str] = &[
    "use_sim_time",
    "camera_topic",
    "detection_topic",
    "ground_truth_topic",
    "base_frame",
    "show_detection",
    "target_object",
    "same_object_distance_threshold",
];

/// 节点运行参数
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub camera_topic: String,
    pub detection_topic: String,
    pub computed_pose_topic: String,
    pub ground_truth_topic: Option<String>,
    pub point_cloud_topic: String,
    pub phase_topic: String,
    pub base_frame: String,
    pub earth_frame: String,
    pub show_detection: bool,
    pub target_object: String,
    pub same_object_distance_threshold: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_raw(RawSettings::default())
    }
}

/// 未经整理的参数值
#[derive(Debug, Clone)]
pub struct RawSettings {
    pub camera_topic: String,
    pub detection_topic: String,
    pub computed_pose_topic: String,
    pub ground_truth_topic: String,
    pub point_cloud_topic: String,
    pub phase_topic: String,
    pub base_frame: String,
    pub earth_frame: String,
    pub show_detection: bool,
    pub target_object: String,
    pub same_object_distance_threshold: f64,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            camera_topic: "camera".into(),
            detection_topic: "detection".into(),
            computed_pose_topic: "pose_computed".into(),
            ground_truth_topic: String::new(),
            point_cloud_topic: String::new(),
            phase_topic: "phase".into(),
            base_frame: "base_link".into(),
            earth_frame: "earth".into(),
            show_detection: false,
            target_object: "small_blue_box".into(),
            same_object_distance_threshold: 1.0,
        }
    }
}

// launch 传入的 '""' 表示空
fn non_empty(topic: &str) -> Option<String> {
    let topic = topic.trim();
    if topic.is_empty() || topic == "\"\"" || topic == "''" {
        None
    } else {
        Some(topic.to_string())
    }
}

impl Settings {
    pub fn from_raw(raw: RawSettings) -> Self {
        let camera_topic = raw.camera_topic.trim_end_matches('/').to_string();
        let point_cloud_topic =
            non_empty(&raw.point_cloud_topic).unwrap_or_else(|| format!("{camera_topic}/points"));
        Self {
            ground_truth_topic: non_empty(&raw.ground_truth_topic),
            point_cloud_topic,
            detection_topic: raw.detection_topic,
            computed_pose_topic: raw.computed_pose_topic,
            phase_topic: raw.phase_topic,
            base_frame: raw.base_frame,
            earth_frame: raw.earth_frame,
            show_detection: raw.show_detection,
            target_object: raw.target_object,
            same_object_distance_threshold: raw.same_object_distance_threshold.max(0.0),
            camera_topic,
        }
    }

    /// 在节点上声明全部参数并读取
    pub fn declare(node: &Node) -> Result<Self> {
        let d = RawSettings::default();
        let raw = RawSettings {
            camera_topic: declare_str(node, "camera_topic", &d.camera_topic)?,
            detection_topic: declare_str(node, "detection_topic", &d.detection_topic)?,
            computed_pose_topic: declare_str(node, "computed_pose_topic", &d.computed_pose_topic)?,
            ground_truth_topic: declare_str(node, "ground_truth_topic", &d.ground_truth_topic)?,
            point_cloud_topic: declare_str(node, "point_cloud_topic", &d.point_cloud_topic)?,
            phase_topic: declare_str(node, "phase_topic", &d.phase_topic)?,
            base_frame: declare_str(node, "base_frame", &d.base_frame)?,
            earth_frame: declare_str(node, "earth_frame", &d.earth_frame)?,
            show_detection: node
                .declare_parameter("show_detection")
                .default(d.show_detection)
                .mandatory()
                .map_err(|e| anyhow!("声明参数show_detection失败: {:?}", e))?
                .get(),
            target_object: declare_str(node, "target_object", &d.target_object)?,
            same_object_distance_threshold: node
                .declare_parameter("same_object_distance_threshold")
                .default(d.same_object_distance_threshold)
                .mandatory()
                .map_err(|e| anyhow!("声明参数same_object_distance_threshold失败: {:?}", e))?
                .get(),
        };
        Ok(Self::from_raw(raw))
    }

    pub fn image_topic(&self) -> String {
        format!("{}/image_raw", self.camera_topic)
    }

    pub fn depth_topic(&self) -> String {
        format!("{}/depth", self.camera_topic)
    }

    pub fn camera_info_topic(&self) -> String {
        format!("{}/camera_info", self.camera_topic)
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            target_object: self.target_object.clone(),
            same_object_distance_threshold: self.same_object_distance_threshold,
        }
    }
}

fn declare_str(node: &Node, name: &str, default: &str) -> Result<String> {
    let param = node
        .declare_parameter::<Arc<str>>(name)
        .default(Arc::from(default))
        .mandatory()
        .map_err(|e| anyhow!("声明参数{}失败: {:?}", name, e))?;
    Ok(param.get().to_string())
}
