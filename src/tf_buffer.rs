use std::collections::HashMap;

use geometry_msgs::msg::TransformStamped;
use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion};
use thiserror::Error;

// 防止错误的 tf 数据构成环
const MAX_CHAIN_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TfError {
    #[error("frame {0} does not exist")]
    UnknownFrame(String),
    #[error("frames {target} and {source_frame} are not connected")]
    Disconnected { target: String, source_frame: String },
    #[error("transform chain from {0} is too deep or cyclic")]
    Loop(String),
}

struct Edge {
    parent: String,
    // parent <- child
    transform: Isometry3<f64>,
}

/// 只保留每个子坐标系最新的变换
#[derive(Default)]
pub struct TfBuffer {
    edges: HashMap<String, Edge>,
}

fn normalize(frame: &str) -> &str {
    frame.trim_start_matches('/')
}

pub fn isometry_from_msg(msg: &geometry_msgs::msg::Transform) -> Isometry3<f64> {
    let t = &msg.translation;
    let r = &msg.rotation;
    Isometry3::from_parts(
        Translation3::new(t.x, t.y, t.z),
        UnitQuaternion::from_quaternion(Quaternion::new(r.w, r.x, r.y, r.z)),
    )
}

impl TfBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, msg: &TransformStamped) {
        let child = normalize(&msg.child_frame_id).to_string();
        let parent = normalize(&msg.header.frame_id).to_string();
        if child.is_empty() || parent.is_empty() || child == parent {
            return;
        }
        self.edges.insert(
            child,
            Edge {
                parent,
                transform: isometry_from_msg(&msg.transform),
            },
        );
    }

    pub fn insert_all<'a>(&mut self, transforms: impl IntoIterator<Item = &'a TransformStamped>) {
        for tf in transforms {
            self.insert(tf);
        }
    }

    fn knows(&self, frame: &str) -> bool {
        self.edges.contains_key(frame) || self.edges.values().any(|e| e.parent == frame)
    }

    // (祖先坐标系, 祖先 <- frame), 第一项为 frame 自身
    fn chain(&self, frame: &str) -> Result<Vec<(String, Isometry3<f64>)>, TfError> {
        let mut chain = vec![(frame.to_string(), Isometry3::identity())];
        let mut current = frame;
        let mut acc = Isometry3::identity();
        while let Some(edge) = self.edges.get(current) {
            if chain.len() > MAX_CHAIN_DEPTH {
                return Err(TfError::Loop(frame.to_string()));
            }
            acc = edge.transform * acc;
            current = &edge.parent;
            chain.push((current.to_string(), acc));
        }
        Ok(chain)
    }

    /// 返回 target <- source 的变换, p_target = T * p_source
    pub fn lookup(&self, target: &str, source: &str) -> Result<Isometry3<f64>, TfError> {
        let (target, source) = (normalize(target), normalize(source));
        if target == source {
            return Ok(Isometry3::identity());
        }
        for frame in [target, source] {
            if !self.knows(frame) {
                return Err(TfError::UnknownFrame(frame.to_string()));
            }
        }

        let target_chain: HashMap<String, Isometry3<f64>> = self.chain(target)?.into_iter().collect();
        for (ancestor, ancestor_from_source) in self.chain(source)? {
            if let Some(ancestor_from_target) = target_chain.get(&ancestor) {
                return Ok(ancestor_from_target.inverse() * ancestor_from_source);
            }
        }
        Err(TfError::Disconnected {
            target: target.to_string(),
            source_frame: source.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};
    use std::f64::consts::FRAC_PI_2;

    fn tf(parent: &str, child: &str, xyz: [f64; 3], yaw: f64) -> TransformStamped {
        let mut msg = TransformStamped::default();
        msg.header.frame_id = parent.to_string();
        msg.child_frame_id = child.to_string();
        msg.transform.translation.x = xyz[0];
        msg.transform.translation.y = xyz[1];
        msg.transform.translation.z = xyz[2];
        msg.transform.rotation.x = 0.0;
        msg.transform.rotation.y = 0.0;
        msg.transform.rotation.z = (yaw / 2.0).sin();
        msg.transform.rotation.w = (yaw / 2.0).cos();
        msg
    }

    fn assert_close(a: Point3<f64>, b: Point3<f64>) {
        assert!((a - b).norm() < 1e-9, "{a} != {b}");
    }

    fn buffer() -> TfBuffer {
        let mut buffer = TfBuffer::new();
        buffer.insert_all(&[
            tf("earth", "quadrotor_1", [1.0, 2.0, 3.0], FRAC_PI_2),
            tf("quadrotor_1", "camera", [0.5, 0.0, 0.0], 0.0),
            tf("earth", "/landmark", [10.0, 0.0, 0.0], 0.0),
        ]);
        buffer
    }

    #[test]
    fn child_to_ancestor_composes_chain() {
        let t = buffer().lookup("earth", "camera").unwrap();
        // 机体偏航 90 度, 相机前方 0.5 m 变为 earth 的 +y
        assert_close(t * Point3::origin(), Point3::new(1.0, 2.5, 3.0));
    }

    #[test]
    fn ancestor_to_child_is_inverse() {
        let buffer = buffer();
        let forward = buffer.lookup("earth", "camera").unwrap();
        let backward = buffer.lookup("camera", "earth").unwrap();
        let p = Point3::new(0.3, -4.0, 7.0);
        assert_close(backward * (forward * p), p);
    }

    #[test]
    fn siblings_meet_at_common_ancestor() {
        let t = buffer().lookup("landmark", "quadrotor_1").unwrap();
        assert_close(t * Point3::origin(), Point3::new(-9.0, 2.0, 3.0));
    }

    #[test]
    fn leading_slash_is_ignored() {
        assert!(buffer().lookup("/earth", "landmark").is_ok());
    }

    #[test]
    fn same_frame_is_identity() {
        let t = TfBuffer::new().lookup("anything", "anything").unwrap();
        assert_eq!(t.translation.vector, Vector3::zeros());
    }

    #[test]
    fn newer_transform_replaces_older() {
        let mut buffer = buffer();
        buffer.insert(&tf("earth", "quadrotor_1", [0.0, 0.0, 0.0], 0.0));
        let t = buffer.lookup("earth", "camera").unwrap();
        assert_close(t * Point3::origin(), Point3::new(0.5, 0.0, 0.0));
    }

    #[test]
    fn unknown_frame_is_reported() {
        assert_eq!(
            buffer().lookup("earth", "lidar"),
            Err(TfError::UnknownFrame("lidar".to_string()))
        );
    }

    #[test]
    fn separate_trees_are_disconnected() {
        let mut buffer = buffer();
        buffer.insert(&tf("map", "odom", [0.0, 0.0, 0.0], 0.0));
        assert!(matches!(
            buffer.lookup("earth", "odom"),
            Err(TfError::Disconnected { .. })
        ));
    }

    #[test]
    fn cyclic_data_does_not_hang() {
        let mut buffer = TfBuffer::new();
        buffer.insert(&tf("a", "b", [0.0; 3], 0.0));
        buffer.insert(&tf("b", "a", [0.0; 3], 0.0));
        buffer.insert(&tf("c", "d", [0.0; 3], 0.0));
        assert_eq!(buffer.lookup("c", "a"), Err(TfError::Loop("a".to_string())));
    }
}
