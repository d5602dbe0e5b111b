use nalgebra::Vector3;

use crate::sync::Stamp;

// 滤波点的指数平滑系数
const FILTER_ALPHA: f64 = 0.3;

/// 跟踪中的候选目标, 坐标均在 earth 系下
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: u32,
    pub class_name: String,
    pub confidence: f64,
    pub stamp: Stamp,
    pub point: Vector3<f64>,
    pub raw_point: Vector3<f64>,
    pub filtered_point: Vector3<f64>,
    pub compensated_point: Vector3<f64>,
}

impl Candidate {
    pub fn new(id: u32, confidence: f64, class_name: &str, point: Vector3<f64>, stamp: Stamp) -> Self {
        Self {
            id,
            class_name: class_name.to_string(),
            confidence,
            stamp,
            point,
            raw_point: point,
            filtered_point: point,
            compensated_point: point,
        }
    }

    /// 新的视觉观测
    pub fn update(&mut self, score: f64, point: Vector3<f64>, stamp: Stamp) {
        self.confidence = (self.confidence + score) / 2.0;
        self.point = point;
        self.raw_point = point;
        self.filtered_point += (point - self.filtered_point) * FILTER_ALPHA;
        self.compensated_point = self.filtered_point;
        self.stamp = stamp;
    }

    /// 点云给出的目标顶点
    pub fn refine(&mut self, top: Vector3<f64>) {
        self.point = top;
        self.compensated_point = Vector3::new(self.filtered_point.x, self.filtered_point.y, top.z);
    }

    pub fn distance_to(&self, point: &Vector3<f64>) -> f64 {
        (self.point - point).norm()
    }
}

/// 同类别中距离最近且不超过阈值的候选
pub fn match_candidate<'a>(
    candidates: &'a mut [Candidate],
    class_name: &str,
    point: &Vector3<f64>,
    threshold: f64,
) -> Option<&'a mut Candidate> {
    candidates
        .iter_mut()
        .filter(|c| c.class_name == class_name)
        .map(|c| (c.distance_to(point), c))
        .filter(|(d, _)| *d <= threshold)
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, c)| c)
}

/// 置信度最高者, 相同时取 id 最小
pub fn best_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().reduce(|best, c| if c.confidence > best.confidence { c } else { best })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate::new(1, 0.6, "box", Vector3::new(0.0, 0.0, 0.0), (0, 0)),
            Candidate::new(2, 0.9, "box", Vector3::new(0.8, 0.0, 0.0), (0, 0)),
            Candidate::new(3, 0.9, "ball", Vector3::new(0.5, 0.0, 0.0), (0, 0)),
        ]
    }

    #[test]
    fn matches_nearest_of_same_class() {
        let mut list = candidates();
        let found = match_candidate(&mut list, "box", &Vector3::new(0.5, 0.0, 0.0), 1.0).unwrap();
        assert_eq!(found.id, 2);
    }

    #[test]
    fn other_classes_never_match() {
        let mut list = candidates();
        let found = match_candidate(&mut list, "ball", &Vector3::new(0.1, 0.0, 0.0), 1.0).unwrap();
        assert_eq!(found.id, 3);
        assert!(match_candidate(&mut list, "cone", &Vector3::zeros(), 10.0).is_none());
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut list = candidates();
        assert!(match_candidate(&mut list, "box", &Vector3::new(-1.0, 0.0, 0.0), 1.0).is_some());
        assert!(match_candidate(&mut list, "box", &Vector3::new(-1.01, 0.0, 0.0), 1.0).is_none());
    }

    #[test]
    fn update_averages_confidence_and_smooths_filter() {
        let mut c = Candidate::new(1, 0.4, "box", Vector3::zeros(), (0, 0));
        c.update(0.8, Vector3::new(1.0, 0.0, 0.0), (1, 0));
        assert!((c.confidence - 0.6).abs() < 1e-12);
        assert_eq!(c.raw_point, Vector3::new(1.0, 0.0, 0.0));
        assert!((c.filtered_point.x - FILTER_ALPHA).abs() < 1e-12);
        assert_eq!(c.stamp, (1, 0));
    }

    #[test]
    fn refine_moves_point_and_compensates_height() {
        let mut c = Candidate::new(1, 0.4, "box", Vector3::new(1.0, 2.0, 0.3), (0, 0));
        c.refine(Vector3::new(1.1, 2.1, 0.5));
        assert_eq!(c.point, Vector3::new(1.1, 2.1, 0.5));
        assert_eq!(c.compensated_point, Vector3::new(1.0, 2.0, 0.5));
        assert_eq!(c.raw_point, Vector3::new(1.0, 2.0, 0.3));
    }

    #[test]
    fn best_prefers_confidence_then_lowest_id() {
        assert_eq!(best_candidate(&candidates()).unwrap().id, 2);
        assert!(best_candidate(&[]).is_none());
    }
}
