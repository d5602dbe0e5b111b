use nalgebra::Vector3;

use crate::candidate::{best_candidate, match_candidate, Candidate};
use crate::detection::Observation;
use crate::phase::Phase;
use crate::sync::Stamp;

// 点云细化参数
const CLOUD_RADIUS: f64 = 0.5;
const MIN_CLOUD_POINTS: usize = 20;
const TOO_NEAR_DISTANCE: f64 = 0.5;
const MAX_CLOUDS_WITHOUT_DETECTION: u32 = 10;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub target_object: String,
    pub same_object_distance_threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    Created { id: u32, detection_id: String },
    Updated { id: u32, detection_id: String },
}

#[derive(Debug, Default, PartialEq)]
pub struct FrameReport {
    pub events: Vec<TrackEvent>,
    pub targets_seen: usize,
    pub with_depth: usize,
}

#[derive(Debug, PartialEq)]
pub enum CloudOutcome {
    /// 当前阶段不使用点云
    Inactive,
    NoCandidate,
    TooFewPoints(usize),
    TooNear(f64),
    Refined { kept: Vec<Vector3<f64>>, top: Vector3<f64> },
}

/// 候选目标跟踪与阶段切换, 所有坐标在 earth 系
pub struct Tracker {
    config: TrackerConfig,
    candidates: Vec<Candidate>,
    best_id: Option<u32>,
    phase: Phase,
    new_detection: bool,
    clouds_without_detection: u32,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            candidates: Vec::new(),
            best_id: None,
            phase: Phase::NoDetection,
            new_detection: false,
            clouds_without_detection: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn best(&self) -> Option<&Candidate> {
        let id = self.best_id?;
        self.candidates.iter().find(|c| c.id == id)
    }

    /// 外部指定阶段, 返回是否发生变化
    pub fn set_phase(&mut self, phase: Phase) -> bool {
        self.clouds_without_detection = 0;
        let changed = self.phase != phase;
        self.phase = phase;
        changed
    }

    pub fn observe(&mut self, observations: &[Observation], stamp: Stamp) -> FrameReport {
        let mut report = FrameReport::default();

        for obs in observations.iter().filter(|o| o.class_id == self.config.target_object) {
            report.targets_seen += 1;
            let Some(point) = obs.point else {
                continue;
            };
            report.with_depth += 1;

            let threshold = self.config.same_object_distance_threshold;
            match match_candidate(&mut self.candidates, &obs.class_id, &point, threshold) {
                Some(candidate) => {
                    candidate.update(obs.score, point, stamp);
                    report.events.push(TrackEvent::Updated {
                        id: candidate.id,
                        detection_id: obs.detection_id.clone(),
                    });
                }
                None => {
                    let id = self.candidates.len() as u32 + 1;
                    self.candidates.push(Candidate::new(id, obs.score, &obs.class_id, point, stamp));
                    report.events.push(TrackEvent::Created {
                        id,
                        detection_id: obs.detection_id.clone(),
                    });
                }
            }
        }

        if report.with_depth > 0 {
            self.new_detection = true;
        }
        // TOO_NEAR_TO_DETECT 只能由外部阶段消息解除
        if self.phase != Phase::TooNearToDetect {
            if report.with_depth > 0 {
                self.phase = Phase::VisualDetectionWithDepth;
            } else if report.targets_seen > 0 {
                self.phase = Phase::VisualDetectionWithoutDepth;
            }
        }
        self.best_id = best_candidate(&self.candidates).map(|c| c.id);
        report
    }

    /// earth_points 为 earth 系下的点云, base 为机体原点在 earth 系的位置
    pub fn refine_with_cloud(&mut self, earth_points: &[Vector3<f64>], base: &Vector3<f64>) -> CloudOutcome {
        let Some(best_id) = self.best_id else {
            return CloudOutcome::NoCandidate;
        };

        if self.new_detection {
            self.clouds_without_detection = 0;
        } else {
            self.clouds_without_detection += 1;
        }
        self.new_detection = false;
        if self.phase == Phase::VisualDetectionWithDepth
            && self.clouds_without_detection >= MAX_CLOUDS_WITHOUT_DETECTION
        {
            self.phase = Phase::OnlyDepthDetection;
        }

        if !self.phase.uses_point_cloud() {
            return CloudOutcome::Inactive;
        }
        let Some(candidate) = self.candidates.iter_mut().find(|c| c.id == best_id) else {
            return CloudOutcome::NoCandidate;
        };

        let center = candidate.point;
        let kept: Vec<Vector3<f64>> = earth_points
            .iter()
            .filter(|p| p.iter().all(|v| v.is_finite()))
            .filter(|p| (*p - center).norm() <= CLOUD_RADIUS)
            .copied()
            .collect();
        if kept.len() < MIN_CLOUD_POINTS {
            return CloudOutcome::TooFewPoints(kept.len());
        }

        let top = kept
            .iter()
            .copied()
            .reduce(|top, p| if p.z > top.z { p } else { top })
            .unwrap_or(center);
        candidate.refine(top);

        let distance = (candidate.point - base).norm();
        if distance < TOO_NEAR_DISTANCE {
            self.phase = Phase::TooNearToDetect;
            return CloudOutcome::TooNear(distance);
        }
        CloudOutcome::Refined { kept, top }
    }
}
