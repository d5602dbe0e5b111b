use rclrs::*;
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::{Result, Context as AnyhowContext, anyhow};
use nalgebra::{Point3, Vector3};
use builtin_interfaces::msg::Time;
use geometry_msgs::msg::PoseStamped;
use sensor_msgs::msg::{CameraInfo, Image, PointCloud2};
use std_msgs::msg::Header;
use tf2_msgs::msg::TFMessage;
use vision_msgs::msg::Detection2DArray;
// crate
use crate::camera::CameraModel;
use crate::candidate::Candidate;
use crate::cloud;
use crate::cvbridge_rs::CvBridge;
use crate::detection::{self, Detection, Observation};
use crate::overlay::{DetectionOverlay, Viewer};
use crate::params::Settings;
use crate::phase::Phase;
use crate::sync::{stamp_of, ExactTimeSync, Frame, Stamp};
use crate::tf_buffer::{TfBuffer, TfError};
use crate::tracker::{CloudOutcome, FrameReport, TrackEvent, Tracker};

const SYNC_QUEUE_SIZE: usize = 10;

type SyncedFrame = Frame<Image, Detection2DArray, Image>;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| anyhow!("获取锁失败: {}", e))
}

fn to_time(stamp: Stamp) -> Time {
    Time { sec: stamp.0, nanosec: stamp.1 }
}

fn pose_stamped(point: &Vector3<f64>, stamp: Stamp, frame_id: &str) -> PoseStamped {
    let mut pose = PoseStamped::default();
    pose.header.stamp = to_time(stamp);
    pose.header.frame_id = frame_id.to_string();
    pose.pose.position.x = point.x;
    pose.pose.position.y = point.y;
    pose.pose.position.z = point.z;
    pose.pose.orientation.x = 0.0;
    pose.pose.orientation.y = 0.0;
    pose.pose.orientation.z = 0.0;
    pose.pose.orientation.w = 1.0;
    pose
}

/// TF 查询用的相机坐标系: 深度图 frame_id, 为空时退回检测结果的 frame_id
fn camera_frame(frame: &SyncedFrame) -> &str {
    if frame.depth.header.frame_id.is_empty() {
        &frame.detections.header.frame_id
    } else {
        &frame.depth.header.frame_id
    }
}

/// 一帧同步数据的处理结果
#[derive(Debug, PartialEq)]
enum FrameStep {
    /// 尚未收到标定, 丢帧
    NoCalibration,
    /// 相机到 earth 的变换不可用, 丢帧
    TfFailed(TfError),
    Tracked(FrameReport),
}

// 发布组
#[derive(Clone)]
struct Outputs {
    pose_pub: Publisher<PoseStamped>,
    raw_pub: Publisher<PoseStamped>,
    filtered_pub: Publisher<PoseStamped>,
    compensated_pub: Publisher<PoseStamped>,
    cloud_pub: Publisher<PointCloud2>,
}

impl Outputs {
    fn publish_candidate(&self, candidate: &Candidate, frame_id: &str) -> Result<()> {
        let stamp = candidate.stamp;
        self.pose_pub.publish(pose_stamped(&candidate.point, stamp, frame_id))?;
        self.raw_pub.publish(pose_stamped(&candidate.raw_point, stamp, frame_id))?;
        self.filtered_pub.publish(pose_stamped(&candidate.filtered_point, stamp, frame_id))?;
        self.compensated_pub.publish(pose_stamped(&candidate.compensated_point, stamp, frame_id))?;
        Ok(())
    }
}

/// 回调共享的处理状态
struct Pipeline {
    settings: Settings,
    camera: Option<CameraModel>,
    sync: ExactTimeSync<Image, Detection2DArray, Image>,
    tracker: Tracker,
    ground_truth: Option<Vector3<f64>>,
    viewer: Viewer,
}

impl Pipeline {
    fn new(settings: Settings) -> Self {
        Self {
            camera: None,
            sync: ExactTimeSync::new(SYNC_QUEUE_SIZE, settings.show_detection),
            tracker: Tracker::new(settings.tracker_config()),
            ground_truth: None,
            viewer: Viewer::default(),
            settings,
        }
    }

    /// 只锁定第一份有效标定, 返回本次是否锁定
    fn latch_camera(&mut self, msg: &CameraInfo) -> bool {
        if self.camera.is_some() {
            return false;
        }
        self.camera = CameraModel::from_camera_info(msg);
        self.camera.is_some()
    }

    fn log_phase_change(&self, logger: &Logger, before: Phase) {
        let phase = self.tracker.phase();
        if phase != before {
            log_warn!(logger, "PHASE: {}", phase);
        }
    }

    fn report_ground_truth(&self, logger: &Logger, candidate: &Candidate) {
        if let Some(gt) = self.ground_truth {
            let error = gt - candidate.point;
            log_info!(logger, "Distance to ground truth: {:.3}, {:.3}, {:.3}", error.x, error.y, error.z);
            log_info!(logger, "Distance to ground truth: {:.3}", error.norm());
        }
    }

    fn show(&mut self, frame: &SyncedFrame) -> Result<()> {
        let Some(image) = frame.image.as_ref() else {
            return Ok(());
        };
        let mut overlay = DetectionOverlay::from_ros_image(image)?;
        for detection in &frame.detections.detections {
            overlay.draw(detection)?;
        }
        self.viewer.show("RGB Image", &overlay)
    }

    /// 反投影 -> earth 系 -> 候选匹配
    fn track_frame(&mut self, frame: &SyncedFrame, tf: &TfBuffer) -> Result<FrameStep> {
        let Some(camera) = self.camera.as_ref() else {
            return Ok(FrameStep::NoCalibration);
        };
        // 没有假设的检测只参与显示
        let detections: Vec<Detection> = frame
            .detections
            .detections
            .iter()
            .filter_map(Detection::from_msg)
            .collect();
        let depth = CvBridge::imgmsg_to_depth(&frame.depth).context("深度图转换失败")?;
        let observations = detection::locate(&detections, camera, &depth);

        let target = &self.settings.target_object;
        let needs_tf = observations.iter().any(|o| &o.class_id == target && o.point.is_some());
        let observations: Vec<Observation> = if needs_tf {
            match tf.lookup(&self.settings.earth_frame, camera_frame(frame)) {
                Ok(earth_from_camera) => observations.into_iter().map(|o| o.transformed(&earth_from_camera)).collect(),
                Err(e) => return Ok(FrameStep::TfFailed(e)),
            }
        } else {
            observations
        };
        Ok(FrameStep::Tracked(self.tracker.observe(&observations, frame.stamp)))
    }

    /// 同步后的一帧: 显示 -> 跟踪 -> 发布
    fn process_frame(&mut self, frame: SyncedFrame, tf: &Mutex<TfBuffer>, outputs: &Outputs, logger: &Logger) -> Result<()> {
        if self.settings.show_detection {
            if let Err(e) = self.show(&frame) {
                log_warn!(logger.once(), "检测结果显示失败: {:#}", e);
            }
        }

        let before = self.tracker.phase();
        let step = self.track_frame(&frame, &*lock(tf)?)?;
        let report = match step {
            FrameStep::NoCalibration => {
                log_warn!(logger, "No camera calibration available");
                return Ok(());
            }
            FrameStep::TfFailed(e) => {
                log_warn!(logger, "TF exception: {}", e);
                return Ok(());
            }
            FrameStep::Tracked(report) => report,
        };
        for event in &report.events {
            match event {
                TrackEvent::Created { id, detection_id } => {
                    log_info!(logger, "New candidate {} from detection {}", id, detection_id);
                }
                TrackEvent::Updated { id, detection_id } => {
                    log_info!(logger, "Update candidate {} from detection {}", id, detection_id);
                }
            }
        }
        self.log_phase_change(logger, before);

        if report.with_depth == 0 {
            return Ok(());
        }
        if let Some(best) = self.tracker.best() {
            log_debug!(logger, "Candidate {} point {:.3} {:.3} {:.3}", best.class_name, best.point.x, best.point.y, best.point.z);
            outputs.publish_candidate(best, &self.settings.earth_frame)?;
            self.report_ground_truth(logger, best);
        }
        Ok(())
    }

    /// 点云细化最佳候选
    fn process_cloud(&mut self, msg: &PointCloud2, tf: &Mutex<TfBuffer>, outputs: &Outputs, logger: &Logger) -> Result<()> {
        if self.tracker.best().is_none() {
            return Ok(());
        }
        let earth = self.settings.earth_frame.clone();
        let (earth_from_cloud, earth_from_base) = {
            let tf = lock(tf)?;
            let lookup = tf
                .lookup(&earth, &msg.header.frame_id)
                .and_then(|c| Ok((c, tf.lookup(&earth, &self.settings.base_frame)?)));
            match lookup {
                Ok(pair) => pair,
                Err(e) => {
                    log_error!(logger.once(), "Could not transform {} to {}: {}", msg.header.frame_id, earth, e);
                    return Ok(());
                }
            }
        };

        let points: Vec<Vector3<f64>> = cloud::read_xyz(msg)
            .context("点云解析失败")?
            .into_iter()
            .map(|p| earth_from_cloud.transform_point(&Point3::from(p)).coords)
            .collect();
        let base = earth_from_base.translation.vector;

        let before = self.tracker.phase();
        let outcome = self.tracker.refine_with_cloud(&points, &base);
        self.log_phase_change(logger, before);

        match outcome {
            CloudOutcome::Refined { kept, top } => {
                log_debug!(logger, "Candidate top {:.3} {:.3} {:.3} from {} points", top.x, top.y, top.z, kept.len());
                let header = Header {
                    stamp: msg.header.stamp.clone(),
                    frame_id: earth.clone(),
                };
                outputs.cloud_pub.publish(cloud::write_xyz(&kept, header))?;
                if let Some(best) = self.tracker.best() {
                    outputs.publish_candidate(best, &earth)?;
                    self.report_ground_truth(logger, best);
                }
            }
            CloudOutcome::TooNear(distance) => {
                log_info!(logger, "Candidate {:.2} m from {}", distance, self.settings.base_frame);
            }
            CloudOutcome::TooFewPoints(n) => {
                log_debug!(logger, "Only {} cloud points around candidate", n);
            }
            CloudOutcome::Inactive | CloudOutcome::NoCandidate => {}
        }
        Ok(())
    }
}

/// 深度检测节点
pub struct DepthtectionNode {
    node: Node,
    pipeline: Arc<Mutex<Pipeline>>,
    tf: Arc<Mutex<TfBuffer>>,
    // 订阅组
    image_sub: Option<Subscription<Image>>,
    depth_sub: Subscription<Image>,
    camera_info_sub: Subscription<CameraInfo>,
    detection_sub: Subscription<Detection2DArray>,
    point_cloud_sub: Subscription<PointCloud2>,
    ground_truth_sub: Option<Subscription<PoseStamped>>,
    phase_sub: Subscription<std_msgs::msg::String>,
    tf_sub: Subscription<TFMessage>,
    tf_static_sub: Subscription<TFMessage>,
}

impl DepthtectionNode {
    pub fn new(executor: &Executor) -> Result<Self> {
        let node = executor
            .create_node("depthtection")
            .context("无法创建depthtection节点")?;
        let settings = Settings::declare(&node).context("节点参数读取失败")?;
        let logger = node.logger().clone();
        log_info!(&logger, "{:?}", settings);

        let outputs = Outputs {
            pose_pub: node
                .create_publisher::<PoseStamped>(settings.computed_pose_topic.as_str())
                .context("无法创建pose发布器")?,
            raw_pub: node
                .create_publisher::<PoseStamped>("raw_pose")
                .context("无法创建raw_pose发布器")?,
            filtered_pub: node
                .create_publisher::<PoseStamped>("filtered_pose")
                .context("无法创建filtered_pose发布器")?,
            compensated_pub: node
                .create_publisher::<PoseStamped>("compensated_pose")
                .context("无法创建compensated_pose发布器")?,
            cloud_pub: node
                .create_publisher::<PointCloud2>("cloud_filtered")
                .context("无法创建cloud_filtered发布器")?,
        };

        let pipeline = Arc::new(Mutex::new(Pipeline::new(settings.clone())));
        let tf = Arc::new(Mutex::new(TfBuffer::new()));

        // 同步订阅: 深度图、检测结果、(可选)彩色图
        let image_sub = if settings.show_detection {
            log_info!(&logger, "Show_detection enabled: Subscribing to {}", settings.image_topic());
            let (pipeline, tf, outputs, logger) = (pipeline.clone(), tf.clone(), outputs.clone(), logger.clone());
            let sub = node
                .create_subscription::<Image, _>(
                    settings.image_topic().as_str(),
                    move |msg: Image| {
                        let result = lock(&pipeline).and_then(|mut p| {
                            match p.sync.add_image(stamp_of(&msg.header), msg) {
                                Some(frame) => p.process_frame(frame, &tf, &outputs, &logger),
                                None => Ok(()),
                            }
                        });
                        if let Err(e) = result {
                            log_error!(&logger, "{:#}", e);
                        }
                    },
                )
                .context("无法创建RGB订阅器")?;
            Some(sub)
        } else {
            None
        };

        let depth_sub = {
            let (pipeline, tf, outputs, logger) = (pipeline.clone(), tf.clone(), outputs.clone(), logger.clone());
            node.create_subscription::<Image, _>(
                settings.depth_topic().as_str(),
                move |msg: Image| {
                    if msg.data.is_empty() {
                        log_warn!(logger.once(), "接收到空深度图");
                        return;
                    }
                    let result = lock(&pipeline).and_then(|mut p| {
                        match p.sync.add_depth(stamp_of(&msg.header), msg) {
                            Some(frame) => p.process_frame(frame, &tf, &outputs, &logger),
                            None => Ok(()),
                        }
                    });
                    if let Err(e) = result {
                        log_error!(&logger, "{:#}", e);
                    }
                },
            )
            .context("无法创建depth订阅器")?
        };

        let detection_sub = {
            let (pipeline, tf, outputs, logger) = (pipeline.clone(), tf.clone(), outputs.clone(), logger.clone());
            node.create_subscription::<Detection2DArray, _>(
                settings.detection_topic.as_str().qos(QOS_PROFILE_SENSOR_DATA),
                move |msg: Detection2DArray| {
                    let result = lock(&pipeline).and_then(|mut p| {
                        match p.sync.add_detections(stamp_of(&msg.header), msg) {
                            Some(frame) => p.process_frame(frame, &tf, &outputs, &logger),
                            None => Ok(()),
                        }
                    });
                    if let Err(e) = result {
                        log_error!(&logger, "{:#}", e);
                    }
                },
            )
            .context("无法创建detection订阅器")?
        };

        let camera_info_sub = {
            let (pipeline, logger) = (pipeline.clone(), logger.clone());
            node.create_subscription::<CameraInfo, _>(
                settings.camera_info_topic().as_str().qos(QOS_PROFILE_SENSOR_DATA),
                move |msg: CameraInfo| {
                    let result = lock(&pipeline).map(|mut p| {
                        if p.latch_camera(&msg) {
                            log_info!(&logger, "Camera calibration received: {}x{}", msg.width, msg.height);
                        }
                    });
                    if let Err(e) = result {
                        log_error!(&logger, "{:#}", e);
                    }
                },
            )
            .context("无法创建camera_info订阅器")?
        };

        let point_cloud_sub = {
            let (pipeline, tf, outputs, logger) = (pipeline.clone(), tf.clone(), outputs.clone(), logger.clone());
            node.create_subscription::<PointCloud2, _>(
                settings.point_cloud_topic.as_str().qos(QOS_PROFILE_SENSOR_DATA),
                move |msg: PointCloud2| {
                    let result = lock(&pipeline).and_then(|mut p| p.process_cloud(&msg, &tf, &outputs, &logger));
                    if let Err(e) = result {
                        log_error!(&logger, "{:#}", e);
                    }
                },
            )
            .context("无法创建point_cloud订阅器")?
        };

        let ground_truth_sub = match &settings.ground_truth_topic {
            Some(topic) => {
                let (pipeline, logger) = (pipeline.clone(), logger.clone());
                let sub = node
                    .create_subscription::<PoseStamped, _>(
                        topic.as_str(),
                        move |msg: PoseStamped| {
                            let p = &msg.pose.position;
                            match lock(&pipeline) {
                                Ok(mut pipeline) => {
                                    pipeline.ground_truth = Some(Vector3::new(p.x, p.y, p.z));
                                }
                                Err(e) => {
                                    log_error!(&logger, "{:#}", e);
                                }
                            }
                        },
                    )
                    .context("无法创建ground_truth订阅器")?;
                Some(sub)
            }
            None => None,
        };

        let phase_sub = {
            let (pipeline, logger) = (pipeline.clone(), logger.clone());
            node.create_subscription::<std_msgs::msg::String, _>(
                settings.phase_topic.as_str(),
                move |msg: std_msgs::msg::String| {
                    let phase = match msg.data.parse::<Phase>() {
                        Ok(phase) => phase,
                        Err(e) => {
                            log_warn!(&logger, "{}", e);
                            return;
                        }
                    };
                    match lock(&pipeline) {
                        Ok(mut pipeline) => {
                            if pipeline.tracker.set_phase(phase) {
                                log_warn!(&logger, "PHASE: {}", phase);
                            }
                        }
                        Err(e) => {
                            log_error!(&logger, "{:#}", e);
                        }
                    }
                },
            )
            .context("无法创建phase订阅器")?
        };

        // tf 监听
        let tf_sub = {
            let (tf, logger) = (tf.clone(), logger.clone());
            node.create_subscription::<TFMessage, _>(
                "/tf",
                move |msg: TFMessage| match lock(&tf) {
                    Ok(mut tf) => {
                        tf.insert_all(&msg.transforms);
                    }
                    Err(e) => {
                        log_error!(&logger, "{:#}", e);
                    }
                },
            )
            .context("无法创建tf订阅器")?
        };
        let tf_static_sub = {
            let (tf, logger) = (tf.clone(), logger.clone());
            node.create_subscription::<TFMessage, _>(
                "/tf_static".qos(QoSProfile::default().keep_last(100).transient_local()),
                move |msg: TFMessage| match lock(&tf) {
                    Ok(mut tf) => {
                        tf.insert_all(&msg.transforms);
                    }
                    Err(e) => {
                        log_error!(&logger, "{:#}", e);
                    }
                },
            )
            .context("无法创建tf_static订阅器")?
        };
        log_info!(&logger, "depthtection初始化完成");

        Ok(Self {
            node,
            pipeline,
            tf,
            image_sub,
            depth_sub,
            camera_info_sub,
            detection_sub,
            point_cloud_sub,
            ground_truth_sub,
            phase_sub,
            tf_sub,
            tf_static_sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geometry_msgs::msg::TransformStamped;
    use vision_msgs::msg::{Detection2D, ObjectHypothesisWithPose};

    fn camera_info(f: f64) -> CameraInfo {
        let mut msg = CameraInfo::default();
        msg.width = 4;
        msg.height = 4;
        msg.k = [f, 0.0, 2.0, 0.0, f, 2.0, 0.0, 0.0, 1.0];
        msg
    }

    // 4x4 深度图, 只有中心 (2, 2) 有 1 m 深度
    fn frame(depth_frame: &str, detection_frame: &str) -> SyncedFrame {
        let mut depth = Image::default();
        depth.header.frame_id = depth_frame.to_string();
        depth.width = 4;
        depth.height = 4;
        depth.step = 16;
        depth.encoding = "32FC1".to_string();
        let mut pixels = vec![0.0f32; 16];
        pixels[2 * 4 + 2] = 1.0;
        depth.data = pixels.iter().flat_map(|v| v.to_le_bytes()).collect();

        let mut detection = Detection2D::default();
        detection.id = "1".to_string();
        detection.bbox.center.position.x = 2.0;
        detection.bbox.center.position.y = 2.0;
        let mut result = ObjectHypothesisWithPose::default();
        result.hypothesis.class_id = "small_blue_box".to_string();
        result.hypothesis.score = 0.9;
        detection.results.push(result);
        let mut detections = Detection2DArray::default();
        detections.header.frame_id = detection_frame.to_string();
        detections.detections.push(detection);

        Frame { stamp: (1, 0), depth, detections, image: None }
    }

    fn earth_to(child: &str) -> TfBuffer {
        let mut msg = TransformStamped::default();
        msg.header.frame_id = "earth".to_string();
        msg.child_frame_id = child.to_string();
        msg.transform.translation.x = 1.0;
        msg.transform.rotation.x = 0.0;
        msg.transform.rotation.y = 0.0;
        msg.transform.rotation.z = 0.0;
        msg.transform.rotation.w = 1.0;
        let mut buffer = TfBuffer::new();
        buffer.insert(&msg);
        buffer
    }

    #[test]
    fn first_calibration_is_kept() {
        let mut p = Pipeline::new(Settings::default());
        assert!(p.latch_camera(&camera_info(100.0)));
        assert!(!p.latch_camera(&camera_info(200.0)));
        assert_eq!(p.camera.as_ref().map(|c| c.fx), Some(100.0));
    }

    #[test]
    fn uncalibrated_info_is_not_latched() {
        let mut p = Pipeline::new(Settings::default());
        assert!(!p.latch_camera(&CameraInfo::default()));
        assert!(p.camera.is_none());
        assert!(p.latch_camera(&camera_info(100.0)));
    }

    #[test]
    fn camera_frame_prefers_depth_header() {
        assert_eq!(camera_frame(&frame("depth_optical", "color")), "depth_optical");
        assert_eq!(camera_frame(&frame("", "color")), "color");
    }

    #[test]
    fn frame_without_calibration_is_dropped() {
        let mut p = Pipeline::new(Settings::default());
        let step = p.track_frame(&frame("camera", ""), &earth_to("camera")).unwrap();
        assert_eq!(step, FrameStep::NoCalibration);
        assert!(p.tracker.candidates().is_empty());
    }

    #[test]
    fn tf_failure_leaves_tracker_untouched() {
        let mut p = Pipeline::new(Settings::default());
        p.latch_camera(&camera_info(100.0));
        let step = p.track_frame(&frame("camera", ""), &TfBuffer::new()).unwrap();
        assert!(matches!(step, FrameStep::TfFailed(_)));
        assert!(p.tracker.candidates().is_empty());
        assert_eq!(p.tracker.phase(), Phase::NoDetection);
    }

    #[test]
    fn tracked_point_is_in_earth_frame() {
        for (depth_frame, detection_frame) in [("camera", "other"), ("", "camera")] {
            let mut p = Pipeline::new(Settings::default());
            p.latch_camera(&camera_info(100.0));
            let step = p.track_frame(&frame(depth_frame, detection_frame), &earth_to("camera")).unwrap();
            let FrameStep::Tracked(report) = step else {
                panic!("unexpected {step:?}");
            };
            assert_eq!(report.with_depth, 1);
            assert_eq!(p.tracker.best().unwrap().point, Vector3::new(1.0, 0.0, 1.0));
        }
    }

    #[test]
    fn pose_has_identity_orientation() {
        let pose = pose_stamped(&Vector3::new(1.0, 2.0, 3.0), (4, 5), "earth");
        assert_eq!(pose.header.frame_id, "earth");
        assert_eq!((pose.header.stamp.sec, pose.header.stamp.nanosec), (4, 5));
        assert_eq!(pose.pose.position.z, 3.0);
        assert_eq!(pose.pose.orientation.w, 1.0);
    }

    #[test]
    fn poisoned_lock_is_an_error() {
        let mutex = Arc::new(Mutex::new(0));
        let m = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = m.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(lock(&mutex).is_err());
    }
}
