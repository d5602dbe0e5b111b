use nalgebra::Vector3;
use sensor_msgs::msg::CameraInfo;

/// 针孔相机内参, 由第一帧 CameraInfo 锁定
#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: Vec<f64>,
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    /// k 为行主序 3x3 内参矩阵, 焦距为零时视为未标定
    pub fn from_camera_info(msg: &CameraInfo) -> Option<Self> {
        let k = &msg.k;
        let (fx, fy) = (k[0], k[4]);
        if fx == 0.0 || fy == 0.0 {
            return None;
        }
        Some(Self {
            fx,
            fy,
            cx: k[2],
            cy: k[5],
            distortion: msg.d.clone(),
            width: msg.width,
            height: msg.height,
        })
    }

    /// 像素 (u, v) 与深度 d 反投影到光学坐标系
    pub fn project(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }
}

/// 单通道深度图, 单位米
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl DepthImage {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self { width, height, data }
    }

    /// 越界、零值、非有限值都返回 None
    pub fn depth_at(&self, u: i64, v: i64) -> Option<f64> {
        if u < 0 || v < 0 || u >= self.width as i64 || v >= self.height as i64 {
            return None;
        }
        let depth = self.data[(v as usize) * self.width as usize + u as usize];
        if depth == 0.0 || !depth.is_finite() {
            return None;
        }
        Some(depth as f64)
    }

    /// 取检测框中心的深度并反投影
    pub fn point_at(&self, camera: &CameraModel, u: f64, v: f64) -> Option<Vector3<f64>> {
        // NaN 转 i64 为 0, 需先排除
        if !u.is_finite() || !v.is_finite() {
            return None;
        }
        let (pu, pv) = (u.round(), v.round());
        let depth = self.depth_at(pu as i64, pv as i64)?;
        Some(camera.project(pu, pv, depth))
    }
}
