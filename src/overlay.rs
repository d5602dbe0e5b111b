use std::collections::HashSet;

use anyhow::{Context, Result};
use opencv::{
    core::{Mat, Point, Rect, Scalar},
    highgui,
    imgproc,
    prelude::*,
};
use sensor_msgs::msg::Image;
use vision_msgs::msg::Detection2D;

use crate::cvbridge_rs::CvBridge;
use crate::detection::bbox_rect;

/// 检测框绘制
pub struct DetectionOverlay {
    pub mat: Mat,
}

impl DetectionOverlay {
    pub fn new(mat: Mat) -> Self {
        Self { mat }
    }

    /// ROS Image 转换为 BGR
    pub fn from_ros_image(msg: &Image) -> Result<Self> {
        let mat = CvBridge::imgmsg_to_cv2(msg).context("ROS图像消息转BGR_MAT失败")?;
        Ok(Self::new(mat))
    }

    /// 画框并在左上角标注检测 id, 没有假设的检测也画
    pub fn draw(&mut self, detection: &Detection2D) -> Result<&mut Self> {
        let green = Scalar::new(0.0, 255.0, 0.0, 0.0);
        let (x, y, w, h) = bbox_rect(detection);
        let rect = Rect::new(x as i32, y as i32, w as i32, h as i32);
        imgproc::rectangle(&mut self.mat, rect, green, 2, imgproc::LINE_8, 0)
            .context("检测框绘制失败")?;
        imgproc::put_text(
            &mut self.mat,
            &detection.id,
            Point::new(x as i32, y as i32),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            green,
            1,
            imgproc::LINE_8,
            false,
        )
        .context("检测id标注失败")?;
        Ok(self)
    }
}

/// 显示窗口, 首次使用时按图像尺寸创建
#[derive(Default)]
pub struct Viewer {
    windows: HashSet<String>,
}

impl Viewer {
    pub fn show(&mut self, title: &str, overlay: &DetectionOverlay) -> Result<()> {
        if !self.windows.contains(title) {
            highgui::named_window(title, highgui::WINDOW_NORMAL).context("窗口创建失败")?;
            highgui::resize_window(title, overlay.mat.cols(), overlay.mat.rows())
                .context("窗口尺寸设置失败")?;
            self.windows.insert(title.to_string());
        }
        highgui::imshow(title, &overlay.mat).context("Mat展示失败")?;
        highgui::wait_key(1).context("窗口刷新失败")?;
        Ok(())
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        if !self.windows.is_empty() {
            let _ = highgui::destroy_all_windows();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Vec3b, CV_8UC3};

    // 没有任何假设, 仍需画出
    fn detection() -> Detection2D {
        let mut msg = Detection2D::default();
        msg.id = "3".into();
        msg.bbox.center.position.x = 10.0;
        msg.bbox.center.position.y = 10.0;
        msg.bbox.size_x = 8.0;
        msg.bbox.size_y = 6.0;
        msg
    }

    #[test]
    fn draws_unclassified_detection_box() {
        let mat = Mat::new_rows_cols_with_default(20, 20, CV_8UC3, Scalar::all(0.0)).unwrap();
        let mut overlay = DetectionOverlay::new(mat);
        overlay.draw(&detection()).unwrap();
        // 左边框 x=6, 中间 y=10
        let px = *overlay.mat.at_2d::<Vec3b>(10, 6).unwrap();
        assert_eq!(px, Vec3b::from([0, 255, 0]));
        let inside = *overlay.mat.at_2d::<Vec3b>(10, 10).unwrap();
        assert_eq!(inside, Vec3b::from([0, 0, 0]));
    }

    #[test]
    fn depth_images_cannot_be_overlaid() {
        let mut msg = Image::default();
        msg.encoding = "32FC1".into();
        assert!(DetectionOverlay::from_ros_image(&msg).is_err());
    }
}
