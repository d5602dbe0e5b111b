// ========================================
// 支持转换的编码格式：
// ========================================
// |   编码格式    |     目标类型      |   通道数  |    深度   |
// |--------------|------------------|----------|-----------|
// | "mono8"      | CV_8UC1          | 1        | 8-bit     |
// | "bgr8"       | CV_8UC3          | 3        | 8-bit     |
// | "rgb8"       | CV_8UC3 (转BGR)  | 3        | 8-bit     |
// | "bgra8"      | CV_8UC4          | 4        | 8-bit     |
// | "rgba8"      | CV_8UC4          | 4        | 8-bit     |
// | "32FC1"      | DepthImage       | 1        | 32-bit float, 米 |
// | "16UC1"      | DepthImage       | 1        | 16-bit, 毫米 |
// | "mono16"     | DepthImage       | 1        | 16-bit, 毫米 |
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
};
use sensor_msgs::msg::Image;
use thiserror::Error;

use crate::camera::DepthImage;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("image buffer too small: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("opencv error")]
    OpenCv(#[from] opencv::Error),
}

pub struct CvBridge;

impl CvBridge {
    /// 彩色/灰度图转 Mat, rgb 系列统一转成 BGR 顺序
    pub fn imgmsg_to_cv2(msg: &Image) -> Result<Mat, BridgeError> {
        let (channels, swap) = match msg.encoding.as_str() {
            "mono8" => (1, None),
            "bgr8" => (3, None),
            "rgb8" => (3, Some(imgproc::COLOR_RGB2BGR)),
            "bgra8" => (4, None),
            "rgba8" => (4, Some(imgproc::COLOR_RGBA2BGRA)),
            other => return Err(BridgeError::UnsupportedEncoding(other.to_string())),
        };

        let row_bytes = msg.width as usize * channels;
        let data = compact_rows(msg, row_bytes)?;
        let flat = Mat::from_slice(&data)?;
        let mat = flat.reshape(channels as i32, msg.height as i32)?.try_clone()?;

        match swap {
            Some(code) => {
                let mut dst = Mat::default();
                imgproc::cvt_color_def(&mat, &mut dst, code)?;
                Ok(dst)
            }
            None => Ok(mat),
        }
    }

    /// 深度图转米制 DepthImage
    pub fn imgmsg_to_depth(msg: &Image) -> Result<DepthImage, BridgeError> {
        let width = msg.width as usize;
        match msg.encoding.as_str() {
            "32FC1" => {
                let data = compact_rows(msg, width * 4)?;
                let depth = data
                    .chunks_exact(4)
                    .map(|b| {
                        let bytes = [b[0], b[1], b[2], b[3]];
                        if msg.is_bigendian != 0 { f32::from_be_bytes(bytes) } else { f32::from_le_bytes(bytes) }
                    })
                    .collect();
                Ok(DepthImage::new(msg.width, msg.height, depth))
            }
            "16UC1" | "mono16" => {
                let data = compact_rows(msg, width * 2)?;
                let depth = data
                    .chunks_exact(2)
                    .map(|b| {
                        let bytes = [b[0], b[1]];
                        let mm = if msg.is_bigendian != 0 { u16::from_be_bytes(bytes) } else { u16::from_le_bytes(bytes) };
                        mm as f32 * 0.001
                    })
                    .collect();
                Ok(DepthImage::new(msg.width, msg.height, depth))
            }
            other => Err(BridgeError::UnsupportedEncoding(other.to_string())),
        }
    }
}

// 去掉每行 step 末尾的填充字节
fn compact_rows(msg: &Image, row_bytes: usize) -> Result<Vec<u8>, BridgeError> {
    let rows = msg.height as usize;
    let step = (msg.step as usize).max(row_bytes);
    let needed = if rows == 0 { 0 } else { step * (rows - 1) + row_bytes };
    if msg.data.len() < needed {
        return Err(BridgeError::Truncated { needed, got: msg.data.len() });
    }
    if step == row_bytes {
        return Ok(msg.data[..rows * row_bytes].to_vec());
    }
    let mut data = Vec::with_capacity(rows * row_bytes);
    for row in 0..rows {
        data.extend_from_slice(&msg.data[row * step..row * step + row_bytes]);
    }
    Ok(data)
}
