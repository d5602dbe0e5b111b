use nalgebra::Vector3;
use sensor_msgs::msg::{PointCloud2, PointField};
use std_msgs::msg::Header;
use thiserror::Error;

// sensor_msgs/PointField 中 FLOAT32 的取值
const FLOAT32: u8 = 7;
const XYZ_POINT_STEP: u32 = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("point cloud has no float32 field {0}")]
    MissingField(&'static str),
    #[error("point cloud data is shorter than declared ({needed} > {got})")]
    Truncated { needed: usize, got: usize },
    #[error("point cloud layout is inconsistent (point_step {point_step}, row_step {row_step})")]
    BadLayout { point_step: u32, row_step: u32 },
}

fn field_offset(msg: &PointCloud2, name: &'static str) -> Result<usize, CloudError> {
    msg.fields
        .iter()
        .find(|f| f.name == name && f.datatype == FLOAT32)
        .map(|f| f.offset as usize)
        .ok_or(CloudError::MissingField(name))
}

/// 读取 x/y/z 三个 float32 字段
pub fn read_xyz(msg: &PointCloud2) -> Result<Vec<Vector3<f64>>, CloudError> {
    let offsets = [field_offset(msg, "x")?, field_offset(msg, "y")?, field_offset(msg, "z")?];
    let (rows, cols) = (msg.height as usize, msg.width as usize);
    if rows == 0 || cols == 0 {
        return Ok(Vec::new());
    }

    let bad_layout = CloudError::BadLayout { point_step: msg.point_step, row_step: msg.row_step };
    let point_step = msg.point_step as usize;
    let row_step = msg.row_step as usize;
    let max_offset = offsets.iter().max().copied().unwrap_or(0);
    // 每个点必须容纳全部字段, 每行必须容纳全部点
    if point_step < max_offset + 4 {
        return Err(bad_layout);
    }
    match cols.checked_mul(point_step) {
        Some(min_row) if row_step >= min_row => {}
        _ => return Err(bad_layout),
    }

    let needed = (rows - 1)
        .checked_mul(row_step)
        .and_then(|n| n.checked_add((cols - 1) * point_step + max_offset + 4))
        .ok_or(bad_layout)?;
    if msg.data.len() < needed {
        return Err(CloudError::Truncated { needed, got: msg.data.len() });
    }

    let read = |at: usize| {
        let bytes = [msg.data[at], msg.data[at + 1], msg.data[at + 2], msg.data[at + 3]];
        if msg.is_bigendian { f32::from_be_bytes(bytes) } else { f32::from_le_bytes(bytes) }
    };

    let mut points = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for col in 0..cols {
            let base = row * row_step + col * point_step;
            points.push(Vector3::new(
                read(base + offsets[0]) as f64,
                read(base + offsets[1]) as f64,
                read(base + offsets[2]) as f64,
            ));
        }
    }
    Ok(points)
}

/// 无序 xyz 点云
pub fn write_xyz(points: &[Vector3<f64>], header: Header) -> PointCloud2 {
    let fields = ["x", "y", "z"]
        .iter()
        .enumerate()
        .map(|(i, name)| PointField {
            name: name.to_string(),
            offset: (i * 4) as u32,
            datatype: FLOAT32,
            count: 1,
        })
        .collect();

    let mut data = Vec::with_capacity(points.len() * XYZ_POINT_STEP as usize);
    for p in points {
        for v in [p.x, p.y, p.z] {
            data.extend_from_slice(&(v as f32).to_le_bytes());
        }
    }

    PointCloud2 {
        header,
        height: 1,
        width: points.len() as u32,
        fields,
        is_bigendian: false,
        point_step: XYZ_POINT_STEP,
        row_step: XYZ_POINT_STEP * points.len() as u32,
        data,
        is_dense: true,
    }
}
