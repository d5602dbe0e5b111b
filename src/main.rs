#![allow(dead_code)]
mod camera; // 相机内参与深度图
mod candidate; // 候选目标
mod cloud; // 点云编解码
mod cvbridge_rs;
mod depthtection_node;
mod detection;
mod overlay; // 检测结果显示
mod params; // 节点参数
mod phase;
mod sync; // 精确时间同步
mod tf_buffer;
mod tracker;
use rclrs::*;
use anyhow::{Result, Context as AnyhowContext};
use depthtection_node::DepthtectionNode;

fn main() -> Result<()> {
    let context = Context::default_from_env()
        .context("depthtection节点上下文创建失败")?;

    let mut executor = context.create_basic_executor();

    let _depthtection = DepthtectionNode::new(&executor)
        .context("depthtection节点创建失败")?;

    executor
        .spin(SpinOptions::default())
        .first_error()
        .context("节点执行器异常退出")?;

    Ok(())
}
