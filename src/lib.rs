/// 双目视觉里程计后端
///
/// 特征轨迹数据库、滑动窗口光束法平差和关键帧位姿图。
/// 前端（特征检测、双目匹配、RANSAC）和优化器都通过窄接口接入。
///
/// nalgebra
/// https://docs.rs/nalgebra/latest/nalgebra/
pub mod bundle;
pub mod camera;
pub mod config;
pub mod evaluation;
pub mod frontend;
pub mod global_types;
pub mod optimizer;
pub mod pose_graph;
pub mod save;
pub mod track_store; // 特征轨迹
pub mod utility;

#[cfg(test)]
pub(crate) mod synthetic;
