//! 关键帧定位误差
//!
//! 真值为 KITTI 格式的逐帧位姿。估计轨迹以第一个关键帧为原点，
//! 比较前把真值也换到第一个关键帧的坐标系下。

use nalgebra::Isometry3;
use serde::Serialize;
use thiserror::Error;

use crate::{global_types::FrameId, utility::Utility};

#[derive(Debug, Error, PartialEq)]
pub enum EvaluationError {
    #[error("{keyframes} keyframes but {poses} estimated poses")]
    LengthMismatch { keyframes: usize, poses: usize },
    #[error("no ground truth for frame {frame_id}, only {available} poses")]
    MissingGroundTruth { frame_id: FrameId, available: usize },
}

/// 单个关键帧的误差
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KeyframeError {
    pub frame_id: FrameId,
    /// 相机位置的欧氏距离 (m)
    pub translation: f64,
    /// 旋转角度差 (rad)
    pub rotation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrajectoryError {
    pub keyframes: Vec<KeyframeError>,
    pub mean_translation: f64,
    pub max_translation: f64,
    pub mean_rotation: f64,
    pub max_rotation: f64,
}

impl TrajectoryError {
    /// 逐关键帧比较 estimate 和 ground_truth[keyframe]
    pub fn evaluate(
        keyframes: &[FrameId],
        estimate: &[Isometry3<f64>],
        ground_truth: &[Isometry3<f64>],
    ) -> Result<Self, EvaluationError> {
        if keyframes.len() != estimate.len() {
            return Err(EvaluationError::LengthMismatch {
                keyframes: keyframes.len(),
                poses: estimate.len(),
            });
        }
        let truth = |frame_id: FrameId| {
            ground_truth
                .get(frame_id as usize)
                .ok_or(EvaluationError::MissingGroundTruth {
                    frame_id,
                    available: ground_truth.len(),
                })
        };
        let origin = match keyframes.first() {
            Some(&frame_id) => truth(frame_id)?.inverse(),
            None => Isometry3::identity(),
        };

        let mut errors = Vec::with_capacity(keyframes.len());
        for (&frame_id, pose) in keyframes.iter().zip(estimate) {
            let expected = origin * truth(frame_id)?;
            let (translation, rotation) = Utility::pose_distance(&expected, pose);
            errors.push(KeyframeError {
                frame_id,
                translation,
                rotation,
            });
        }

        let count = errors.len().max(1) as f64;
        Ok(Self {
            mean_translation: errors.iter().map(|e| e.translation).sum::<f64>() / count,
            max_translation: errors.iter().map(|e| e.translation).fold(0.0, f64::max),
            mean_rotation: errors.iter().map(|e| e.rotation).sum::<f64>() / count,
            max_rotation: errors.iter().map(|e| e.rotation).fold(0.0, f64::max),
            keyframes: errors,
        })
    }
}
