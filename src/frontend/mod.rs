//! 前端接口
//!
//! 前端负责特征检测、双目匹配和 RANSAC，这里只定义后端需要的窄接口。
mod recorded;
pub use recorded::RecordedFrontend;

use nalgebra::Isometry3;
use serde::Serialize;
use thiserror::Error;

use crate::{
    global_types::{FrameId, StereoKeypoint},
    track_store::{TrackError, TrackStore},
};

#[derive(Debug, Clone, Error)]
pub enum FrontendFailure {
    #[error("only {found} inliers between frames, {required} required")]
    TooFewInliers { found: usize, required: usize },
    #[error("ransac gave up after {iterations} iterations")]
    RansacExhausted { iterations: usize },
    #[error("no estimate between frame {frame_a} and frame {frame_b}")]
    NotAvailable { frame_a: FrameId, frame_b: FrameId },
}

/// 两帧之间的前端结果
#[derive(Debug, Clone)]
pub struct FrameMatches {
    /// frame_b 在 frame_a 坐标系下的位姿
    pub relative_pose: Isometry3<f64>,
    pub inliers_a: Vec<StereoKeypoint>,
    pub inliers_b: Vec<StereoKeypoint>,
}

pub trait Frontend {
    fn relative_pose_and_inliers(
        &self,
        frame_a: FrameId,
        frame_b: FrameId,
    ) -> Result<FrameMatches, FrontendFailure>;
}

/// 相邻帧之间的前端位姿，作为窗口优化的初值
#[derive(Debug, Clone, Default)]
pub struct OdometrySeeds {
    first_frame: FrameId,
    /// relative[i] 是 first_frame + i 相对前一帧的位姿
    relative: Vec<Option<Isometry3<f64>>>,
}

impl OdometrySeeds {
    pub fn new(first_frame: FrameId) -> Self {
        Self {
            first_frame,
            relative: vec![None],
        }
    }

    pub fn first_frame(&self) -> FrameId {
        self.first_frame
    }

    pub fn last_frame(&self) -> FrameId {
        self.first_frame + self.relative.len().saturating_sub(1) as FrameId
    }

    fn slot(&mut self, frame_id: FrameId) -> Option<&mut Option<Isometry3<f64>>> {
        if frame_id <= self.first_frame {
            return None;
        }
        let index = (frame_id - self.first_frame) as usize;
        if index >= self.relative.len() {
            self.relative.resize(index + 1, None);
        }
        self.relative.get_mut(index)
    }

    /// frame_id 相对 frame_id-1 的位姿
    pub fn record(&mut self, frame_id: FrameId, pose: Isometry3<f64>) {
        if let Some(slot) = self.slot(frame_id) {
            *slot = Some(pose);
        }
    }

    /// 前端失败的帧
    pub fn record_missing(&mut self, frame_id: FrameId) {
        if let Some(slot) = self.slot(frame_id) {
            *slot = None;
        }
    }

    pub fn relative(&self, frame_id: FrameId) -> Option<Isometry3<f64>> {
        if frame_id <= self.first_frame {
            return None;
        }
        self.relative
            .get((frame_id - self.first_frame) as usize)
            .copied()
            .flatten()
    }

    pub fn missing_frames(&self) -> Vec<FrameId> {
        (self.first_frame + 1..=self.last_frame())
            .filter(|&f| self.relative(f).is_none())
            .collect()
    }

    /// c0..=ck 各帧相对 c0 的位姿
    ///
    /// 缺失的相对位姿用上一个可用的相对位姿代替（匀速假设），都没有时为单位阵。
    pub fn chain(&self, c0: FrameId, ck: FrameId) -> Vec<Isometry3<f64>> {
        let mut poses = Vec::with_capacity((ck.saturating_sub(c0) + 1) as usize);
        let mut current = Isometry3::identity();
        let mut velocity = self.velocity_before(c0);
        poses.push(current);
        for frame in c0 + 1..=ck {
            let step = match self.relative(frame) {
                Some(step) => {
                    velocity = step;
                    step
                }
                None => {
                    log::debug!("frame {} has no odometry, constant velocity", frame);
                    velocity
                }
            };
            current *= step;
            poses.push(current);
        }
        poses
    }

    /// ck 在 c0 坐标系下的位姿
    pub fn compose(&self, c0: FrameId, ck: FrameId) -> Isometry3<f64> {
        self.chain(c0, ck)
            .last()
            .copied()
            .unwrap_or_else(Isometry3::identity)
    }

    /// 累计平移距离
    pub fn path_length(&self, c0: FrameId, ck: FrameId) -> f64 {
        self.chain(c0, ck)
            .windows(2)
            .map(|w| (w[0].inverse() * w[1]).translation.vector.norm())
            .sum()
    }

    fn velocity_before(&self, frame_id: FrameId) -> Isometry3<f64> {
        (self.first_frame + 1..=frame_id)
            .rev()
            .find_map(|f| self.relative(f))
            .unwrap_or_else(Isometry3::identity)
    }
}

/// 顺序处理的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub processed: usize,
    pub failed: usize,
    pub tracks_created: usize,
    pub tracks_extended: usize,
}

/// 按帧顺序读取前端结果并写入轨迹数据库
///
/// 前端失败的帧对跳过，不延长轨迹，初值记为缺失。
pub fn ingest_sequence<F: Frontend + ?Sized>(
    frontend: &F,
    store: &mut TrackStore,
    first_frame: FrameId,
    last_frame: FrameId,
) -> Result<(OdometrySeeds, IngestReport), TrackError> {
    let mut seeds = OdometrySeeds::new(first_frame);
    let mut report = IngestReport::default();
    for frame_id in first_frame + 1..=last_frame {
        match frontend.relative_pose_and_inliers(frame_id - 1, frame_id) {
            Ok(matches) => {
                let stats = store.extend(frame_id, &matches.inliers_a, &matches.inliers_b)?;
                seeds.record(frame_id, matches.relative_pose);
                report.processed += 1;
                report.tracks_created += stats.created;
                report.tracks_extended += stats.extended;
                log::debug!(
                    "frame {}: {} inliers, {} extended, {} new",
                    frame_id,
                    matches.inliers_a.len(),
                    stats.extended,
                    stats.created
                );
            }
            Err(failure) => {
                log::warn!("frontend failed at frame {}: {}", frame_id, failure);
                seeds.record_missing(frame_id);
                report.failed += 1;
            }
        }
        if frame_id % 100 == 0 {
            log::info!("ingested frame {} ({} tracks)", frame_id, store.num_tracks());
        }
    }
    Ok((seeds, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn step(x: f64) -> Isometry3<f64> {
        Isometry3::new(Vector3::new(x, 0.0, 1.0), Vector3::new(0.0, 0.02, 0.0))
    }

    #[test]
    fn test_chain_and_compose() {
        let mut seeds = OdometrySeeds::new(0);
        for f in 1..=4 {
            seeds.record(f, step(0.1 * f as f64));
        }
        let chain = seeds.chain(1, 4);
        assert_eq!(chain.len(), 4);
        assert_relative_eq!(chain[0], Isometry3::identity());
        let expected = step(0.2) * step(0.3) * step(0.4);
        assert_relative_eq!(seeds.compose(1, 4), expected, epsilon = 1e-12);
        assert_eq!(seeds.last_frame(), 4);
        assert!(seeds.missing_frames().is_empty());
    }

    #[test]
    fn test_missing_uses_constant_velocity() {
        let mut seeds = OdometrySeeds::new(0);
        seeds.record(1, step(0.5));
        seeds.record_missing(2);
        seeds.record(3, step(0.0));
        let chain = seeds.chain(0, 3);
        assert_relative_eq!(chain[2], step(0.5) * step(0.5), epsilon = 1e-12);
        assert_eq!(seeds.missing_frames(), vec![2]);
        // 窗口从缺失帧开始时用之前的速度
        let chain = seeds.chain(2, 3);
        assert_relative_eq!(chain[1], step(0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_path_length() {
        let mut seeds = OdometrySeeds::new(0);
        for f in 1..=3 {
            seeds.record(f, Isometry3::translation(0.0, 0.0, 2.0));
        }
        assert_relative_eq!(seeds.path_length(0, 3), 6.0, epsilon = 1e-12);
        assert_relative_eq!(seeds.path_length(1, 2), 2.0, epsilon = 1e-12);
    }
}
