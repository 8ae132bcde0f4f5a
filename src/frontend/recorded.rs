use std::{collections::HashMap, path::Path};

use anyhow::Context;
use nalgebra::{Isometry3, Matrix3, Point2, Rotation3, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

use super::{FrameMatches, Frontend, FrontendFailure};
use crate::global_types::{FrameId, StereoKeypoint};

/// 前端离线输出中的一行位姿
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoseRecord {
    frame_a: FrameId,
    frame_b: FrameId,
    r00: f64,
    r01: f64,
    r02: f64,
    r10: f64,
    r11: f64,
    r12: f64,
    r20: f64,
    r21: f64,
    r22: f64,
    tx: f64,
    ty: f64,
    tz: f64,
}

impl PoseRecord {
    fn pose(&self) -> Isometry3<f64> {
        let m = Matrix3::new(
            self.r00, self.r01, self.r02, self.r10, self.r11, self.r12, self.r20, self.r21,
            self.r22,
        );
        let rotation = Rotation3::from_matrix(&m);
        Isometry3::from_parts(
            Translation3::new(self.tx, self.ty, self.tz),
            UnitQuaternion::from_rotation_matrix(&rotation),
        )
    }

    #[cfg(test)]
    fn new(frame_a: FrameId, frame_b: FrameId, pose: &Isometry3<f64>) -> Self {
        let r = pose.rotation.to_rotation_matrix().into_inner();
        let t = pose.translation.vector;
        Self {
            frame_a,
            frame_b,
            r00: r[(0, 0)],
            r01: r[(0, 1)],
            r02: r[(0, 2)],
            r10: r[(1, 0)],
            r11: r[(1, 1)],
            r12: r[(1, 2)],
            r20: r[(2, 0)],
            r21: r[(2, 1)],
            r22: r[(2, 2)],
            tx: t.x,
            ty: t.y,
            tz: t.z,
        }
    }
}

/// 前端离线输出中的一对内点
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InlierRecord {
    frame_a: FrameId,
    frame_b: FrameId,
    feature_a: u64,
    xl_a: f64,
    yl_a: f64,
    xr_a: f64,
    yr_a: f64,
    feature_b: u64,
    xl_b: f64,
    yl_b: f64,
    xr_b: f64,
    yr_b: f64,
}

type FramePair = (FrameId, FrameId);

/// 回放离线记录的前端结果
///
/// - poses.csv:   frame_a,frame_b,r00..r22,tx,ty,tz
/// - inliers.csv: frame_a,frame_b,feature_a,xl_a,yl_a,xr_a,yr_a,feature_b,xl_b,yl_b,xr_b,yr_b
#[derive(Debug, Default)]
pub struct RecordedFrontend {
    poses: HashMap<FramePair, Isometry3<f64>>,
    inliers: HashMap<FramePair, (Vec<StereoKeypoint>, Vec<StereoKeypoint>)>,
    min_inliers: usize,
}

impl RecordedFrontend {
    const POSES_FILE: &'static str = "poses.csv";
    const INLIERS_FILE: &'static str = "inliers.csv";

    pub fn new(min_inliers: usize) -> Self {
        Self {
            min_inliers,
            ..Default::default()
        }
    }

    pub fn read_from_dir(path: &Path, min_inliers: usize) -> anyhow::Result<Self> {
        let mut frontend = Self::new(min_inliers);
        frontend.poses = Self::read_poses(&path.join(Self::POSES_FILE))?;
        frontend.inliers = Self::read_inliers(&path.join(Self::INLIERS_FILE))?;
        log::info!(
            "recorded frontend: {} poses, {} inlier sets",
            frontend.poses.len(),
            frontend.inliers.len()
        );
        Ok(frontend)
    }

    fn read_poses(path: &Path) -> anyhow::Result<HashMap<FramePair, Isometry3<f64>>> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("open {}", path.display()))?;
        let mut poses = HashMap::new();
        for record in reader.deserialize() {
            let record: PoseRecord = record?;
            poses.insert((record.frame_a, record.frame_b), record.pose());
        }
        Ok(poses)
    }

    #[allow(clippy::type_complexity)]
    fn read_inliers(
        path: &Path,
    ) -> anyhow::Result<HashMap<FramePair, (Vec<StereoKeypoint>, Vec<StereoKeypoint>)>> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("open {}", path.display()))?;
        let mut inliers: HashMap<FramePair, (Vec<_>, Vec<_>)> = HashMap::new();
        for record in reader.deserialize() {
            let r: InlierRecord = record?;
            let entry = inliers.entry((r.frame_a, r.frame_b)).or_default();
            entry.0.push(StereoKeypoint::new(
                r.feature_a,
                Point2::new(r.xl_a, r.yl_a),
                Point2::new(r.xr_a, r.yr_a),
            ));
            entry.1.push(StereoKeypoint::new(
                r.feature_b,
                Point2::new(r.xl_b, r.yl_b),
                Point2::new(r.xr_b, r.yr_b),
            ));
        }
        Ok(inliers)
    }

    pub fn insert(&mut self, frame_a: FrameId, frame_b: FrameId, matches: FrameMatches) {
        self.poses.insert((frame_a, frame_b), matches.relative_pose);
        self.inliers
            .insert((frame_a, frame_b), (matches.inliers_a, matches.inliers_b));
    }

    /// 记录中最大的帧号
    pub fn last_frame(&self) -> Option<FrameId> {
        self.poses.keys().map(|&(_, frame_b)| frame_b).max()
    }
}

impl Frontend for RecordedFrontend {
    fn relative_pose_and_inliers(
        &self,
        frame_a: FrameId,
        frame_b: FrameId,
    ) -> Result<FrameMatches, FrontendFailure> {
        let relative_pose = *self
            .poses
            .get(&(frame_a, frame_b))
            .ok_or(FrontendFailure::NotAvailable { frame_a, frame_b })?;
        let (inliers_a, inliers_b) = self
            .inliers
            .get(&(frame_a, frame_b))
            .cloned()
            .unwrap_or_default();
        if inliers_a.len() < self.min_inliers {
            return Err(FrontendFailure::TooFewInliers {
                found: inliers_a.len(),
                required: self.min_inliers,
            });
        }
        Ok(FrameMatches {
            relative_pose,
            inliers_a,
            inliers_b,
        })
    }
}
