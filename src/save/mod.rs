//! 结果输出：KITTI 轨迹、路标点、运行摘要
mod pts;
mod trajectory;

pub use pts::{read_landmarks, write_landmarks, LandmarkPointSave};
pub use trajectory::{read_kitti, write_kitti};

use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::{
    bundle::{BundleAdjustmentResult, WindowReport},
    evaluation::TrajectoryError,
    frontend::IngestReport,
    global_types::FrameId,
    pose_graph::{DegradedEdge, PoseGraphResult},
    track_store::TrackStatistics,
};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoseGraphSummary {
    pub refined: bool,
    pub initial_error: f64,
    pub final_error: f64,
    pub has_covariances: bool,
}

impl From<&PoseGraphResult> for PoseGraphSummary {
    fn from(result: &PoseGraphResult) -> Self {
        Self {
            refined: result.refined,
            initial_error: result.initial_error,
            final_error: result.final_error,
            has_covariances: result.covariances.is_some(),
        }
    }
}

/// 与真值比较的关键帧误差
#[derive(Debug, Clone, Serialize)]
pub struct GroundTruthSummary {
    pub sequential: TrajectoryError,
    pub pose_graph: Option<TrajectoryError>,
}

/// 一次运行的摘要，json 格式
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ingest: IngestReport,
    pub tracks: TrackStatistics,
    /// 前端失败、用匀速模型补上的帧
    pub missing_frames: Vec<FrameId>,
    pub keyframes: Vec<FrameId>,
    pub windows: Vec<WindowReport>,
    pub degraded_edges: Vec<DegradedEdge>,
    pub pose_graph: Option<PoseGraphSummary>,
    pub ground_truth: Option<GroundTruthSummary>,
}

impl RunSummary {
    pub fn new(
        ingest: IngestReport,
        tracks: TrackStatistics,
        missing_frames: Vec<FrameId>,
        bundle: &BundleAdjustmentResult,
        pose_graph: Option<&PoseGraphResult>,
    ) -> Self {
        Self {
            ingest,
            tracks,
            missing_frames,
            keyframes: bundle.keyframes.clone(),
            windows: bundle.windows.clone(),
            degraded_edges: pose_graph
                .map(|result| result.degraded_edges.clone())
                .unwrap_or_else(|| bundle.degraded_edges()),
            pose_graph: pose_graph.map(PoseGraphSummary::from),
            ground_truth: None,
        }
    }

    pub fn with_ground_truth(mut self, ground_truth: GroundTruthSummary) -> Self {
        self.ground_truth = Some(ground_truth);
        self
    }

    pub fn write_to_json(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}
