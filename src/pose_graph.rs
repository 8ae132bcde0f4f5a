//! 关键帧位姿图
//!
//! 每个关键帧一个位姿变量，相邻关键帧之间一条相对位姿边，第一个关键帧固定。
//! 只有链式拓扑时，自洽的边不会改变顺序拼接的结果。

use nalgebra::{Isometry3, Matrix6};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    global_types::FrameId,
    optimizer::{BetweenFactor, FactorGraph, Key, Optimizer, Values},
};

/// 窗口没有给出优化结果的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    Underconstrained,
    Divergent,
    Singular,
    /// 边的协方差不正定，换成了默认协方差
    InvalidCovariance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeConfidence {
    Optimized,
    /// 用直接初值重试后成功
    Retried,
    /// 前端拼接的位姿和默认协方差
    Fallback(FallbackReason),
}

impl EdgeConfidence {
    pub fn is_degraded(&self) -> bool {
        matches!(self, EdgeConfidence::Fallback(_))
    }
}

/// 相邻关键帧之间的边
#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    pub from: FrameId,
    pub to: FrameId,
    /// to 在 from 坐标系下的位姿
    pub relative_pose: Isometry3<f64>,
    pub covariance: Matrix6<f64>,
    pub confidence: EdgeConfidence,
}

/// 低置信度边的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedEdge {
    /// 边的序号，即窗口序号
    pub index: usize,
    pub from: FrameId,
    pub to: FrameId,
    pub reason: FallbackReason,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PoseGraphError {
    #[error("pose graph needs at least one keyframe")]
    NoKeyframes,
    #[error("default edge covariance is not positive definite")]
    InvalidDefaultCovariance,
    #[error("{keyframes} keyframes need {expected} edges, got {found}")]
    EdgeCount {
        keyframes: usize,
        expected: usize,
        found: usize,
    },
    #[error("edge {index} connects {from} -> {to}, expected {expected_from} -> {expected_to}")]
    BrokenChain {
        index: usize,
        from: FrameId,
        to: FrameId,
        expected_from: FrameId,
        expected_to: FrameId,
    },
}

#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    pub keyframes: Vec<FrameId>,
    pub poses: Vec<Isometry3<f64>>,
    /// 边缘协方差，信息矩阵奇异时为 None
    pub covariances: Option<Vec<Matrix6<f64>>>,
    pub initial_error: f64,
    pub final_error: f64,
    /// 优化失败时为 false，poses 为初值
    pub refined: bool,
    pub degraded_edges: Vec<DegradedEdge>,
}

pub struct PoseGraphBuilder {
    keyframes: Vec<FrameId>,
    graph: FactorGraph,
    initial: Values,
    degraded: Vec<DegradedEdge>,
}

impl PoseGraphBuilder {
    /// 边必须按顺序连接相邻关键帧
    pub fn new(
        keyframes: &[FrameId],
        edges: &[PoseGraphEdge],
        default_covariance: &Matrix6<f64>,
    ) -> Result<Self, PoseGraphError> {
        if keyframes.is_empty() {
            return Err(PoseGraphError::NoKeyframes);
        }
        if edges.len() + 1 != keyframes.len() {
            return Err(PoseGraphError::EdgeCount {
                keyframes: keyframes.len(),
                expected: keyframes.len() - 1,
                found: edges.len(),
            });
        }

        let mut graph = FactorGraph::new();
        let mut initial = Values::new();
        let mut degraded = Vec::new();
        let mut current = Isometry3::identity();
        initial.insert_pose(keyframes[0], current);
        for (index, (edge, pair)) in edges.iter().zip(keyframes.windows(2)).enumerate() {
            if edge.from != pair[0] || edge.to != pair[1] {
                return Err(PoseGraphError::BrokenChain {
                    index,
                    from: edge.from,
                    to: edge.to,
                    expected_from: pair[0],
                    expected_to: pair[1],
                });
            }
            let factor = match BetweenFactor::from_covariance(
                edge.from,
                edge.to,
                edge.relative_pose,
                &edge.covariance,
            ) {
                Ok(factor) => {
                    if let EdgeConfidence::Fallback(reason) = edge.confidence {
                        degraded.push(DegradedEdge {
                            index,
                            from: edge.from,
                            to: edge.to,
                            reason,
                        });
                    }
                    factor
                }
                Err(_) => {
                    log::warn!(
                        "edge {} -> {}: covariance not positive definite, using default",
                        edge.from,
                        edge.to
                    );
                    degraded.push(DegradedEdge {
                        index,
                        from: edge.from,
                        to: edge.to,
                        reason: FallbackReason::InvalidCovariance,
                    });
                    BetweenFactor::from_covariance(
                        edge.from,
                        edge.to,
                        edge.relative_pose,
                        default_covariance,
                    )
                    .map_err(|_| PoseGraphError::InvalidDefaultCovariance)?
                }
            };
            graph.add(factor);
            current *= edge.relative_pose;
            initial.insert_pose(edge.to, current);
        }
        graph.fix(Key::Pose(keyframes[0]));
        Ok(Self {
            keyframes: keyframes.to_vec(),
            graph,
            initial,
            degraded,
        })
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    pub fn initial_values(&self) -> &Values {
        &self.initial
    }

    pub fn degraded_edges(&self) -> &[DegradedEdge] {
        &self.degraded
    }

    fn poses_of(&self, values: &Values) -> Vec<Isometry3<f64>> {
        self.keyframes
            .iter()
            .map(|&k| values.pose(k).copied().unwrap_or_else(Isometry3::identity))
            .collect()
    }

    /// 全局优化，失败时返回初值
    pub fn optimize<O: Optimizer + ?Sized>(&self, optimizer: &O) -> PoseGraphResult {
        let mut result = PoseGraphResult {
            keyframes: self.keyframes.clone(),
            poses: self.poses_of(&self.initial),
            covariances: None,
            initial_error: 0.0,
            final_error: 0.0,
            refined: false,
            degraded_edges: self.degraded.clone(),
        };
        if self.graph.is_empty() {
            result.covariances = Some(vec![Matrix6::zeros()]);
            return result;
        }

        let solution = match optimizer.optimize(&self.graph, &self.initial) {
            Ok(solution) => solution,
            Err(e) => {
                log::warn!("pose graph optimization failed: {}, keeping initial poses", e);
                let error = self.graph.error(&self.initial).unwrap_or(f64::INFINITY);
                result.initial_error = error;
                result.final_error = error;
                return result;
            }
        };
        result.poses = self.poses_of(&solution.values);
        result.initial_error = solution.initial_error;
        result.final_error = solution.final_error;
        result.refined = true;
        result.covariances = optimizer
            .marginals(&self.graph, &solution.values)
            .and_then(|marginals| {
                self.keyframes
                    .iter()
                    .map(|&k| marginals.pose_covariance(k))
                    .collect::<Result<Vec<_>, _>>()
            })
            .map_err(|e| log::warn!("pose graph covariances unavailable: {}", e))
            .ok();
        log::info!(
            "pose graph: {} keyframes, error {:.6} -> {:.6}, {} degraded edges",
            self.keyframes.len(),
            result.initial_error,
            result.final_error,
            self.degraded.len()
        );
        result
    }
}
