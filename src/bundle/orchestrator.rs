use nalgebra::{Isometry3, Matrix6, Point3};
use serde::Serialize;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::{
    keyframes::{
        choose_keyframes, KeyframeBounds, KeyframeEvidence, KeyframePolicy,
        KeyframeSelectionError,
    },
    window::{BundleWindow, WindowContext, WindowError, WindowOutput},
};
use crate::{
    config::{FallbackCovariance, MULTIPLE_THREAD},
    frontend::{Frontend, OdometrySeeds},
    global_types::{FrameId, TrackId},
    optimizer::Optimizer,
    pose_graph::{DegradedEdge, EdgeConfidence, FallbackReason, PoseGraphEdge},
    track_store::{TrackError, TrackStore},
    utility::Utility,
};

/// 全局坐标系下的路标点
#[derive(Debug, Clone, Serialize)]
pub struct GlobalLandmark {
    pub track_id: TrackId,
    /// 所属窗口序号
    pub window: usize,
    pub position: Point3<f64>,
}

/// 单个窗口的求解记录
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub index: usize,
    pub c0: FrameId,
    pub ck: FrameId,
    pub landmarks: usize,
    pub initial_error: Option<f64>,
    pub final_error: Option<f64>,
    pub iterations: Option<usize>,
    pub confidence: EdgeConfidence,
}

#[derive(Debug, Clone)]
pub struct BundleAdjustmentResult {
    pub keyframes: Vec<FrameId>,
    /// 每个关键帧的全局位姿，第一个为单位阵
    pub trajectory: Vec<Isometry3<f64>>,
    pub landmarks: Vec<GlobalLandmark>,
    /// edges[i] 连接 keyframes[i] 和 keyframes[i + 1]
    pub edges: Vec<PoseGraphEdge>,
    pub windows: Vec<WindowReport>,
}

impl BundleAdjustmentResult {
    pub fn degraded_edges(&self) -> Vec<DegradedEdge> {
        self.edges
            .iter()
            .enumerate()
            .filter_map(|(index, edge)| match edge.confidence {
                EdgeConfidence::Fallback(reason) => Some(DegradedEdge {
                    index,
                    from: edge.from,
                    to: edge.to,
                    reason,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn degraded_count(&self) -> usize {
        self.edges
            .iter()
            .filter(|edge| edge.confidence.is_degraded())
            .count()
    }
}

/// 两组初值差别小于该值时视为相同
const SEED_TOLERANCE: f64 = 1e-9;

fn same_seeds(a: &[Isometry3<f64>], b: &[Isometry3<f64>]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(pa, pb)| {
            let (translation, rotation) = Utility::pose_distance(pa, pb);
            translation < SEED_TOLERANCE && rotation < SEED_TOLERANCE
        })
}

enum WindowOutcome {
    Solved { output: WindowOutput, retried: bool },
    Failed { c0: FrameId, ck: FrameId, reason: FallbackReason },
}

/// 关键帧选取、逐窗口优化和全局拼接
pub struct BundleAdjustment<'a, O> {
    store: &'a TrackStore,
    seeds: &'a OdometrySeeds,
    frontend: Option<&'a (dyn Frontend + Sync)>,
    context: WindowContext,
    optimizer: O,
    fallback_covariance: Matrix6<f64>,
    multiple_thread: bool,
    keyframes: Vec<FrameId>,
}

impl<'a, O: Optimizer + Sync> BundleAdjustment<'a, O> {
    pub fn new(
        store: &'a TrackStore,
        seeds: &'a OdometrySeeds,
        context: WindowContext,
        optimizer: O,
    ) -> Self {
        Self {
            store,
            seeds,
            frontend: None,
            context,
            optimizer,
            fallback_covariance: FallbackCovariance::default().matrix(),
            multiple_thread: MULTIPLE_THREAD,
            keyframes: Vec::new(),
        }
    }

    /// 发散窗口重试时用前端直接估计初值
    pub fn with_frontend(mut self, frontend: &'a (dyn Frontend + Sync)) -> Self {
        self.frontend = Some(frontend);
        self
    }

    pub fn with_fallback_covariance(mut self, covariance: Matrix6<f64>) -> Self {
        self.fallback_covariance = covariance;
        self
    }

    pub fn with_multiple_thread(mut self, multiple_thread: bool) -> Self {
        self.multiple_thread = multiple_thread;
        self
    }

    pub fn keyframes(&self) -> &[FrameId] {
        &self.keyframes
    }

    /// 在 [first_frame, last_frame] 上选取关键帧
    pub fn choose_keyframes(
        &mut self,
        policy: &KeyframePolicy,
        bounds: KeyframeBounds,
    ) -> Result<&[FrameId], KeyframeSelectionError> {
        policy.validate()?;
        let evidence = KeyframeEvidence {
            store: self.store,
            seeds: self.seeds,
        };
        let rule = policy.rule();
        self.keyframes = choose_keyframes(
            rule.as_ref(),
            bounds,
            self.seeds.first_frame(),
            self.seeds.last_frame(),
            &evidence,
        )?;
        log::info!(
            "{} keyframes between frame {} and {}",
            self.keyframes.len(),
            self.seeds.first_frame(),
            self.seeds.last_frame()
        );
        Ok(&self.keyframes)
    }

    fn try_window(
        &self,
        c0: FrameId,
        ck: FrameId,
        seeds: Vec<Isometry3<f64>>,
    ) -> Result<WindowOutput, WindowError> {
        BundleWindow::new(c0, ck, self.store, seeds, self.context)?.solve(&self.optimizer)
    }

    /// 每帧相对 c0 的直接估计，前端没有结果时用拼接的初值
    fn direct_seeds(
        &self,
        frontend: &dyn Frontend,
        c0: FrameId,
        chained: &[Isometry3<f64>],
    ) -> Vec<Isometry3<f64>> {
        chained
            .iter()
            .enumerate()
            .map(|(i, seed)| {
                let frame_id = c0 + i as FrameId;
                if i == 0 {
                    return *seed;
                }
                match frontend.relative_pose_and_inliers(c0, frame_id) {
                    Ok(matches) => matches.relative_pose,
                    Err(failure) => {
                        log::debug!("no direct seed {} -> {}: {}", c0, frame_id, failure);
                        *seed
                    }
                }
            })
            .collect()
    }

    fn fallback_reason(error: &WindowError) -> FallbackReason {
        match error {
            WindowError::Underconstrained { .. } => FallbackReason::Underconstrained,
            WindowError::Singular { .. } => FallbackReason::Singular,
            _ => FallbackReason::Divergent,
        }
    }

    /// 只有轨迹库损坏才返回错误
    fn solve_window(&self, c0: FrameId, ck: FrameId) -> Result<WindowOutcome, TrackError> {
        let chained = self.seeds.chain(c0, ck);
        let error = match self.try_window(c0, ck, chained.clone()) {
            Ok(output) => {
                return Ok(WindowOutcome::Solved {
                    output,
                    retried: false,
                })
            }
            Err(WindowError::CorrespondenceGap(e)) => return Err(e),
            Err(error) => error,
        };

        let error = match self.frontend {
            Some(frontend) if matches!(error, WindowError::Divergent { .. }) => {
                let direct = self.direct_seeds(frontend, c0, &chained);
                if same_seeds(&direct, &chained) {
                    log::warn!("{}, no direct seeds differ from the chain, retry skipped", error);
                    return Ok(self.fallback(c0, ck, &error));
                }
                log::warn!("{}, retrying with direct seeds", error);
                match self.try_window(c0, ck, direct) {
                    Ok(output) => {
                        return Ok(WindowOutcome::Solved {
                            output,
                            retried: true,
                        })
                    }
                    Err(WindowError::CorrespondenceGap(e)) => return Err(e),
                    Err(retry_error) => retry_error,
                }
            }
            _ => error,
        };

        Ok(self.fallback(c0, ck, &error))
    }

    fn fallback(&self, c0: FrameId, ck: FrameId, error: &WindowError) -> WindowOutcome {
        log::warn!(
            "window [{}, {}] falls back to frontend odometry: {}",
            c0,
            ck,
            error
        );
        WindowOutcome::Failed {
            c0,
            ck,
            reason: Self::fallback_reason(error),
        }
    }

    fn solve_windows(
        &self,
        spans: &[(FrameId, FrameId)],
    ) -> Vec<Result<WindowOutcome, TrackError>> {
        if self.multiple_thread {
            #[cfg(feature = "parallel")]
            return spans
                .par_iter()
                .map(|&(c0, ck)| self.solve_window(c0, ck))
                .collect();
        }
        spans
            .iter()
            .map(|&(c0, ck)| self.solve_window(c0, ck))
            .collect()
    }

    /// 逐窗口优化并按顺序拼接
    pub fn solve_sequential(&self) -> Result<BundleAdjustmentResult, TrackError> {
        let spans: Vec<(FrameId, FrameId)> =
            self.keyframes.windows(2).map(|w| (w[0], w[1])).collect();
        if spans.is_empty() {
            log::warn!("fewer than two keyframes, nothing to solve");
        }
        let outcomes = self.solve_windows(&spans);

        let mut result = BundleAdjustmentResult {
            keyframes: self.keyframes.clone(),
            trajectory: if self.keyframes.is_empty() {
                Vec::new()
            } else {
                vec![Isometry3::identity()]
            },
            landmarks: Vec::new(),
            edges: Vec::with_capacity(spans.len()),
            windows: Vec::with_capacity(spans.len()),
        };
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let origin = result.trajectory[index];
            let (edge, report) = match outcome? {
                WindowOutcome::Solved { output, retried } => {
                    result
                        .landmarks
                        .extend(output.landmarks.iter().map(|(track_id, point)| GlobalLandmark {
                            track_id: *track_id,
                            window: index,
                            position: origin.transform_point(point),
                        }));
                    let confidence = if retried {
                        EdgeConfidence::Retried
                    } else {
                        EdgeConfidence::Optimized
                    };
                    let report = WindowReport {
                        index,
                        c0: output.c0,
                        ck: output.ck,
                        landmarks: output.landmarks.len(),
                        initial_error: Some(output.initial_error),
                        final_error: Some(output.final_error),
                        iterations: Some(output.iterations),
                        confidence,
                    };
                    let edge = PoseGraphEdge {
                        from: output.c0,
                        to: output.ck,
                        relative_pose: output.relative_pose,
                        covariance: output.covariance,
                        confidence,
                    };
                    (edge, report)
                }
                WindowOutcome::Failed { c0, ck, reason } => {
                    let confidence = EdgeConfidence::Fallback(reason);
                    let report = WindowReport {
                        index,
                        c0,
                        ck,
                        landmarks: 0,
                        initial_error: None,
                        final_error: None,
                        iterations: None,
                        confidence,
                    };
                    let edge = PoseGraphEdge {
                        from: c0,
                        to: ck,
                        relative_pose: self.seeds.compose(c0, ck),
                        covariance: self.fallback_covariance,
                        confidence,
                    };
                    (edge, report)
                }
            };
            result.trajectory.push(origin * edge.relative_pose);
            result.edges.push(edge);
            result.windows.push(report);
        }

        let degraded = result.degraded_count();
        if degraded > 0 {
            log::warn!("{} of {} edges are low confidence", degraded, result.edges.len());
        }
        log::info!(
            "bundle adjustment: {} windows, {} landmarks",
            result.edges.len(),
            result.landmarks.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frontend::{ingest_sequence, RecordedFrontend},
        optimizer::{FactorGraph, LevenbergMarquardt, Marginals, OptimizerError, Solution, Values},
        synthetic::SyntheticWorld,
    };
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_composition_law() {
        let world = SyntheticWorld::new(13);
        let (store, seeds) = world.ingest();
        let mut ba = BundleAdjustment::new(&store, &seeds, world.context(), LevenbergMarquardt::default());
        let keyframes = ba
            .choose_keyframes(&KeyframePolicy::FixedSpan { span: 4 }, KeyframeBounds::new(3, 6))
            .unwrap()
            .to_vec();
        assert_eq!(keyframes, vec![0, 4, 8, 12]);

        let result = ba.solve_sequential().unwrap();
        assert_eq!(result.trajectory.len(), 4);
        assert_eq!(result.degraded_count(), 0);
        assert_relative_eq!(result.trajectory[0], Isometry3::identity());
        for (i, edge) in result.edges.iter().enumerate() {
            assert_eq!(edge.confidence, EdgeConfidence::Optimized);
            assert_relative_eq!(
                result.trajectory[i + 1],
                result.trajectory[i] * edge.relative_pose,
                epsilon = 1e-9
            );
            assert_relative_eq!(
                result.trajectory[i + 1],
                world.poses[keyframes[i + 1] as usize],
                epsilon = 1e-5
            );
        }
        // 每个窗口都有全部路标
        assert_eq!(result.landmarks.len(), 3 * world.landmarks.len());
        for landmark in &result.landmarks {
            assert_relative_eq!(
                landmark.position,
                world.landmarks[landmark.track_id as usize],
                epsilon = 1e-3
            );
        }
    }

    #[test]
    fn test_sequential_equals_parallel() {
        let world = SyntheticWorld::new(9);
        let (store, seeds) = world.ingest();
        let solve = |multiple_thread| {
            let mut ba = BundleAdjustment::new(&store, &seeds, world.context(), LevenbergMarquardt::default())
                .with_multiple_thread(multiple_thread);
            ba.choose_keyframes(&KeyframePolicy::FixedSpan { span: 4 }, KeyframeBounds::new(2, 4))
                .unwrap();
            ba.solve_sequential().unwrap()
        };
        let a = solve(true);
        let b = solve(false);
        assert_eq!(a.keyframes, b.keyframes);
        for (pa, pb) in a.trajectory.iter().zip(&b.trajectory) {
            assert_relative_eq!(*pa, *pb, epsilon = 1e-12);
        }
    }

    /// 前 n 次调用返回发散，之后交给 LM
    struct DivergingOptimizer {
        failures: usize,
        calls: AtomicUsize,
        inner: LevenbergMarquardt,
    }

    impl DivergingOptimizer {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                inner: LevenbergMarquardt::default(),
            }
        }
    }

    impl Optimizer for DivergingOptimizer {
        fn optimize(&self, graph: &FactorGraph, initial: &Values) -> Result<Solution, OptimizerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(OptimizerError::Diverged {
                    iterations: 100,
                    error: 1e6,
                });
            }
            self.inner.optimize(graph, initial)
        }

        fn marginals(&self, graph: &FactorGraph, values: &Values) -> Result<Marginals, OptimizerError> {
            self.inner.marginals(graph, values)
        }
    }

    #[test]
    fn test_divergent_window_retried_with_direct_seeds() {
        let world = SyntheticWorld::new(5);
        let frontend = world.frontend();
        // 建库用的相邻帧位姿带漂移，直接初值是真值
        let drift = Isometry3::new(Vector3::new(0.02, 0.0, 0.01), Vector3::new(0.0, 0.005, 0.0));
        let (store, seeds) = world.ingest_from(&world.odometry_frontend(drift));
        let mut ba = BundleAdjustment::new(&store, &seeds, world.context(), DivergingOptimizer::new(1))
            .with_frontend(&frontend)
            .with_multiple_thread(false);
        ba.choose_keyframes(&KeyframePolicy::FixedSpan { span: 4 }, KeyframeBounds::new(2, 4))
            .unwrap();

        let chained = seeds.chain(0, 4);
        let direct = ba.direct_seeds(&frontend, 0, &chained);
        assert!(!same_seeds(&direct, &chained));
        assert!(Utility::pose_distance(&direct[4], &chained[4]).0 > 0.05);
        assert_relative_eq!(direct[4], world.relative(0, 4), epsilon = 1e-12);

        let result = ba.solve_sequential().unwrap();
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].confidence, EdgeConfidence::Retried);
        assert_eq!(ba.optimizer.calls.load(Ordering::SeqCst), 2);
        assert_relative_eq!(result.trajectory[1], world.poses[4], epsilon = 1e-5);
    }

    #[test]
    fn test_retry_skipped_without_direct_seeds() {
        let world = SyntheticWorld::new(5);
        // 只有相邻帧对，直接初值和拼接初值相同
        let frontend = world.odometry_frontend(Isometry3::identity());
        let (store, seeds) = world.ingest_from(&frontend);
        let mut ba = BundleAdjustment::new(&store, &seeds, world.context(), DivergingOptimizer::new(1))
            .with_frontend(&frontend)
            .with_multiple_thread(false);
        ba.choose_keyframes(&KeyframePolicy::FixedSpan { span: 4 }, KeyframeBounds::new(2, 4))
            .unwrap();
        let result = ba.solve_sequential().unwrap();
        assert_eq!(
            result.edges[0].confidence,
            EdgeConfidence::Fallback(FallbackReason::Divergent)
        );
        assert_eq!(ba.optimizer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_window_falls_back_to_odometry() {
        let world = SyntheticWorld::new(9);
        let frontend = world.frontend();
        let (store, seeds) = world.ingest();
        let fallback = Matrix6::identity() * 4.0;
        let mut ba = BundleAdjustment::new(&store, &seeds, world.context(), DivergingOptimizer::new(2))
            .with_frontend(&frontend)
            .with_fallback_covariance(fallback)
            .with_multiple_thread(false);
        ba.choose_keyframes(&KeyframePolicy::FixedSpan { span: 4 }, KeyframeBounds::new(2, 4))
            .unwrap();
        let result = ba.solve_sequential().unwrap();
        assert_eq!(result.keyframes, vec![0, 4, 8]);
        assert_eq!(
            result.degraded_edges(),
            vec![DegradedEdge {
                index: 0,
                from: 0,
                to: 4,
                reason: FallbackReason::Divergent
            }]
        );
        assert_eq!(result.edges[0].covariance, fallback);
        assert_relative_eq!(result.edges[0].relative_pose, seeds.compose(0, 4), epsilon = 1e-12);
        assert_eq!(result.edges[1].confidence, EdgeConfidence::Optimized);
        assert!(result.landmarks.iter().all(|l| l.window == 1));
        assert!(result.windows[0].final_error.is_none());
        // 拼接仍然连续
        assert_relative_eq!(
            result.trajectory[2],
            result.trajectory[1] * result.edges[1].relative_pose,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_frontend_gap_gives_underconstrained_edge() {
        // 帧 3 -> 4 前端失败，帧 4 之后全是新轨迹
        let world = SyntheticWorld::new(9);
        let mut frontend = RecordedFrontend::new(1);
        for f in 1..=8 {
            if f != 4 {
                frontend.insert(f - 1, f, world.matches(f - 1, f));
            }
        }
        let mut store = TrackStore::new();
        let (seeds, report) = ingest_sequence(&frontend, &mut store, 0, 8).unwrap();
        assert_eq!(report.failed, 1);
        let mut ba = BundleAdjustment::new(&store, &seeds, world.context(), LevenbergMarquardt::default())
            .with_frontend(&frontend)
            .with_multiple_thread(false);
        ba.choose_keyframes(&KeyframePolicy::FixedSpan { span: 3 }, KeyframeBounds::new(3, 5))
            .unwrap();
        assert_eq!(ba.keyframes(), &[0, 3, 8]);
        let result = ba.solve_sequential().unwrap();
        assert_eq!(result.edges[0].confidence, EdgeConfidence::Optimized);
        // 帧 3 在窗口 [3, 8] 中只有单次观测的轨迹
        assert_eq!(
            result.degraded_edges(),
            vec![DegradedEdge {
                index: 1,
                from: 3,
                to: 8,
                reason: FallbackReason::Underconstrained
            }]
        );
        assert_relative_eq!(result.edges[1].relative_pose, seeds.compose(3, 8), epsilon = 1e-12);
        assert_eq!(result.trajectory.len(), 3);
        assert!(result.landmarks.iter().all(|l| l.window == 0));
    }

    #[test]
    fn test_no_landmarks_window_is_underconstrained() {
        let world = SyntheticWorld::new(7);
        let mut frontend = RecordedFrontend::new(0);
        for f in 1..=6 {
            let matches = world.matches(f - 1, f);
            frontend.insert(
                f - 1,
                f,
                crate::frontend::FrameMatches {
                    relative_pose: matches.relative_pose,
                    inliers_a: Vec::new(),
                    inliers_b: Vec::new(),
                },
            );
        }
        let mut store = TrackStore::new();
        let (seeds, _) = ingest_sequence(&frontend, &mut store, 0, 6).unwrap();
        let mut ba = BundleAdjustment::new(&store, &seeds, world.context(), LevenbergMarquardt::default())
            .with_multiple_thread(false);
        ba.choose_keyframes(&KeyframePolicy::FixedSpan { span: 3 }, KeyframeBounds::new(3, 5))
            .unwrap();
        let result = ba.solve_sequential().unwrap();
        assert_eq!(result.degraded_count(), 2);
        assert!(result.landmarks.is_empty());
        for (i, edge) in result.edges.iter().enumerate() {
            assert_eq!(
                edge.confidence,
                EdgeConfidence::Fallback(FallbackReason::Underconstrained)
            );
            assert_relative_eq!(
                result.trajectory[i + 1],
                world.poses[result.keyframes[i + 1] as usize],
                epsilon = 1e-9
            );
        }
    }
}
