use std::collections::BTreeSet;

use nalgebra::{Isometry3, Matrix6, Point3};
use thiserror::Error;

use crate::{
    camera::StereoCamera,
    global_types::{FrameId, TrackId},
    optimizer::{FactorGraph, Key, Optimizer, OptimizerError, Solution, StereoFactor, Values},
    track_store::{TrackError, TrackStore},
};

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("window [{c0}, {ck}] has no landmark observed twice")]
    Underconstrained { c0: FrameId, ck: FrameId },
    #[error("window [{c0}, {ck}] did not converge")]
    Divergent {
        c0: FrameId,
        ck: FrameId,
        #[source]
        source: OptimizerError,
    },
    #[error("window [{c0}, {ck}] information matrix is singular")]
    Singular { c0: FrameId, ck: FrameId },
    #[error("window needs {expected} seed poses, got {found}")]
    InvalidSeeds { expected: usize, found: usize },
    #[error("window [{c0}, {ck}] has not been optimized")]
    NotOptimized { c0: FrameId, ck: FrameId },
    #[error(transparent)]
    CorrespondenceGap(#[from] TrackError),
}

/// 窗口优化需要的不可变参数
#[derive(Debug, Clone, Copy)]
pub struct WindowContext {
    pub camera: StereoCamera,
    /// 像素噪声标准差
    pub pixel_sigma: f64,
}

/// 一个窗口的输出
#[derive(Debug, Clone)]
pub struct WindowOutput {
    pub c0: FrameId,
    pub ck: FrameId,
    /// ck 在 c0 坐标系下的位姿
    pub relative_pose: Isometry3<f64>,
    /// ck 以 c0 为条件的协方差
    pub covariance: Matrix6<f64>,
    /// c0 坐标系下的路标点
    pub landmarks: Vec<(TrackId, Point3<f64>)>,
    pub initial_error: f64,
    pub final_error: f64,
    pub iterations: usize,
}

/// 关键帧 c0 到 ck 之间的局部光束法平差
///
/// c0 固定为局部原点，每条在窗口内至少有两次观测的轨迹对应一个路标点。
pub struct BundleWindow<'a> {
    c0: FrameId,
    ck: FrameId,
    store: &'a TrackStore,
    context: WindowContext,
    /// seeds[i] 是 c0 + i 相对 c0 的初值
    seeds: Vec<Isometry3<f64>>,
    graph: FactorGraph,
    initial: Values,
    landmarks: Vec<TrackId>,
    built: bool,
    solution: Option<Solution>,
}

impl<'a> BundleWindow<'a> {
    pub fn new(
        c0: FrameId,
        ck: FrameId,
        store: &'a TrackStore,
        seeds: Vec<Isometry3<f64>>,
        context: WindowContext,
    ) -> Result<Self, WindowError> {
        let expected = (ck.max(c0) - c0 + 1) as usize;
        if ck < c0 || seeds.len() != expected {
            return Err(WindowError::InvalidSeeds {
                expected,
                found: seeds.len(),
            });
        }
        Ok(Self {
            c0,
            ck,
            store,
            context,
            seeds,
            graph: FactorGraph::new(),
            initial: Values::new(),
            landmarks: Vec::new(),
            built: false,
            solution: None,
        })
    }

    fn seed(&self, frame_id: FrameId) -> &Isometry3<f64> {
        &self.seeds[(frame_id - self.c0) as usize]
    }

    /// 构建因子图和初值，返回因子数量
    pub fn build_graph(&mut self) -> Result<usize, WindowError> {
        let (c0, ck) = (self.c0, self.ck);
        self.graph = FactorGraph::new();
        self.initial = Values::new();
        self.landmarks.clear();
        self.solution = None;

        let mut candidates = BTreeSet::new();
        for frame_id in c0..=ck {
            candidates.extend(self.store.tracks_at_frame(frame_id).iter().copied());
        }

        let camera = self.context.camera;
        let mut constrained = BTreeSet::new();
        let mut single = 0usize;
        let mut no_depth = 0usize;
        for track_id in candidates {
            let track = self
                .store
                .track(track_id)
                .ok_or(TrackError::CorrespondenceGap {
                    track_id,
                    frame_id: c0,
                })?;
            let frames = track.frames_within(c0, ck);
            let last = match frames {
                [_, .., last] => *last,
                _ => {
                    single += 1;
                    continue;
                }
            };
            // 用窗口内最后一次观测反投影初始化
            let observation = self.store.require_observation(track_id, last)?;
            let point = match camera.back_project_world(self.seed(last), &observation) {
                Some(point) => point,
                None => {
                    no_depth += 1;
                    continue;
                }
            };
            self.initial.insert_point(track_id, point);
            for &frame_id in frames {
                let measured = self.store.require_observation(track_id, frame_id)?;
                self.graph.add(StereoFactor::new(
                    frame_id,
                    track_id,
                    measured,
                    camera,
                    self.context.pixel_sigma,
                ));
                constrained.insert(frame_id);
            }
            self.landmarks.push(track_id);
        }
        log::debug!(
            "window [{}, {}]: {} landmarks, {} single observation, {} without depth",
            c0,
            ck,
            self.landmarks.len(),
            single,
            no_depth
        );

        if self.landmarks.is_empty() || !constrained.contains(&c0) || !constrained.contains(&ck) {
            return Err(WindowError::Underconstrained { c0, ck });
        }
        for &frame_id in &constrained {
            self.initial.insert_pose(frame_id, *self.seed(frame_id));
        }
        self.graph.fix(Key::Pose(c0));
        self.built = true;
        Ok(self.graph.len())
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    pub fn initial_values(&self) -> &Values {
        &self.initial
    }

    pub fn landmark_ids(&self) -> &[TrackId] {
        &self.landmarks
    }

    fn optimizer_error(&self, error: OptimizerError) -> WindowError {
        let (c0, ck) = (self.c0, self.ck);
        match error {
            OptimizerError::Singular => WindowError::Singular { c0, ck },
            source => WindowError::Divergent { c0, ck, source },
        }
    }

    fn solution(&self) -> Result<&Solution, WindowError> {
        self.solution.as_ref().ok_or(WindowError::NotOptimized {
            c0: self.c0,
            ck: self.ck,
        })
    }

    pub fn optimize<O: Optimizer + ?Sized>(&mut self, optimizer: &O) -> Result<&Solution, WindowError> {
        if !self.built {
            self.build_graph()?;
        }
        let solution = optimizer
            .optimize(&self.graph, &self.initial)
            .map_err(|e| self.optimizer_error(e))?;
        Ok(self.solution.insert(solution))
    }

    /// 初值或优化结果处的总误差
    pub fn factor_error(&self, use_initial: bool) -> Result<f64, WindowError> {
        let values = if use_initial {
            &self.initial
        } else {
            &self.solution()?.values
        };
        self.graph
            .error(values)
            .map_err(|e| self.optimizer_error(e))
    }

    fn pose(&self, frame_id: FrameId) -> Result<Isometry3<f64>, WindowError> {
        let solution = self.solution()?;
        solution
            .values
            .pose(frame_id)
            .copied()
            .ok_or_else(|| self.optimizer_error(OptimizerError::MissingValue(Key::Pose(frame_id))))
    }

    /// pose(c0)^-1 * pose(ck)
    pub fn relative_pose(&self) -> Result<Isometry3<f64>, WindowError> {
        Ok(self.pose(self.c0)?.inverse() * self.pose(self.ck)?)
    }

    /// ck 以 c0 为条件的 6x6 协方差
    pub fn relative_covariance<O: Optimizer + ?Sized>(
        &self,
        optimizer: &O,
    ) -> Result<Matrix6<f64>, WindowError> {
        let solution = self.solution()?;
        let covariance = optimizer
            .marginals(&self.graph, &solution.values)
            .and_then(|marginals| {
                marginals.conditional_covariance(Key::Pose(self.ck), Key::Pose(self.c0))
            })
            .map_err(|e| self.optimizer_error(e))?;
        Ok(Matrix6::from_fn(|r, c| covariance[(r, c)]))
    }

    /// 优化后的路标点，c0 坐标系
    pub fn landmarks(&self) -> Result<Vec<(TrackId, Point3<f64>)>, WindowError> {
        let origin = self.pose(self.c0)?.inverse();
        let solution = self.solution()?;
        Ok(self
            .landmarks
            .iter()
            .filter_map(|&id| {
                solution
                    .values
                    .point(id)
                    .map(|point| (id, origin.transform_point(point)))
            })
            .collect())
    }

    /// 构建、优化并提取结果，窗口随后丢弃
    pub fn solve<O: Optimizer + ?Sized>(mut self, optimizer: &O) -> Result<WindowOutput, WindowError> {
        self.optimize(optimizer)?;
        let solution = self.solution()?;
        let (initial_error, final_error, iterations) =
            (solution.initial_error, solution.final_error, solution.iterations);
        let output = WindowOutput {
            c0: self.c0,
            ck: self.ck,
            relative_pose: self.relative_pose()?,
            covariance: self.relative_covariance(optimizer)?,
            landmarks: self.landmarks()?,
            initial_error,
            final_error,
            iterations,
        };
        log::info!(
            "window [{}, {}]: {} landmarks, error {:.3} -> {:.3} in {} iterations",
            output.c0,
            output.ck,
            output.landmarks.len(),
            initial_error,
            final_error,
            iterations
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimizer::LevenbergMarquardt,
        synthetic::SyntheticWorld,
        utility::Utility,
    };
    use approx::assert_relative_eq;
    use nalgebra::{Point2, Vector6};

    #[test]
    fn test_single_landmark_three_frames() {
        let world = SyntheticWorld::with_landmarks(3, vec![Point3::new(0.8, -0.3, 12.0)]);
        let (store, _) = world.ingest();
        assert_eq!(store.num_tracks(), 1);
        assert_eq!(store.track(0).unwrap().frame_ids(), &[0, 1, 2]);

        let seeds = world.relative_chain(0, 2);
        let mut window = BundleWindow::new(0, 2, &store, seeds, world.context()).unwrap();
        assert_eq!(window.build_graph().unwrap(), 3);
        let lm = LevenbergMarquardt::default();
        window.optimize(&lm).unwrap();
        assert!(window.factor_error(false).unwrap() < 1e-6);
        assert_relative_eq!(
            window.relative_pose().unwrap(),
            world.relative(0, 2),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_perturbed_seeds_converge() {
        let world = SyntheticWorld::new(6);
        let (store, _) = world.ingest();
        let seeds: Vec<_> = world
            .relative_chain(1, 5)
            .into_iter()
            .enumerate()
            .map(|(i, pose)| {
                if i == 0 {
                    pose
                } else {
                    let k = i as f64;
                    pose * Utility::se3_exp(&Vector6::new(
                        0.004 * k,
                        -0.003,
                        0.002 * k,
                        0.05,
                        -0.04 * k,
                        0.1,
                    ))
                }
            })
            .collect();
        let mut window = BundleWindow::new(1, 5, &store, seeds, world.context()).unwrap();
        window.build_graph().unwrap();
        assert_eq!(window.landmark_ids().len(), world.landmarks.len());
        let lm = LevenbergMarquardt::default();
        window.optimize(&lm).unwrap();
        let initial = window.factor_error(true).unwrap();
        let fin = window.factor_error(false).unwrap();
        assert!(initial > 1.0 && fin < 1e-6, "{} -> {}", initial, fin);
        assert_relative_eq!(
            window.relative_pose().unwrap(),
            world.relative(1, 5),
            epsilon = 1e-5
        );

        let covariance = window.relative_covariance(&lm).unwrap();
        assert_relative_eq!(covariance, covariance.transpose(), epsilon = 1e-12);
        for i in 0..6 {
            assert!(covariance[(i, i)] > 0.0);
        }
        assert!(covariance.cholesky().is_some());

        let landmarks = window.landmarks().unwrap();
        let origin = world.poses[1].inverse();
        for (id, point) in landmarks {
            let expected = origin.transform_point(&world.landmarks[id as usize]);
            assert_relative_eq!(point, expected, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_single_observation_tracks_underconstrained() {
        let kp = |id: u64, x: f64| {
            crate::global_types::StereoKeypoint::new(id, Point2::new(x, 50.0), Point2::new(x - 8.0, 50.0))
        };
        let mut store = TrackStore::new();
        // 轨迹 [0,1] 和 [2,3]，窗口 [1,2] 内每条轨迹只有一次观测
        store.extend(1, &[kp(1, 100.0)], &[kp(2, 101.0)]).unwrap();
        store.extend(3, &[kp(3, 200.0)], &[kp(4, 201.0)]).unwrap();
        let seeds = vec![Isometry3::identity(); 2];
        let world = SyntheticWorld::new(2);
        let mut window = BundleWindow::new(1, 2, &store, seeds, world.context()).unwrap();
        assert!(matches!(
            window.build_graph(),
            Err(WindowError::Underconstrained { c0: 1, ck: 2 })
        ));
        assert!(window.landmark_ids().is_empty());
        assert!(matches!(
            window.relative_pose(),
            Err(WindowError::NotOptimized { .. })
        ));
        let lm = LevenbergMarquardt::default();
        assert!(matches!(
            window.optimize(&lm),
            Err(WindowError::Underconstrained { .. })
        ));
    }

    #[test]
    fn test_seed_count_checked() {
        let store = TrackStore::new();
        let world = SyntheticWorld::new(2);
        assert!(matches!(
            BundleWindow::new(0, 3, &store, vec![Isometry3::identity(); 2], world.context()),
            Err(WindowError::InvalidSeeds {
                expected: 4,
                found: 2
            })
        ));
    }
}
