//! 因子图的 Levenberg-Marquardt
//!
//! 因子图包装成 [`LeastSquaresProblem`]，参数是相对参考点的切空间增量：
//! 位姿 T = T_ref * Exp([w; v])，路标点 p = p_ref + d。
//! 雅可比取当前点的右扰动雅可比，每轮收敛后在解处重新取参考点再优化一次。

use std::cell::Cell;

use levenberg_marquardt::{
    LeastSquaresProblem, LevenbergMarquardt as Minimizer, MinimizationReport, TerminationReason,
};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};

use super::{
    linear::{self, Layout, NormalEquations},
    FactorGraph, Marginals, Optimizer, OptimizerError, Solution, Values,
};
use crate::config::SolverConfig;

/// 点在相机后方时每维残差取该值，使该步被拒绝
const BEHIND_CAMERA_RESIDUAL: f64 = 1e8;
/// 重新取参考点的最多轮数
const ANCHOR_ROUNDS: usize = 3;
/// 一轮的总增量小于该值时不再重新取参考点
const ANCHOR_STEP: f64 = 1e-9;

struct GraphProblem<'a> {
    graph: &'a FactorGraph,
    layout: &'a Layout,
    reference: Values,
    values: Values,
    delta: DVector<f64>,
    /// 雅可比求值次数
    jacobians: Cell<usize>,
    max_iterations: usize,
}

impl<'a> GraphProblem<'a> {
    fn new(
        graph: &'a FactorGraph,
        layout: &'a Layout,
        initial: &Values,
        max_iterations: usize,
    ) -> Self {
        Self {
            graph,
            layout,
            reference: initial.clone(),
            values: initial.clone(),
            delta: DVector::zeros(layout.dim()),
            jacobians: Cell::new(0),
            max_iterations,
        }
    }

    fn iterations(&self) -> usize {
        self.jacobians.get().min(self.max_iterations)
    }

    /// 以当前解为新的参考点
    fn reanchor(&mut self) {
        self.reference = self.values.clone();
        self.delta = DVector::zeros(self.layout.dim());
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for GraphProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, delta: &DVector<f64>) {
        self.delta.copy_from(delta);
        self.values = self.layout.retract(&self.reference, delta);
    }

    fn params(&self) -> DVector<f64> {
        self.delta.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let len: usize = self.graph.factors().iter().map(|f| f.dim()).sum();
        let mut residuals = DVector::zeros(len);
        let mut row = 0;
        for factor in self.graph.factors() {
            let dim = factor.dim();
            let mut rows = residuals.rows_mut(row, dim);
            match factor.residual(&self.values).ok()? {
                Some(residual) => rows.copy_from(&residual),
                None => rows.fill(BEHIND_CAMERA_RESIDUAL),
            }
            row += dim;
        }
        Some(residuals)
    }

    /// 超过迭代上限时返回 None，优化以 User 结束
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        self.jacobians.set(self.jacobians.get() + 1);
        if self.jacobians.get() > self.max_iterations {
            return None;
        }
        linear::jacobian(self.graph, &self.values, self.layout).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    pub config: SolverConfig,
}

impl LevenbergMarquardt {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    fn minimizer(&self) -> Minimizer<f64> {
        Minimizer::new()
            .with_ftol(self.config.ftol)
            .with_xtol(self.config.xtol)
            .with_gtol(self.config.gtol)
            .with_stepbound(self.config.stepbound)
            .with_patience(self.config.max_iterations)
    }

    fn check_termination(
        report: &MinimizationReport<f64>,
        problem: &GraphProblem,
    ) -> Result<(), OptimizerError> {
        if report.termination.was_successful() {
            return Ok(());
        }
        log::debug!(
            "levenberg-marquardt stopped: {:?} after {} evaluations",
            report.termination,
            report.number_of_evaluations
        );
        match report.termination {
            TerminationReason::Numerical(_) => Err(OptimizerError::Singular),
            _ => Err(OptimizerError::Diverged {
                iterations: problem.iterations(),
                error: problem
                    .graph
                    .error(&problem.values)
                    .unwrap_or(f64::INFINITY),
            }),
        }
    }
}

impl Optimizer for LevenbergMarquardt {
    fn optimize(&self, graph: &FactorGraph, initial: &Values) -> Result<Solution, OptimizerError> {
        if graph.is_empty() {
            return Err(OptimizerError::EmptyGraph);
        }
        let layout = Layout::new(graph, initial)?;
        let initial_error = graph.error(initial)?;
        if !initial_error.is_finite() {
            return Err(
                linear::behind_camera(graph, initial).unwrap_or(OptimizerError::Diverged {
                    iterations: 0,
                    error: initial_error,
                }),
            );
        }
        if initial_error <= self.config.absolute_tolerance || layout.dim() == 0 {
            return Ok(Solution {
                values: initial.clone(),
                iterations: 0,
                initial_error,
                final_error: initial_error,
            });
        }

        let mut problem = GraphProblem::new(graph, &layout, initial, self.config.max_iterations);
        let mut error = initial_error;
        for round in 0..ANCHOR_ROUNDS {
            let (solved, report) = self.minimizer().minimize(problem);
            problem = solved;
            Self::check_termination(&report, &problem)?;
            error = graph.error(&problem.values)?;
            if !error.is_finite() {
                return Err(OptimizerError::Diverged {
                    iterations: problem.iterations(),
                    error,
                });
            }
            log::trace!(
                "lm round {}: {:?}, error {:.6e}, step {:.3e}",
                round,
                report.termination,
                error,
                problem.delta.norm()
            );
            if error <= self.config.absolute_tolerance || problem.delta.norm() < ANCHOR_STEP {
                break;
            }
            problem.reanchor();
        }
        Ok(Solution {
            iterations: problem.iterations(),
            values: problem.values,
            initial_error,
            final_error: error,
        })
    }

    fn marginals(&self, graph: &FactorGraph, values: &Values) -> Result<Marginals, OptimizerError> {
        let layout = Layout::new(graph, values)?;
        let system = NormalEquations::build(graph, values, &layout)?;
        Marginals::new(layout, system, graph.fixed().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        camera::StereoCamera,
        optimizer::{BetweenFactor, Key, StereoFactor},
        utility::Utility,
    };
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Matrix6, Point3, Vector3, Vector6};

    fn camera() -> StereoCamera {
        StereoCamera::new(700.0, 700.0, 0.0, 600.0, 180.0, 0.54)
    }

    /// 两个位姿观测一组路标点，x0 固定
    fn two_view_problem(noise: bool) -> (FactorGraph, Values, Isometry3<f64>, Vec<Point3<f64>>) {
        let camera = camera();
        let truth = Isometry3::new(Vector3::new(0.2, 0.05, 1.0), Vector3::new(0.0, 0.03, 0.01));
        let mut points = Vec::new();
        for i in 0..4 {
            for j in 0..3 {
                points.push(Point3::new(
                    -3.0 + 2.0 * i as f64,
                    -1.0 + j as f64,
                    8.0 + i as f64 + j as f64,
                ));
            }
        }
        let mut graph = FactorGraph::new();
        let mut values = Values::new();
        values.insert_pose(0, Isometry3::identity());
        values.insert_pose(
            1,
            if noise {
                truth * Utility::se3_exp(&Vector6::new(0.01, -0.02, 0.01, 0.05, -0.03, 0.08))
            } else {
                truth
            },
        );
        for (id, point) in points.iter().enumerate() {
            let id = id as u32;
            for (pose_id, pose) in [(0, Isometry3::identity()), (1, truth)] {
                let obs = camera.project_world(&pose, point).unwrap();
                graph.add(StereoFactor::new(pose_id, id, obs, camera, 1.0));
            }
            let offset = if noise {
                Vector3::new(0.1, -0.1, 0.3)
            } else {
                Vector3::zeros()
            };
            values.insert_point(id, point + offset);
        }
        graph.fix(Key::Pose(0));
        (graph, values, truth, points)
    }

    #[test]
    fn test_exact_initial_converges_immediately() {
        let (graph, values, _, _) = two_view_problem(false);
        let solution = LevenbergMarquardt::default().optimize(&graph, &values).unwrap();
        assert!(solution.final_error < 1e-10);
        assert_eq!(solution.iterations, 0);
    }

    #[test]
    fn test_converges_to_truth() {
        let (graph, values, truth, points) = two_view_problem(true);
        let solution = LevenbergMarquardt::new(SolverConfig::default())
            .optimize(&graph, &values)
            .unwrap();
        assert!(solution.initial_error > 1.0);
        assert!(solution.final_error < 1e-8, "{}", solution.final_error);
        assert!(solution.iterations > 0);
        assert_relative_eq!(*solution.values.pose(1).unwrap(), truth, epsilon = 1e-6);
        assert_relative_eq!(*solution.values.point(5).unwrap(), points[5], epsilon = 1e-5);
        assert_relative_eq!(*solution.values.pose(0).unwrap(), Isometry3::identity());
    }

    #[test]
    fn test_iteration_cap_reports_divergence() {
        let (graph, values, _, _) = two_view_problem(true);
        let config = SolverConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let result = LevenbergMarquardt::new(config).optimize(&graph, &values);
        assert!(matches!(result, Err(OptimizerError::Diverged { iterations: 1, .. })));
    }

    #[test]
    fn test_point_behind_camera() {
        let (graph, mut values, _, _) = two_view_problem(false);
        values.insert_point(0, Point3::new(0.0, 0.0, -5.0));
        let result = LevenbergMarquardt::default().optimize(&graph, &values);
        assert!(matches!(result, Err(OptimizerError::Cheirality { .. })));
    }

    #[test]
    fn test_behind_camera_steps_are_penalized() {
        let (graph, values, _, _) = two_view_problem(false);
        let layout = Layout::new(&graph, &values).unwrap();
        let mut problem = GraphProblem::new(&graph, &layout, &values, 10);
        assert!(problem.residuals().unwrap().norm() < 1e-6);

        // 把 l0 推到 x0 后方
        let mut delta = DVector::zeros(layout.dim());
        let col = layout.column(Key::Point(0)).unwrap();
        delta[col + 2] = -20.0;
        problem.set_params(&delta);
        let residuals = problem.residuals().unwrap();
        assert_eq!(residuals.len(), 3 * graph.len());
        assert_eq!(residuals[0], BEHIND_CAMERA_RESIDUAL);
        assert_eq!(problem.params(), delta);
    }

    #[test]
    fn test_missing_value_and_empty_graph() {
        let (graph, _, _, _) = two_view_problem(false);
        let lm = LevenbergMarquardt::default();
        assert!(matches!(
            lm.optimize(&graph, &Values::new()),
            Err(OptimizerError::MissingValue(_))
        ));
        assert_eq!(
            lm.optimize(&FactorGraph::new(), &Values::new()).err(),
            Some(OptimizerError::EmptyGraph)
        );
    }

    #[test]
    fn test_between_chain() {
        let step = Isometry3::new(Vector3::new(1.0, 0.0, 0.2), Vector3::new(0.0, 0.1, 0.0));
        let covariance = Matrix6::identity() * 0.01;
        let mut graph = FactorGraph::new();
        let mut values = Values::new();
        values.insert_pose(0, Isometry3::identity());
        for i in 0..3 {
            graph.add(BetweenFactor::from_covariance(i, i + 1, step, &covariance).unwrap());
            values.insert_pose(i + 1, Isometry3::translation(i as f64, 0.5, 0.0));
        }
        graph.fix(Key::Pose(0));
        let solution = LevenbergMarquardt::default().optimize(&graph, &values).unwrap();
        assert_relative_eq!(
            *solution.values.pose(3).unwrap(),
            step * step * step,
            epsilon = 1e-6
        );
    }
}
