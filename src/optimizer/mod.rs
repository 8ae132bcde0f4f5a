//! 非线性最小二乘后端
//!
//! 因子图 + 初值 -> 优化结果，以及求解后任意变量子集的联合边缘协方差。
//! 窗口优化和位姿图都只依赖 [`Optimizer`] trait。
mod factors;
mod levenberg;
mod linear;
mod marginals;

pub use factors::{BetweenFactor, StereoFactor};
pub use levenberg::LevenbergMarquardt;
pub use marginals::Marginals;

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector, Isometry3, Point3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 变量 id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    /// 相机位姿 (相机到世界)
    Pose(u32),
    /// 三维路标点
    Point(u32),
}

impl Key {
    /// 切空间维度
    pub fn dim(&self) -> usize {
        match self {
            Key::Pose(_) => 6,
            Key::Point(_) => 3,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Pose(id) => write!(f, "x{}", id),
            Key::Point(id) => write!(f, "l{}", id),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OptimizerError {
    #[error("no convergence after {iterations} iterations (error {error})")]
    Diverged { iterations: usize, error: f64 },
    #[error("information matrix is singular")]
    Singular,
    #[error("point {point} is behind camera {pose}")]
    Cheirality { pose: Key, point: Key },
    #[error("no value for {0}")]
    MissingValue(Key),
    #[error("factor graph is empty")]
    EmptyGraph,
}

/// 变量取值
#[derive(Debug, Clone, Default)]
pub struct Values {
    poses: BTreeMap<u32, Isometry3<f64>>,
    points: BTreeMap<u32, Point3<f64>>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pose(&mut self, id: u32, pose: Isometry3<f64>) {
        self.poses.insert(id, pose);
    }

    pub fn insert_point(&mut self, id: u32, point: Point3<f64>) {
        self.points.insert(id, point);
    }

    pub fn pose(&self, id: u32) -> Option<&Isometry3<f64>> {
        self.poses.get(&id)
    }

    pub fn point(&self, id: u32) -> Option<&Point3<f64>> {
        self.points.get(&id)
    }

    pub(crate) fn pose_mut(&mut self, id: u32) -> Option<&mut Isometry3<f64>> {
        self.poses.get_mut(&id)
    }

    pub(crate) fn point_mut(&mut self, id: u32) -> Option<&mut Point3<f64>> {
        self.points.get_mut(&id)
    }

    pub fn poses(&self) -> impl Iterator<Item = (u32, &Isometry3<f64>)> {
        self.poses.iter().map(|(&id, pose)| (id, pose))
    }

    pub fn points(&self) -> impl Iterator<Item = (u32, &Point3<f64>)> {
        self.points.iter().map(|(&id, point)| (id, point))
    }

    pub fn contains(&self, key: Key) -> bool {
        match key {
            Key::Pose(id) => self.poses.contains_key(&id),
            Key::Point(id) => self.points.contains_key(&id),
        }
    }

    pub fn len(&self) -> usize {
        self.poses.len() + self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn require_pose(&self, id: u32) -> Result<&Isometry3<f64>, OptimizerError> {
        self.pose(id).ok_or(OptimizerError::MissingValue(Key::Pose(id)))
    }

    pub(crate) fn require_point(&self, id: u32) -> Result<&Point3<f64>, OptimizerError> {
        self.point(id)
            .ok_or(OptimizerError::MissingValue(Key::Point(id)))
    }
}

/// 线性化后的因子：白化残差和对各变量的雅可比
#[derive(Debug, Clone)]
pub(crate) struct Linearized {
    pub residual: DVector<f64>,
    pub blocks: Vec<(Key, DMatrix<f64>)>,
}

#[derive(Debug, Clone)]
pub enum Factor {
    Stereo(StereoFactor),
    Between(BetweenFactor),
}

impl Factor {
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Factor::Stereo(f) => vec![Key::Pose(f.pose), Key::Point(f.point)],
            Factor::Between(f) => vec![Key::Pose(f.from), Key::Pose(f.to)],
        }
    }

    /// 白化残差的平方和，点在相机后方时为无穷大
    pub fn error(&self, values: &Values) -> Result<f64, OptimizerError> {
        let error = match self {
            Factor::Stereo(f) => f.whitened_residual(values)?.map(|r| r.norm_squared()),
            Factor::Between(f) => Some(f.whitened_residual(values)?.norm_squared()),
        };
        Ok(error.unwrap_or(f64::INFINITY))
    }

    /// 白化残差向量，点在相机后方时为 None
    pub(crate) fn residual(&self, values: &Values) -> Result<Option<DVector<f64>>, OptimizerError> {
        let residual = match self {
            Factor::Stereo(f) => f
                .whitened_residual(values)?
                .map(|r| DVector::from_column_slice(r.as_slice())),
            Factor::Between(f) => {
                Some(DVector::from_column_slice(f.whitened_residual(values)?.as_slice()))
            }
        };
        Ok(residual)
    }

    /// 残差维度
    pub fn dim(&self) -> usize {
        match self {
            Factor::Stereo(_) => 3,
            Factor::Between(_) => 6,
        }
    }

    /// 固定变量的雅可比不计算
    pub(crate) fn linearize(
        &self,
        values: &Values,
        fixed: &BTreeSet<Key>,
    ) -> Result<Option<Linearized>, OptimizerError> {
        match self {
            Factor::Stereo(f) => f.linearize(values, fixed),
            Factor::Between(f) => f.linearize(values, fixed).map(Some),
        }
    }
}

impl From<StereoFactor> for Factor {
    fn from(factor: StereoFactor) -> Self {
        Factor::Stereo(factor)
    }
}

impl From<BetweenFactor> for Factor {
    fn from(factor: BetweenFactor) -> Self {
        Factor::Between(factor)
    }
}

/// 因子图，固定变量不参与优化
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    factors: Vec<Factor>,
    fixed: BTreeSet<Key>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, factor: impl Into<Factor>) {
        self.factors.push(factor.into());
    }

    pub fn fix(&mut self, key: Key) {
        self.fixed.insert(key);
    }

    pub fn is_fixed(&self, key: Key) -> bool {
        self.fixed.contains(&key)
    }

    pub fn fixed(&self) -> &BTreeSet<Key> {
        &self.fixed
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// 因子涉及的所有变量
    pub fn keys(&self) -> BTreeSet<Key> {
        self.factors.iter().flat_map(|f| f.keys()).collect()
    }

    /// 总误差 sum ||r||^2
    pub fn error(&self, values: &Values) -> Result<f64, OptimizerError> {
        let mut total = 0.0;
        for factor in &self.factors {
            total += factor.error(values)?;
        }
        Ok(total)
    }
}

/// 优化结果
#[derive(Debug, Clone)]
pub struct Solution {
    pub values: Values,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

pub trait Optimizer {
    fn optimize(&self, graph: &FactorGraph, initial: &Values) -> Result<Solution, OptimizerError>;

    /// 在 values 处计算边缘协方差
    fn marginals(&self, graph: &FactorGraph, values: &Values) -> Result<Marginals, OptimizerError>;
}
