//! 线性化：变量排列、稠密雅可比和分块正规方程
//!
//! H 按 [位姿 | 路标点] 分块，H_ll 为 3x3 块对角。

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix3, Vector3, Vector6};

use super::{FactorGraph, Key, OptimizerError, Values};
use crate::utility::Utility;

/// 待优化变量在参数向量中的排列，位姿在前
#[derive(Debug, Clone, Default)]
pub(crate) struct Layout {
    pub poses: Vec<u32>,
    pub points: Vec<u32>,
    pose_index: HashMap<u32, usize>,
    point_index: HashMap<u32, usize>,
}

impl Layout {
    /// 所有出现在因子中且未固定的变量
    pub fn new(graph: &FactorGraph, values: &Values) -> Result<Self, OptimizerError> {
        let mut layout = Self::default();
        for key in graph.keys() {
            if !values.contains(key) {
                return Err(OptimizerError::MissingValue(key));
            }
            if graph.is_fixed(key) {
                continue;
            }
            match key {
                Key::Pose(id) => {
                    layout.pose_index.insert(id, layout.poses.len());
                    layout.poses.push(id);
                }
                Key::Point(id) => {
                    layout.point_index.insert(id, layout.points.len());
                    layout.points.push(id);
                }
            }
        }
        Ok(layout)
    }

    pub fn pose_dim(&self) -> usize {
        6 * self.poses.len()
    }

    pub fn point_dim(&self) -> usize {
        3 * self.points.len()
    }

    pub fn dim(&self) -> usize {
        self.pose_dim() + self.point_dim()
    }

    pub fn pose_index(&self, id: u32) -> Option<usize> {
        self.pose_index.get(&id).copied()
    }

    pub fn point_index(&self, id: u32) -> Option<usize> {
        self.point_index.get(&id).copied()
    }

    /// 变量在参数向量中的起始列
    pub fn column(&self, key: Key) -> Option<usize> {
        match key {
            Key::Pose(id) => self.pose_index(id).map(|i| 6 * i),
            Key::Point(id) => self.point_index(id).map(|i| self.pose_dim() + 3 * i),
        }
    }

    /// 位姿右乘扰动，路标点直接相加
    pub fn retract(&self, values: &Values, delta: &DVector<f64>) -> Values {
        let mut updated = values.clone();
        for (i, &id) in self.poses.iter().enumerate() {
            if let Some(pose) = updated.pose_mut(id) {
                let step: Vector6<f64> = delta.fixed_rows::<6>(6 * i).into_owned();
                *pose = Utility::retract(pose, &step);
            }
        }
        let offset = self.pose_dim();
        for (i, &id) in self.points.iter().enumerate() {
            if let Some(point) = updated.point_mut(id) {
                let step: Vector3<f64> = delta.fixed_rows::<3>(offset + 3 * i).into_owned();
                *point += step;
            }
        }
        updated
    }
}

/// 第一个在相机后方的观测
pub(crate) fn behind_camera(graph: &FactorGraph, values: &Values) -> Option<OptimizerError> {
    graph.factors().iter().find_map(|factor| {
        let error = factor.error(values).ok()?;
        if error.is_finite() {
            return None;
        }
        let keys = factor.keys();
        Some(OptimizerError::Cheirality {
            pose: keys[0],
            point: keys[1],
        })
    })
}

/// 稠密雅可比，行按因子顺序排列；点在相机后方的因子行为零
pub(crate) fn jacobian(
    graph: &FactorGraph,
    values: &Values,
    layout: &Layout,
) -> Result<DMatrix<f64>, OptimizerError> {
    let rows: usize = graph.factors().iter().map(|f| f.dim()).sum();
    let mut jacobian = DMatrix::zeros(rows, layout.dim());
    let mut row = 0;
    for factor in graph.factors() {
        if let Some(linearized) = factor.linearize(values, graph.fixed())? {
            for (key, block) in &linearized.blocks {
                if let Some(col) = layout.column(*key) {
                    jacobian
                        .view_mut((row, col), (block.nrows(), block.ncols()))
                        .copy_from(block);
                }
            }
        }
        row += factor.dim();
    }
    Ok(jacobian)
}

/// 正规方程 H = J^T J，b = J^T r
#[derive(Debug, Clone)]
pub(crate) struct NormalEquations {
    pub h_pp: DMatrix<f64>,
    pub h_pl: DMatrix<f64>,
    pub h_ll: Vec<Matrix3<f64>>,
}

impl NormalEquations {
    /// 在 values 处线性化，任何点在相机后方时返回 Cheirality
    pub fn build(
        graph: &FactorGraph,
        values: &Values,
        layout: &Layout,
    ) -> Result<Self, OptimizerError> {
        if let Some(error) = behind_camera(graph, values) {
            return Err(error);
        }
        let jacobian = jacobian(graph, values, layout)?;
        let np = layout.pose_dim();
        let j_p = jacobian.columns(0, np);
        let j_l = jacobian.columns(np, layout.point_dim());
        let h_pp = j_p.transpose() * j_p;
        let h_pl = j_p.transpose() * j_l;
        let h_ll = (0..layout.points.len())
            .map(|i| {
                let block = jacobian.columns(np + 3 * i, 3);
                let h: DMatrix<f64> = block.transpose() * block;
                Matrix3::from_fn(|r, c| h[(r, c)])
            })
            .collect();
        Ok(Self { h_pp, h_pl, h_ll })
    }

    /// W = H_pl * H_ll^-1
    pub fn w_matrix(&self, inv_ll: &[Matrix3<f64>]) -> DMatrix<f64> {
        let mut w = DMatrix::zeros(self.h_pl.nrows(), self.h_pl.ncols());
        for (i, inv) in inv_ll.iter().enumerate() {
            let block = self.h_pl.fixed_columns::<3>(3 * i) * inv;
            w.fixed_columns_mut::<3>(3 * i).copy_from(&block);
        }
        w
    }
}
