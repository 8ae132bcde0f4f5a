use std::collections::BTreeSet;

use nalgebra::{DMatrix, Matrix3, Matrix6, OMatrix, U3, Dyn};

use super::{
    linear::{Layout, NormalEquations},
    Key, OptimizerError,
};

const RANK_TOLERANCE: f64 = 1e-10;

/// 求解点处的边缘协方差
///
/// Sigma_pp = S^-1，E_i = H_ll_i^-1 H_lp_i，
/// Sigma_lp = -E_i Sigma_pp，Sigma_ll = delta_ij H_ll_i^-1 + E_i Sigma_pp E_j^T。
/// 固定变量的协方差为零。
#[derive(Debug, Clone)]
pub struct Marginals {
    layout: Layout,
    fixed: BTreeSet<Key>,
    sigma_pp: DMatrix<f64>,
    inv_ll: Vec<Matrix3<f64>>,
    /// E_i，3 x 6m
    e_blocks: Vec<OMatrix<f64, U3, Dyn>>,
}

enum Block {
    Fixed,
    Pose(usize),
    Point(usize),
}

impl Marginals {
    pub(crate) fn new(
        layout: Layout,
        system: NormalEquations,
        fixed: BTreeSet<Key>,
    ) -> Result<Self, OptimizerError> {
        let mut inv_ll = Vec::with_capacity(system.h_ll.len());
        for block in &system.h_ll {
            inv_ll.push(block.try_inverse().ok_or(OptimizerError::Singular)?);
        }
        let sigma_pp = if system.h_pp.nrows() == 0 {
            DMatrix::zeros(0, 0)
        } else {
            let w = system.w_matrix(&inv_ll);
            let schur = &system.h_pp - w * system.h_pl.transpose();
            let schur = (&schur + schur.transpose()) * 0.5;
            let cholesky = schur.cholesky().ok_or(OptimizerError::Singular)?;
            // 主元相对 H_pp 对角元过小时视为秩亏
            let l = cholesky.l_dirty();
            for i in 0..l.nrows() {
                let pivot = l[(i, i)] * l[(i, i)];
                if pivot <= RANK_TOLERANCE * system.h_pp[(i, i)].max(f64::MIN_POSITIVE) {
                    return Err(OptimizerError::Singular);
                }
            }
            cholesky.inverse()
        };
        let e_blocks = inv_ll
            .iter()
            .enumerate()
            .map(|(i, inv)| inv * system.h_pl.fixed_columns::<3>(3 * i).transpose())
            .collect();
        Ok(Self {
            layout,
            fixed,
            sigma_pp,
            inv_ll,
            e_blocks,
        })
    }

    fn locate(&self, key: Key) -> Result<Block, OptimizerError> {
        if self.fixed.contains(&key) {
            return Ok(Block::Fixed);
        }
        let block = match key {
            Key::Pose(id) => self.layout.pose_index(id).map(Block::Pose),
            Key::Point(id) => self.layout.point_index(id).map(Block::Point),
        };
        block.ok_or(OptimizerError::MissingValue(key))
    }

    fn block(&self, a: Key, b: Key) -> Result<DMatrix<f64>, OptimizerError> {
        let sigma = &self.sigma_pp;
        let matrix = match (self.locate(a)?, self.locate(b)?) {
            (Block::Fixed, _) | (_, Block::Fixed) => DMatrix::zeros(a.dim(), b.dim()),
            (Block::Pose(i), Block::Pose(j)) => {
                DMatrix::from_fn(6, 6, |r, c| sigma[(6 * i + r, 6 * j + c)])
            }
            (Block::Point(i), Block::Pose(j)) => {
                let cross = &self.e_blocks[i] * sigma.columns(6 * j, 6);
                DMatrix::from_fn(3, 6, |r, c| -cross[(r, c)])
            }
            (Block::Pose(i), Block::Point(j)) => {
                let cross = &self.e_blocks[j] * sigma.columns(6 * i, 6);
                DMatrix::from_fn(6, 3, |r, c| -cross[(c, r)])
            }
            (Block::Point(i), Block::Point(j)) => {
                let mut cov: Matrix3<f64> =
                    &self.e_blocks[i] * sigma * self.e_blocks[j].transpose();
                if i == j {
                    cov += self.inv_ll[i];
                }
                DMatrix::from_fn(3, 3, |r, c| cov[(r, c)])
            }
        };
        Ok(matrix)
    }

    /// 单个变量的边缘协方差
    pub fn marginal_covariance(&self, key: Key) -> Result<DMatrix<f64>, OptimizerError> {
        self.block(key, key)
    }

    /// 位姿的 6x6 边缘协方差
    pub fn pose_covariance(&self, id: u32) -> Result<Matrix6<f64>, OptimizerError> {
        let block = self.marginal_covariance(Key::Pose(id))?;
        Ok(Matrix6::from_fn(|r, c| block[(r, c)]))
    }

    /// 按 keys 顺序拼接的联合边缘协方差
    pub fn joint_marginal_covariance(&self, keys: &[Key]) -> Result<DMatrix<f64>, OptimizerError> {
        let offsets: Vec<usize> = keys
            .iter()
            .scan(0, |offset, key| {
                let start = *offset;
                *offset += key.dim();
                Some(start)
            })
            .collect();
        let dim: usize = keys.iter().map(|k| k.dim()).sum();
        let mut joint = DMatrix::zeros(dim, dim);
        for (a, &key_a) in keys.iter().enumerate() {
            for (b, &key_b) in keys.iter().enumerate() {
                let block = self.block(key_a, key_b)?;
                joint
                    .view_mut((offsets[a], offsets[b]), (key_a.dim(), key_b.dim()))
                    .copy_from(&block);
            }
        }
        Ok(joint)
    }

    /// 联合信息矩阵，协方差不可逆时为 Singular
    fn joint_marginal_information(&self, keys: &[Key]) -> Result<DMatrix<f64>, OptimizerError> {
        self.joint_marginal_covariance(keys)?
            .try_inverse()
            .ok_or(OptimizerError::Singular)
    }

    /// 以 given 为条件的 target 协方差
    ///
    /// 取 (given, target) 联合信息矩阵中 target 的块再求逆。given 固定时即为边缘协方差。
    pub fn conditional_covariance(&self, target: Key, given: Key) -> Result<DMatrix<f64>, OptimizerError> {
        if self.fixed.contains(&given) {
            return self.marginal_covariance(target);
        }
        let information = self.joint_marginal_information(&[given, target])?;
        let offset = given.dim();
        let dim = target.dim();
        information
            .view((offset, offset), (dim, dim))
            .into_owned()
            .try_inverse()
            .ok_or(OptimizerError::Singular)
    }
}
