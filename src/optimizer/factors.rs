use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector, Isometry3, Matrix3x6, Matrix6, Vector3, Vector6};

use super::{Key, Linearized, OptimizerError, Values};
use crate::{
    camera::{CameraTrait, StereoCamera},
    global_types::Observation,
    utility::Utility,
};

/// 数值求导步长
const NUMERIC_STEP: f64 = 1e-6;

/// 双目重投影因子，各向同性像素噪声
#[derive(Debug, Clone)]
pub struct StereoFactor {
    pub pose: u32,
    pub point: u32,
    pub measured: Observation,
    pub camera: StereoCamera,
    pub sigma: f64,
}

impl StereoFactor {
    pub fn new(pose: u32, point: u32, measured: Observation, camera: StereoCamera, sigma: f64) -> Self {
        Self {
            pose,
            point,
            measured,
            camera,
            sigma,
        }
    }

    /// 相机坐标系下的点
    fn point_in_camera(&self, values: &Values) -> Result<(Isometry3<f64>, Vector3<f64>), OptimizerError> {
        let pose = *values.require_pose(self.pose)?;
        let point = values.require_point(self.point)?;
        Ok((pose, pose.inverse_transform_point(point).coords))
    }

    /// (投影 - 观测) / sigma，点在相机后方时为 None
    pub fn whitened_residual(&self, values: &Values) -> Result<Option<Vector3<f64>>, OptimizerError> {
        let (_, p_cam) = self.point_in_camera(values)?;
        Ok(self
            .camera
            .project(&p_cam)
            .map(|obs| (obs.as_vector() - self.measured.as_vector()) / self.sigma))
    }

    /// 右扰动 T * Exp([w; v])：
    /// d(q)/dw = [q]x，d(q)/dv = -I，d(q)/dp = R^T
    pub(crate) fn linearize(
        &self,
        values: &Values,
        fixed: &BTreeSet<Key>,
    ) -> Result<Option<Linearized>, OptimizerError> {
        let (pose, p_cam) = self.point_in_camera(values)?;
        let obs = match self.camera.project(&p_cam) {
            Some(obs) => obs,
            None => return Ok(None),
        };
        let residual = (obs.as_vector() - self.measured.as_vector()) / self.sigma;
        let j_cam = self.camera.project_jacobian(&p_cam) / self.sigma;

        let mut blocks = Vec::with_capacity(2);
        let pose_key = Key::Pose(self.pose);
        if !fixed.contains(&pose_key) {
            let mut j_pose = Matrix3x6::zeros();
            j_pose
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(j_cam * Utility::skew(&p_cam)));
            j_pose.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-j_cam));
            blocks.push((pose_key, DMatrix::from_column_slice(3, 6, j_pose.as_slice())));
        }
        let point_key = Key::Point(self.point);
        if !fixed.contains(&point_key) {
            let rotation_t = pose.rotation.to_rotation_matrix().into_inner().transpose();
            let j_point = j_cam * rotation_t;
            blocks.push((point_key, DMatrix::from_column_slice(3, 3, j_point.as_slice())));
        }
        Ok(Some(Linearized {
            residual: DVector::from_column_slice(residual.as_slice()),
            blocks,
        }))
    }
}

/// 相对位姿因子 r = L * Log(meas^-1 * Ti^-1 * Tj)，L^T L 为信息矩阵
#[derive(Debug, Clone)]
pub struct BetweenFactor {
    pub from: u32,
    pub to: u32,
    pub measured: Isometry3<f64>,
    sqrt_information: Matrix6<f64>,
}

impl BetweenFactor {
    /// 协方差不正定时返回 Singular
    pub fn from_covariance(
        from: u32,
        to: u32,
        measured: Isometry3<f64>,
        covariance: &Matrix6<f64>,
    ) -> Result<Self, OptimizerError> {
        let information = covariance.try_inverse().ok_or(OptimizerError::Singular)?;
        let information = (information + information.transpose()) * 0.5;
        let cholesky = information.cholesky().ok_or(OptimizerError::Singular)?;
        Ok(Self {
            from,
            to,
            measured,
            sqrt_information: cholesky.l().transpose(),
        })
    }

    pub fn information(&self) -> Matrix6<f64> {
        self.sqrt_information.transpose() * self.sqrt_information
    }

    fn residual(&self, pose_i: &Isometry3<f64>, pose_j: &Isometry3<f64>) -> Vector6<f64> {
        let error = self.measured.inverse() * Utility::between(pose_i, pose_j);
        self.sqrt_information * Utility::se3_log(&error)
    }

    pub fn whitened_residual(&self, values: &Values) -> Result<Vector6<f64>, OptimizerError> {
        let pose_i = values.require_pose(self.from)?;
        let pose_j = values.require_pose(self.to)?;
        Ok(self.residual(pose_i, pose_j))
    }

    /// 中心差分求雅可比
    pub(crate) fn linearize(
        &self,
        values: &Values,
        fixed: &BTreeSet<Key>,
    ) -> Result<Linearized, OptimizerError> {
        let pose_i = *values.require_pose(self.from)?;
        let pose_j = *values.require_pose(self.to)?;
        let residual = self.residual(&pose_i, &pose_j);

        let mut blocks = Vec::with_capacity(2);
        for (id, is_from) in [(self.from, true), (self.to, false)] {
            let key = Key::Pose(id);
            if fixed.contains(&key) {
                continue;
            }
            let mut jacobian = Matrix6::zeros();
            for k in 0..6 {
                let mut delta = Vector6::zeros();
                delta[k] = NUMERIC_STEP;
                let plus = Utility::retract(if is_from { &pose_i } else { &pose_j }, &delta);
                let minus = Utility::retract(if is_from { &pose_i } else { &pose_j }, &(-delta));
                let (r_plus, r_minus) = if is_from {
                    (self.residual(&plus, &pose_j), self.residual(&minus, &pose_j))
                } else {
                    (self.residual(&pose_i, &plus), self.residual(&pose_i, &minus))
                };
                jacobian
                    .column_mut(k)
                    .copy_from(&((r_plus - r_minus) / (2.0 * NUMERIC_STEP)));
            }
            blocks.push((key, DMatrix::from_column_slice(6, 6, jacobian.as_slice())));
        }
        Ok(Linearized {
            residual: DVector::from_column_slice(residual.as_slice()),
            blocks,
        })
    }
}
