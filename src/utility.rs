use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3, Vector6};

/// 小角度阈值，低于该值使用泰勒展开
const SMALL_ANGLE: f64 = 1e-8;

pub struct Utility {}

impl Utility {
    /// 反对称矩阵 [v]x
    #[inline]
    pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
        Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
    }

    /// SE3 指数映射，xi = [omega; v]
    pub fn se3_exp(xi: &Vector6<f64>) -> Isometry3<f64> {
        let omega = xi.fixed_rows::<3>(0).into_owned();
        let v = xi.fixed_rows::<3>(3).into_owned();
        let theta = omega.norm();
        let w = Self::skew(&omega);
        let w2 = w * w;
        let jacobian = if theta < SMALL_ANGLE {
            Matrix3::identity() + w * 0.5 + w2 / 6.0
        } else {
            let theta2 = theta * theta;
            Matrix3::identity()
                + w * ((1.0 - theta.cos()) / theta2)
                + w2 * ((theta - theta.sin()) / (theta2 * theta))
        };
        Isometry3::from_parts(
            Translation3::from(jacobian * v),
            UnitQuaternion::new(omega),
        )
    }

    /// SE3 对数映射，返回 [omega; v]
    pub fn se3_log(pose: &Isometry3<f64>) -> Vector6<f64> {
        let omega = pose.rotation.scaled_axis();
        let theta = omega.norm();
        let w = Self::skew(&omega);
        let w2 = w * w;
        let inv_jacobian = if theta < SMALL_ANGLE {
            Matrix3::identity() - w * 0.5 + w2 / 12.0
        } else {
            let coefficient =
                (1.0 - theta * theta.sin() / (2.0 * (1.0 - theta.cos()))) / (theta * theta);
            Matrix3::identity() - w * 0.5 + w2 * coefficient
        };
        let v = inv_jacobian * pose.translation.vector;
        Vector6::new(omega.x, omega.y, omega.z, v.x, v.y, v.z)
    }

    /// 右扰动 T * Exp(delta)
    #[inline]
    pub fn retract(pose: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
        pose * Self::se3_exp(delta)
    }

    /// a^-1 * b，b 在 a 坐标系下的位姿
    #[inline]
    pub fn between(a: &Isometry3<f64>, b: &Isometry3<f64>) -> Isometry3<f64> {
        a.inverse() * b
    }

    /// 两个位姿的平移距离和旋转角度
    pub fn pose_distance(a: &Isometry3<f64>, b: &Isometry3<f64>) -> (f64, f64) {
        let delta = Self::between(a, b);
        (delta.translation.vector.norm(), delta.rotation.angle())
    }
}
