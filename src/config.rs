use std::path::Path;

use anyhow::Context;
use nalgebra::Matrix6;
use serde::{Deserialize, Serialize};

use crate::bundle::{KeyframeBounds, KeyframePolicy};

/// 像素观测噪声（标准差，像素）
pub const PIXEL_SIGMA: f64 = 1.0;
/// 关键帧窗口的最小跨度
pub const MIN_WINDOW: u32 = 5;
/// 关键帧窗口的最大跨度
pub const MAX_WINDOW: u32 = 20;
/// 固定跨度选取关键帧时的跨度
pub const WINDOW_SIZE: u32 = 10;
/// 前端内点的最少数量
pub const MIN_INLIERS: usize = 20;
/// 是否使用多线程
pub const MULTIPLE_THREAD: bool = true;

/// LM 最大迭代次数（雅可比求值次数）
pub const MAX_ITERATIONS: usize = 100;
pub const ABSOLUTE_TOLERANCE: f64 = 1e-10;
pub const FUNCTION_TOLERANCE: f64 = 1e-12;
pub const STEP_TOLERANCE: f64 = 1e-12;
pub const GRADIENT_TOLERANCE: f64 = 1e-12;
/// 初始信赖域半径系数
pub const STEP_BOUND: f64 = 100.0;

/// 低置信度边的旋转标准差 (rad)
pub const FALLBACK_ROTATION_SIGMA: f64 = 0.1;
/// 低置信度边的平移标准差 (m)
pub const FALLBACK_TRANSLATION_SIGMA: f64 = 1.0;

/// Levenberg-Marquardt 参数
///
/// ftol、xtol、gtol 和 stepbound 直接交给 levenberg-marquardt。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iterations: usize,
    /// 误差小于该值时不再优化
    pub absolute_tolerance: f64,
    /// 实际和预测的相对误差下降都小于该值时收敛
    pub ftol: f64,
    /// 相对步长小于该值时收敛
    pub xtol: f64,
    /// 残差与雅可比列向量夹角余弦小于该值时收敛
    pub gtol: f64,
    pub stepbound: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: MAX_ITERATIONS,
            absolute_tolerance: ABSOLUTE_TOLERANCE,
            ftol: FUNCTION_TOLERANCE,
            xtol: STEP_TOLERANCE,
            gtol: GRADIENT_TOLERANCE,
            stepbound: STEP_BOUND,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_iterations > 0, "solver needs at least one iteration");
        anyhow::ensure!(
            self.ftol >= 0.0 && self.xtol >= 0.0 && self.gtol >= 0.0,
            "solver tolerances must not be negative"
        );
        anyhow::ensure!(self.stepbound > 0.0, "solver step bound must be positive");
        Ok(())
    }
}

/// 窗口优化失败时使用的默认协方差
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackCovariance {
    pub rotation_sigma: f64,
    pub translation_sigma: f64,
}

impl Default for FallbackCovariance {
    fn default() -> Self {
        Self {
            rotation_sigma: FALLBACK_ROTATION_SIGMA,
            translation_sigma: FALLBACK_TRANSLATION_SIGMA,
        }
    }
}

impl FallbackCovariance {
    /// 对角协方差，切空间顺序 [omega; v]
    pub fn matrix(&self) -> Matrix6<f64> {
        let r = self.rotation_sigma * self.rotation_sigma;
        let t = self.translation_sigma * self.translation_sigma;
        Matrix6::from_diagonal(&nalgebra::Vector6::new(r, r, r, t, t, t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyframeConfig {
    pub policy: KeyframePolicy,
    pub min_window: u32,
    pub max_window: u32,
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        Self {
            policy: KeyframePolicy::FixedSpan { span: WINDOW_SIZE },
            min_window: MIN_WINDOW,
            max_window: MAX_WINDOW,
        }
    }
}

impl KeyframeConfig {
    pub fn bounds(&self) -> KeyframeBounds {
        KeyframeBounds::new(self.min_window, self.max_window)
    }
}

/// 整个流程的配置，可从 json 文件读取
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub keyframes: KeyframeConfig,
    pub solver: SolverConfig,
    pub pixel_sigma: f64,
    pub min_inliers: usize,
    pub fallback: FallbackCovariance,
    pub multiple_thread: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            keyframes: KeyframeConfig::default(),
            solver: SolverConfig::default(),
            pixel_sigma: PIXEL_SIGMA,
            min_inliers: MIN_INLIERS,
            fallback: FallbackCovariance::default(),
            multiple_thread: MULTIPLE_THREAD,
        }
    }
}

impl PipelineConfig {
    pub fn read_from_json(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("open config {}", path.display()))?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn write_to_json(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// 在构建任何窗口之前检查配置
    pub fn validate(&self) -> anyhow::Result<()> {
        self.keyframes.policy.validate()?;
        self.keyframes.bounds().validate()?;
        anyhow::ensure!(
            self.pixel_sigma > 0.0 && self.pixel_sigma.is_finite(),
            "pixel sigma must be positive, got {}",
            self.pixel_sigma
        );
        self.solver.validate()?;
        anyhow::ensure!(
            self.fallback.rotation_sigma > 0.0 && self.fallback.translation_sigma > 0.0,
            "fallback sigmas must be positive"
        );
        Ok(())
    }
}
