//! 关键帧选取
//!
//! 规则只提出候选，窗口跨度始终限制在 [min_window, max_window] 内。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{frontend::OdometrySeeds, global_types::FrameId, track_store::TrackStore};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum KeyframeSelectionError {
    #[error("keyframe span must be positive")]
    ZeroSpan,
    #[error("keyframe threshold must be positive, got {0}")]
    NonPositiveThreshold(f64),
    #[error("invalid window bounds [{min}, {max}]")]
    InvalidBounds { min: u32, max: u32 },
    #[error("window bounds [{min}, {max}] need max >= 2 * min - 1")]
    BoundsTooTight { min: u32, max: u32 },
    #[error("frames [{first}, {last}] are shorter than one window of {min} frames")]
    SequenceTooShort { first: FrameId, last: FrameId, min: u32 },
}

/// 规则可以参考的数据
#[derive(Debug, Clone, Copy)]
pub struct KeyframeEvidence<'a> {
    pub store: &'a TrackStore,
    pub seeds: &'a OdometrySeeds,
}

pub trait KeyframeRule {
    /// candidate 能否结束从 start 开始的窗口
    fn accept(&self, start: FrameId, candidate: FrameId, evidence: &KeyframeEvidence<'_>) -> bool;
}

/// 固定帧数
#[derive(Debug, Clone, Copy)]
pub struct FixedSpan {
    pub span: u32,
}

impl KeyframeRule for FixedSpan {
    fn accept(&self, start: FrameId, candidate: FrameId, _: &KeyframeEvidence<'_>) -> bool {
        candidate - start >= self.span
    }
}

/// 累计平移达到阈值
#[derive(Debug, Clone, Copy)]
pub struct Baseline {
    pub meters: f64,
}

impl KeyframeRule for Baseline {
    fn accept(&self, start: FrameId, candidate: FrameId, evidence: &KeyframeEvidence<'_>) -> bool {
        evidence.seeds.path_length(start, candidate) >= self.meters
    }
}

/// 与窗口起始帧的平均视差足够大，或者共视轨迹太少
#[derive(Debug, Clone, Copy)]
pub struct Parallax {
    pub min_pixels: f64,
    pub min_shared_tracks: usize,
}

impl KeyframeRule for Parallax {
    fn accept(&self, start: FrameId, candidate: FrameId, evidence: &KeyframeEvidence<'_>) -> bool {
        let shared = evidence.store.correspondences(start, candidate).len();
        if shared < self.min_shared_tracks {
            log::debug!(
                "frame {}: only {} tracks shared with {}",
                candidate,
                shared,
                start
            );
            return true;
        }
        evidence
            .store
            .mean_parallax(start, candidate)
            .map_or(true, |parallax| parallax >= self.min_pixels)
    }
}

/// 可配置的关键帧策略
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum KeyframePolicy {
    FixedSpan { span: u32 },
    Baseline { meters: f64 },
    Parallax { min_pixels: f64, min_shared_tracks: usize },
}

impl KeyframePolicy {
    pub fn validate(&self) -> Result<(), KeyframeSelectionError> {
        match *self {
            KeyframePolicy::FixedSpan { span } if span == 0 => Err(KeyframeSelectionError::ZeroSpan),
            KeyframePolicy::Baseline { meters: value }
            | KeyframePolicy::Parallax {
                min_pixels: value, ..
            } if !(value > 0.0 && value.is_finite()) => {
                Err(KeyframeSelectionError::NonPositiveThreshold(value))
            }
            _ => Ok(()),
        }
    }

    pub fn rule(&self) -> Box<dyn KeyframeRule + Send + Sync> {
        match *self {
            KeyframePolicy::FixedSpan { span } => Box::new(FixedSpan { span }),
            KeyframePolicy::Baseline { meters } => Box::new(Baseline { meters }),
            KeyframePolicy::Parallax {
                min_pixels,
                min_shared_tracks,
            } => Box::new(Parallax {
                min_pixels,
                min_shared_tracks,
            }),
        }
    }
}

/// 窗口跨度范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeBounds {
    pub min_window: u32,
    pub max_window: u32,
}

impl KeyframeBounds {
    pub fn new(min_window: u32, max_window: u32) -> Self {
        Self {
            min_window,
            max_window,
        }
    }

    /// max >= 2 * min - 1 保证任意长度的序列尾部都能被合法划分
    pub fn validate(&self) -> Result<(), KeyframeSelectionError> {
        let (min, max) = (self.min_window, self.max_window);
        if min == 0 || max < min {
            return Err(KeyframeSelectionError::InvalidBounds { min, max });
        }
        if max < 2 * min - 1 {
            return Err(KeyframeSelectionError::BoundsTooTight { min, max });
        }
        Ok(())
    }
}

/// 从 first 开始、以 last 结束的严格递增关键帧序列，相邻间隔在 bounds 内
pub fn choose_keyframes(
    rule: &dyn KeyframeRule,
    bounds: KeyframeBounds,
    first: FrameId,
    last: FrameId,
    evidence: &KeyframeEvidence<'_>,
) -> Result<Vec<FrameId>, KeyframeSelectionError> {
    bounds.validate()?;
    let (min, max) = (bounds.min_window, bounds.max_window);
    if last <= first || last - first < min {
        return Err(KeyframeSelectionError::SequenceTooShort { first, last, min });
    }

    let mut keyframes = vec![first];
    let mut current = first;
    while current < last {
        let lower = current + min;
        let upper = (current + max).min(last);
        let mut next = (lower..=upper)
            .find(|&candidate| rule.accept(current, candidate, evidence))
            .unwrap_or(upper);
        let remaining = last - next;
        if remaining > 0 && remaining < min {
            // 尾部太短，并入当前窗口或者提前结束
            next = if last - current <= max { last } else { last - min };
        }
        keyframes.push(next);
        current = next;
    }
    Ok(keyframes)
}
