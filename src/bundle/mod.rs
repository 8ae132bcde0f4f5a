//! 滑动窗口光束法平差
mod keyframes;
mod orchestrator;
mod window;

pub use keyframes::{
    choose_keyframes, Baseline, FixedSpan, KeyframeBounds, KeyframeEvidence, KeyframePolicy,
    KeyframeRule, KeyframeSelectionError, Parallax,
};
pub use orchestrator::{BundleAdjustment, BundleAdjustmentResult, GlobalLandmark, WindowReport};
pub use window::{BundleWindow, WindowContext, WindowError, WindowOutput};
