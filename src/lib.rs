//! UViL - U-shaped Vision-LSTM for semantic segmentation
//!
//! A candle port of a U-Net style encoder/decoder whose stages are built
//! from bidirectional Vision-LSTM block pairs.
//! https://arxiv.org/abs/2406.04303

pub mod config;
pub mod embed;
pub mod norm;
pub mod patch;
pub mod stage;
pub mod uvil;
pub mod vil;

pub use config::{ConvKind, NormLayer, PatchEmbedInit, UViLConfig, ViLInit};
pub use embed::{VitPatchEmbed, VitPosEmbed2d};
pub use patch::{FinalPatchExpand4x, PatchExpand, PatchMerging};
pub use uvil::{SkipCache, UViL};
pub use vil::ViLBlockPair;
