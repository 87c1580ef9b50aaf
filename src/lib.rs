//! GPU-accelerated, non-destructive image adjustment engine.
//!
//! The pipeline: per-channel tone curves compile into a combined 256-level
//! LUT ([`curve`]), a one-shot compute filter applies a kernel or that LUT
//! to an image ([`render::filter`]), freehand erase/restore strokes paint a
//! single-channel mask ([`mask`]), and a persistent renderer composites
//! original and filtered through the mask on every update
//! ([`render::blend`]). [`session`] wires these together behind a threaded
//! [`session::EditSession`] with bounded undo/redo ([`history`]) and a
//! drag-rate throttler ([`throttle`]).

pub mod config;
pub mod curve;
pub mod history;
pub mod mask;
pub mod render;
pub mod session;
pub mod throttle;

pub use config::EngineConfig;
pub use curve::{ControlPoint, Lut, LutCache, ToneCurves};
pub use history::History;
pub use mask::{Mask, MaskPainter, Stroke, StrokeMode};
pub use render::{BlendRenderer, RenderContext};
pub use session::{EditSession, SessionEvent};
pub use throttle::{ThrottleDecision, UpdateThrottler};
