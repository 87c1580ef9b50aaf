pub mod blend;
pub mod context;
pub mod filter;

pub use blend::BlendRenderer;
pub use context::RenderContext;
