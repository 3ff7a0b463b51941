//! Periscope: live camera preview pipeline.
//!
//! Opens a camera through a host abstraction, presents its frames on a GPU
//! surface with orientation-aware scaling, and hands every frame the CPU path
//! can keep up with to a consumer as packed ARGB.

pub mod capture;
pub mod config;
pub mod convert;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod render;
pub mod shader;
pub mod testing;
pub mod utils;

pub use error::{PipelineError, Result};
