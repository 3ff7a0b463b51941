//! Render side: orientation, viewport fitting and the presenter that owns all
//! GPU state.

pub mod orientation;
pub mod presenter;
pub mod surface;
pub mod viewport;
pub mod window;

pub use orientation::{DisplayOrientation, DisplayRotation, OrientationTracker, RotationMatrix};
pub use presenter::{FramePresenter, PresenterState};
pub use surface::{ExternalSurface, FrameSignal, RenderRequester};
pub use viewport::{fit, ScaleType, ViewportFitter, ViewportRect};
pub use window::WindowTarget;
