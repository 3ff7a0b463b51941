//! Error taxonomy for the capture and presentation pipeline.

use std::time::Duration;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failures surfaced to the host.
///
/// Frame drops under backpressure and malformed plane data are not represented
/// here: they are lossy behavior, logged and skipped on the frame path.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// No capture device matches the requested facing, the device vanished, or
    /// the host refused access. Not retried.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The open/close gate could not be acquired in time. The caller may retry `open`.
    #[error("timed out after {0:?} waiting to lock camera opening")]
    Timeout(Duration),

    /// The host could not bind the output surfaces. The session stays closed
    /// until `open` is called again.
    #[error("capture session configuration failed: {0}")]
    SessionConfigurationFailed(String),

    /// The presentation program failed to compile or link. Unrecoverable.
    #[error("shader compilation failed: {0}")]
    ShaderCompileFailed(String),

    /// Any other GPU setup failure on the render thread.
    #[error("gpu error: {0}")]
    Gpu(String),
}

/// Errors reported by a camera host implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera not found: {0}")]
    NotFound(String),
    #[error("camera backend error: {0}")]
    Backend(String),
}

impl From<HostError> for PipelineError {
    fn from(err: HostError) -> Self {
        // Permission is negotiated by the host before the pipeline runs, so a
        // denial at this point means the device cannot be used.
        PipelineError::DeviceUnavailable(err.to_string())
    }
}

/// Plane data that cannot be converted with the given geometry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    #[error("{plane} plane holds {actual} bytes, geometry needs {required}")]
    PlaneTooShort {
        plane: &'static str,
        required: usize,
        actual: usize,
    },
    #[error("output buffer holds {actual} pixels, frame needs {required}")]
    OutputTooShort { required: usize, actual: usize },
    #[error("invalid stride geometry: {0}")]
    InvalidStride(String),
    #[error("expected 3 planes, got {0}")]
    MissingPlanes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_maps_to_device_unavailable() {
        let err: PipelineError = HostError::PermissionDenied.into();
        assert!(matches!(err, PipelineError::DeviceUnavailable(_)));
    }

    #[test]
    fn timeout_message_mentions_duration() {
        let err = PipelineError::Timeout(Duration::from_millis(2500));
        assert!(err.to_string().contains("2.5s"));
    }
}
