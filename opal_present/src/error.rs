use ash::vk;
use thiserror::Error;

/// Errors surfaced through the public facade. Failures inside the
/// present worker are never reported here; the worker absorbs them and
/// keeps the completion counters live instead.
#[derive(Debug, Error)]
pub enum SwapChainError {
    /// An argument was out of range or refers to an unsupported value.
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation is not legal in the swap chain's current state,
    /// e.g. changing properties while back-buffer references are still
    /// held by the application.
    #[error("operation not legal in current swap chain state")]
    InvalidCall,

    /// The operation is recognized but intentionally not supported.
    #[error("not implemented")]
    NotImplemented,

    /// Back-buffer reallocation failed; the previous configuration has
    /// been restored.
    #[error("back buffer allocation failed: {0:#}")]
    Allocation(anyhow::Error),

    /// A device-level failure outside the worker's absorb-and-continue
    /// path.
    #[error("device error: {0}")]
    Device(#[from] vk::Result),
}
