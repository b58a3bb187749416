/*! DXGI-style presentation swapchain layered on Vulkan WSI.
 *
 * The crate exposes a [`swapchain::SwapChain`] facade with user-owned back
 * buffers and discrete present calls. Each present is handed off to the
 * command queue's worker thread, which drives the Vulkan
 * acquire/blit/present machinery and recreates the underlying
 * `VkSwapchainKHR` whenever the surface changes underneath us. Frame
 * latency is reported back to the application through a counting
 * semaphore, paced either by `VK_KHR_present_wait` or by a timeline
 * fence on the queue.
 */

pub mod device;
pub mod error;
pub mod format;
pub mod latency;
pub mod meta;
pub mod present;
pub mod queue;
pub mod resource;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod types;
pub mod waiter;

/// External dependencies exposed outside of current crate.
pub use ash::{self, vk};
pub use gpu_allocator;
pub use raw_window_handle;

pub use device::Device;
pub use error::SwapChainError;
pub use queue::CommandQueue;
pub use resource::BackBufferImage;
pub use swapchain::SwapChain;
pub use sync::LatencySemaphore;
pub use types::{
    ColorSpace, Hdr10Metadata, HdrMetadata, HdrMetadataType, ImageFormat, PresentFlags,
    PresentStatus, ScalingMode, SwapChainDesc, SwapChainFlags,
};

/// Upper bound on user back buffers, request-ring entries and latency tokens.
pub const MAX_SWAP_CHAIN_BUFFERS: usize = 16;
