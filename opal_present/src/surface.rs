use std::sync::Arc;

use anyhow::{bail, Result};
use ash::{khr, vk};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::{device::Device, format, types::ColorSpace};

pub(crate) struct Surface {
    fns: khr::surface::Instance,
    pub(crate) raw: vk::SurfaceKHR,
    /// Supported `{format, color space}` pairs, queried once up front.
    pub(crate) formats: Vec<vk::SurfaceFormatKHR>,
    device: Arc<Device>,
}

impl Surface {
    /// Fails when the graphics queue family cannot present to the
    /// window; a facade without presentation support is useless.
    pub(crate) fn new(
        device: Arc<Device>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        let fns = khr::surface::Instance::new(&device.instance.entry, &device.instance.raw);
        let raw = unsafe {
            ash_window::create_surface(
                &device.instance.entry,
                &device.instance.raw,
                display_handle,
                window_handle,
                None,
            )?
        };

        let supported = unsafe {
            fns.get_physical_device_surface_support(
                device.physical_device.raw,
                device.graphics_family_index,
                raw,
            )
        };
        match supported {
            Ok(true) => {}
            Ok(false) => {
                unsafe { fns.destroy_surface(raw, None) };
                bail!(
                    "Queue family {} has no present support for this surface",
                    device.graphics_family_index
                );
            }
            Err(e) => {
                unsafe { fns.destroy_surface(raw, None) };
                return Err(e.into());
            }
        }

        let formats = unsafe {
            fns.get_physical_device_surface_formats(device.physical_device.raw, raw)?
        };

        Ok(Self {
            fns,
            raw,
            formats,
            device,
        })
    }

    pub(crate) fn capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        let capabilities = unsafe {
            self.fns
                .get_physical_device_surface_capabilities(self.device.physical_device.raw, self.raw)?
        };
        Ok(capabilities)
    }

    pub(crate) fn present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        let present_modes = unsafe {
            self.fns
                .get_physical_device_surface_present_modes(self.device.physical_device.raw, self.raw)?
        };
        Ok(present_modes)
    }

    pub(crate) fn supports_color_space(&self, color_space: ColorSpace) -> bool {
        let vk_color_space = format::vk_color_space(color_space);
        self.formats
            .iter()
            .any(|surface_format| surface_format.color_space == vk_color_space)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.fns.destroy_surface(self.raw, None);
        }
    }
}

/// Win32 quirk: minimized windows report zero maximum extents, and
/// swapchain creation against them fails. This is the occlusion signal.
pub(crate) fn max_extent_is_zero(capabilities: &vk::SurfaceCapabilitiesKHR) -> bool {
    capabilities.max_image_extent.width == 0 || capabilities.max_image_extent.height == 0
}

/// Some window systems leave the current extent unspecified until the
/// first swapchain exists. Never the case on Win32.
pub(crate) fn current_extent_is_unspecified(capabilities: &vk::SurfaceCapabilitiesKHR) -> bool {
    capabilities.current_extent.width == u32::MAX
        || capabilities.current_extent.height == u32::MAX
}

/// Starts from the current extent and clamps into the supported range.
pub(crate) fn clamp_extent(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: capabilities
            .current_extent
            .width
            .clamp(min.width, max.width),
        height: capabilities
            .current_extent
            .height
            .clamp(min.height, max.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn zero_max_extent_means_occluded() {
        assert!(max_extent_is_zero(&capabilities((0, 0), (0, 0), (0, 0))));
        assert!(max_extent_is_zero(&capabilities((100, 100), (1, 1), (100, 0))));
        assert!(!max_extent_is_zero(&capabilities(
            (100, 100),
            (1, 1),
            (4096, 4096)
        )));
    }

    #[test]
    fn unspecified_current_extent_is_detected() {
        assert!(current_extent_is_unspecified(&capabilities(
            (u32::MAX, u32::MAX),
            (1, 1),
            (4096, 4096)
        )));
        assert!(!current_extent_is_unspecified(&capabilities(
            (1920, 1080),
            (1, 1),
            (4096, 4096)
        )));
    }

    #[test]
    fn extent_clamps_into_supported_range() {
        let clamped = clamp_extent(&capabilities((8192, 10), (32, 32), (4096, 4096)));
        assert_eq!(clamped, vk::Extent2D { width: 4096, height: 32 });

        let untouched = clamp_extent(&capabilities((1920, 1080), (1, 1), (4096, 4096)));
        assert_eq!(
            untouched,
            vk::Extent2D {
                width: 1920,
                height: 1080
            }
        );
    }
}
