/*! Client-facing descriptor types for the presentation facade.
 */

use bitflags::bitflags;

bitflags! {
    /// Behavior flags fixed per swap chain epoch.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SwapChainFlags: u32 {
        /// The application paces itself through the frame latency
        /// waitable instead of blocking inside `present`.
        const FRAME_LATENCY_WAITABLE = 1 << 0;
    }
}

bitflags! {
    /// Per-present flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PresentFlags: u32 {
        /// Only test whether presentation is currently possible.
        const TEST = 1 << 0;
    }
}

/// Color formats accepted for user back buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    #[default]
    Rgba8Unorm,
    Bgra8Unorm,
    Rgb10A2Unorm,
    Rgba16Float,
}

/// Presentation color spaces. `Other` carries an unrecognized value
/// straight through so callers can probe support for spaces this crate
/// has no dedicated handling for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorSpace {
    /// sRGB, gamma 2.2, BT.709 primaries.
    #[default]
    SrgbNonlinear,
    /// HDR10, ST.2084 PQ, BT.2020 primaries.
    Hdr10St2084,
    /// scRGB, linear gamma, BT.709 primaries.
    ScRgbLinear,
    Other(u32),
}

/// How user extents map onto the swapchain image during the blit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScalingMode {
    /// No stretch. The blit samples with a nearest filter into a
    /// viewport sized to the user extents.
    None,
    /// Stretch to the swapchain extents with a linear filter.
    #[default]
    Stretch,
}

/// Immutable swap chain description, replaced wholesale by
/// [`crate::SwapChain::change_properties`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub buffer_count: u32,
    pub flags: SwapChainFlags,
    pub scaling: ScalingMode,
}

impl SwapChainDesc {
    pub fn new(width: u32, height: u32, format: ImageFormat, buffer_count: u32) -> Self {
        Self {
            width,
            height,
            format,
            buffer_count,
            flags: SwapChainFlags::empty(),
            scaling: ScalingMode::default(),
        }
    }

    pub fn flags(mut self, flags: SwapChainFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn scaling(mut self, scaling: ScalingMode) -> Self {
        self.scaling = scaling;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HdrMetadataType {
    #[default]
    None,
    Hdr10,
}

/// HDR10 mastering metadata in the client API's integer encoding:
/// chromaticities in units of 0.00002, mastering luminance in units of
/// 0.0001 nits, light levels in whole nits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hdr10Metadata {
    pub red_primary: [u16; 2],
    pub green_primary: [u16; 2],
    pub blue_primary: [u16; 2],
    pub white_point: [u16; 2],
    pub max_mastering_luminance: u32,
    pub min_mastering_luminance: u32,
    pub max_content_light_level: u16,
    pub max_frame_average_light_level: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HdrMetadata {
    pub ty: HdrMetadataType,
    pub hdr10: Hdr10Metadata,
}

/// Outcome of a present call. Occlusion is not a failure; the
/// application is expected to keep presenting at a reduced rate until
/// the surface becomes visible again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Occluded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_builder_defaults() {
        let desc = SwapChainDesc::new(1920, 1080, ImageFormat::Rgba8Unorm, 2);
        assert_eq!(desc.flags, SwapChainFlags::empty());
        assert_eq!(desc.scaling, ScalingMode::Stretch);

        let desc = desc
            .flags(SwapChainFlags::FRAME_LATENCY_WAITABLE)
            .scaling(ScalingMode::None);
        assert!(desc.flags.contains(SwapChainFlags::FRAME_LATENCY_WAITABLE));
        assert_eq!(desc.scaling, ScalingMode::None);
    }

    #[test]
    fn hdr_metadata_defaults_to_none() {
        assert_eq!(HdrMetadata::default().ty, HdrMetadataType::None);
    }
}
