/*! Format, color-space and HDR metadata conversion tables, plus the
 * surface format / present mode negotiation used when (re)creating the
 * underlying swapchain.
 */

use ash::vk;

use crate::types::{ColorSpace, Hdr10Metadata, ImageFormat};

pub(crate) fn vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::Rgb10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        ImageFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
    }
}

pub(crate) fn vk_color_space(color_space: ColorSpace) -> vk::ColorSpaceKHR {
    match color_space {
        ColorSpace::SrgbNonlinear => vk::ColorSpaceKHR::SRGB_NONLINEAR,
        ColorSpace::Hdr10St2084 => vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        ColorSpace::ScRgbLinear => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        ColorSpace::Other(value) => {
            log::warn!("Unhandled color space {:#x}, falling back to sRGB", value);
            vk::ColorSpaceKHR::SRGB_NONLINEAR
        }
    }
}

/// `UNDEFINED` acts as a wildcard for the 8-bit UNORM formats any sRGB
/// display can be expected to expose.
fn accept_format(candidate: vk::Format, requested: vk::Format) -> bool {
    if requested == vk::Format::UNDEFINED {
        matches!(
            candidate,
            vk::Format::R8G8B8A8_UNORM
                | vk::Format::B8G8R8A8_UNORM
                | vk::Format::A8B8G8R8_UNORM_PACK32
        )
    } else {
        candidate == requested
    }
}

fn find_surface_format(
    supported: &[vk::SurfaceFormatKHR],
    requested: vk::Format,
    color_space: vk::ColorSpaceKHR,
) -> Option<vk::SurfaceFormatKHR> {
    supported
        .iter()
        .find(|candidate| {
            accept_format(candidate.format, requested) && candidate.color_space == color_space
        })
        .copied()
}

/// Negotiates the swapchain surface format for a request. Exact matches
/// win. sRGB requests may fall back to any common 8-bit UNORM format,
/// since a swizzle is invisible through the blit. HDR requests get no
/// such fallback; presenting a mismatched HDR format would look
/// completely wrong, so we refuse and present nothing this epoch.
pub(crate) fn select_surface_format(
    supported: &[vk::SurfaceFormatKHR],
    format: ImageFormat,
    color_space: ColorSpace,
) -> Option<vk::SurfaceFormatKHR> {
    let requested = vk_format(format);
    let vk_space = vk_color_space(color_space);

    if let Some(found) = find_surface_format(supported, requested, vk_space) {
        return Some(found);
    }

    if vk_space == vk::ColorSpaceKHR::SRGB_NONLINEAR {
        find_surface_format(supported, vk::Format::UNDEFINED, vk_space)
    } else {
        None
    }
}

/// Swap interval over zero means FIFO. Tearing presents prefer
/// IMMEDIATE with MAILBOX as the fallback; if neither is available the
/// current iteration gives up rather than silently introducing vsync.
pub(crate) fn select_present_mode(
    supported: &[vk::PresentModeKHR],
    swap_interval: u32,
) -> Option<vk::PresentModeKHR> {
    let wanted = if swap_interval > 0 {
        vk::PresentModeKHR::FIFO
    } else {
        vk::PresentModeKHR::IMMEDIATE
    };

    if supported.contains(&wanted) {
        return Some(wanted);
    }
    if wanted == vk::PresentModeKHR::IMMEDIATE && supported.contains(&vk::PresentModeKHR::MAILBOX) {
        return Some(vk::PresentModeKHR::MAILBOX);
    }
    None
}

fn convert_xy_color(color: [u16; 2]) -> vk::XYColorEXT {
    vk::XYColorEXT {
        x: color[0] as f32 / 50000.0,
        y: color[1] as f32 / 50000.0,
    }
}

/// Mastering luminance is documented as whole nits, which contradicts
/// the HEVC standard the format claims to mirror. Keep the literal
/// interpretation for the maximum and the 0.0001-nit units for the
/// minimum.
fn convert_max_luminance(luminance: u32) -> f32 {
    luminance as f32
}

fn convert_min_luminance(luminance: u32) -> f32 {
    luminance as f32 / 0.0001
}

fn convert_level(level: u16) -> f32 {
    level as f32
}

pub(crate) fn convert_hdr_metadata_hdr10(metadata: &Hdr10Metadata) -> vk::HdrMetadataEXT<'static> {
    vk::HdrMetadataEXT::default()
        .display_primary_red(convert_xy_color(metadata.red_primary))
        .display_primary_green(convert_xy_color(metadata.green_primary))
        .display_primary_blue(convert_xy_color(metadata.blue_primary))
        .white_point(convert_xy_color(metadata.white_point))
        .max_luminance(convert_max_luminance(metadata.max_mastering_luminance))
        .min_luminance(convert_min_luminance(metadata.min_mastering_luminance))
        .max_content_light_level(convert_level(metadata.max_content_light_level))
        .max_frame_average_light_level(convert_level(metadata.max_frame_average_light_level))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn color_space_table() {
        assert_eq!(
            vk_color_space(ColorSpace::SrgbNonlinear),
            vk::ColorSpaceKHR::SRGB_NONLINEAR
        );
        assert_eq!(
            vk_color_space(ColorSpace::Hdr10St2084),
            vk::ColorSpaceKHR::HDR10_ST2084_EXT
        );
        assert_eq!(
            vk_color_space(ColorSpace::ScRgbLinear),
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT
        );
        assert_eq!(
            vk_color_space(ColorSpace::Other(0xdead)),
            vk::ColorSpaceKHR::SRGB_NONLINEAR
        );
    }

    #[test]
    fn exact_format_match_wins() {
        let supported = [
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let selected =
            select_surface_format(&supported, ImageFormat::Rgba8Unorm, ColorSpace::SrgbNonlinear)
                .unwrap();
        assert_eq!(selected.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn srgb_falls_back_to_compatible_unorm() {
        let supported = [surface_format(
            vk::Format::B8G8R8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        let selected = select_surface_format(
            &supported,
            ImageFormat::Rgb10A2Unorm,
            ColorSpace::SrgbNonlinear,
        )
        .unwrap();
        assert_eq!(selected.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn hdr_mismatch_is_refused() {
        let supported = [
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(
                vk::Format::R16G16B16A16_SFLOAT,
                vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            ),
        ];
        assert!(select_surface_format(
            &supported,
            ImageFormat::Rgb10A2Unorm,
            ColorSpace::Hdr10St2084
        )
        .is_none());
    }

    #[test]
    fn format_selection_is_idempotent() {
        let supported = [
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let first =
            select_surface_format(&supported, ImageFormat::Bgra8Unorm, ColorSpace::SrgbNonlinear);
        let second =
            select_surface_format(&supported, ImageFormat::Bgra8Unorm, ColorSpace::SrgbNonlinear);
        assert_eq!(first, second);
    }

    #[test]
    fn present_mode_selection() {
        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&fifo_only, 1),
            Some(vk::PresentModeKHR::FIFO)
        );
        assert_eq!(select_present_mode(&fifo_only, 0), None);

        let with_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            select_present_mode(&with_mailbox, 0),
            Some(vk::PresentModeKHR::MAILBOX)
        );

        let with_immediate = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            select_present_mode(&with_immediate, 0),
            Some(vk::PresentModeKHR::IMMEDIATE)
        );
        assert_eq!(
            select_present_mode(&with_immediate, 4),
            Some(vk::PresentModeKHR::FIFO)
        );
    }

    #[test]
    fn hdr10_conversion_is_bit_exact() {
        let metadata = Hdr10Metadata {
            red_primary: [34000, 16000],
            green_primary: [13250, 34500],
            blue_primary: [7500, 3000],
            white_point: [15635, 16450],
            max_mastering_luminance: 1000,
            min_mastering_luminance: 50,
            max_content_light_level: 1000,
            max_frame_average_light_level: 400,
        };
        let converted = convert_hdr_metadata_hdr10(&metadata);

        assert_eq!(converted.display_primary_red.x, 34000.0 / 50000.0);
        assert_eq!(converted.display_primary_red.y, 16000.0 / 50000.0);
        assert_eq!(converted.display_primary_green.x, 13250.0 / 50000.0);
        assert_eq!(converted.display_primary_blue.y, 3000.0 / 50000.0);
        assert_eq!(converted.white_point.x, 15635.0 / 50000.0);
        assert_eq!(converted.max_luminance, 1000.0);
        assert_eq!(converted.min_luminance, 50.0 / 0.0001);
        assert_eq!(converted.max_content_light_level, 1000.0);
        assert_eq!(converted.max_frame_average_light_level, 400.0);
    }
}
