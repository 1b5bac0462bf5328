//! Format and layout translation tables.
//!
//! Pure mappings between the scene-side pixel description and Vulkan format
//! identifiers, plus the finite table of legal image layout transitions.
//! Unlisted transition pairs are rejected, never guessed.

use crate::error::{GpuError, Result};
use ash::vk;
use vista_core::texture::{BorderColor, ElementKind, FilteringMode, RepeatMode};

/// Map an element kind and channel count to a Vulkan format.
///
/// Three-channel data is promoted to the four-channel format; the upload
/// path pads the bytes to match (see [`pad_three_channel`]). Unsupported
/// combinations fall back to `R8G8B8A8_UNORM` with a loud warning so the
/// application can keep rendering something.
pub fn format_for(element: ElementKind, channels: u32, normalized: bool) -> vk::Format {
    use vk::Format as F;

    match (element, channels, normalized) {
        (ElementKind::Int8, 1, true) => F::R8_SNORM,
        (ElementKind::Int8, 2, true) => F::R8G8_SNORM,
        (ElementKind::Int8, 3 | 4, true) => F::R8G8B8A8_SNORM,
        (ElementKind::Int8, 1, false) => F::R8_SINT,
        (ElementKind::Int8, 2, false) => F::R8G8_SINT,
        (ElementKind::Int8, 3 | 4, false) => F::R8G8B8A8_SINT,

        (ElementKind::UInt8, 1, true) => F::R8_UNORM,
        (ElementKind::UInt8, 2, true) => F::R8G8_UNORM,
        (ElementKind::UInt8, 3 | 4, true) => F::R8G8B8A8_UNORM,
        (ElementKind::UInt8, 1, false) => F::R8_UINT,
        (ElementKind::UInt8, 2, false) => F::R8G8_UINT,
        (ElementKind::UInt8, 3 | 4, false) => F::R8G8B8A8_UINT,

        (ElementKind::Int16, 1, true) => F::R16_SNORM,
        (ElementKind::Int16, 2, true) => F::R16G16_SNORM,
        (ElementKind::Int16, 3 | 4, true) => F::R16G16B16A16_SNORM,
        (ElementKind::Int16, 1, false) => F::R16_SINT,
        (ElementKind::Int16, 2, false) => F::R16G16_SINT,
        (ElementKind::Int16, 3 | 4, false) => F::R16G16B16A16_SINT,

        (ElementKind::UInt16, 1, true) => F::R16_UNORM,
        (ElementKind::UInt16, 2, true) => F::R16G16_UNORM,
        (ElementKind::UInt16, 3 | 4, true) => F::R16G16B16A16_UNORM,
        (ElementKind::UInt16, 1, false) => F::R16_UINT,
        (ElementKind::UInt16, 2, false) => F::R16G16_UINT,
        (ElementKind::UInt16, 3 | 4, false) => F::R16G16B16A16_UINT,

        // 32-bit integer formats have no normalized variant.
        (ElementKind::Int32, 1, _) => F::R32_SINT,
        (ElementKind::Int32, 2, _) => F::R32G32_SINT,
        (ElementKind::Int32, 3 | 4, _) => F::R32G32B32A32_SINT,

        (ElementKind::UInt32, 1, _) => F::R32_UINT,
        (ElementKind::UInt32, 2, _) => F::R32G32_UINT,
        (ElementKind::UInt32, 3 | 4, _) => F::R32G32B32A32_UINT,

        (ElementKind::Float32, 1, _) => F::R32_SFLOAT,
        (ElementKind::Float32, 2, _) => F::R32G32_SFLOAT,
        (ElementKind::Float32, 3 | 4, _) => F::R32G32B32A32_SFLOAT,

        _ => {
            tracing::warn!(
                "Unsupported texture format: {element:?} with {channels} channels, \
                 falling back to R8G8B8A8_UNORM"
            );
            F::R8G8B8A8_UNORM
        }
    }
}

/// Access masks for a legal layout transition.
///
/// The table is finite and explicit; pairs outside it are unsupported and
/// rejected with [`GpuError::UnsupportedTransition`].
pub fn transition_access_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> Result<(vk::AccessFlags, vk::AccessFlags)> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;

    let masks = match (old_layout, new_layout) {
        (L::PREINITIALIZED, L::TRANSFER_SRC_OPTIMAL) => (A::HOST_WRITE, A::TRANSFER_READ),
        (L::PREINITIALIZED, L::TRANSFER_DST_OPTIMAL) => (A::HOST_WRITE, A::TRANSFER_WRITE),
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (A::empty(), A::TRANSFER_WRITE),
        (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL) => (A::empty(), A::SHADER_READ),
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (A::empty(), A::COLOR_ATTACHMENT_WRITE),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ)
        }
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => (A::TRANSFER_WRITE, A::TRANSFER_READ),
        (L::TRANSFER_DST_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::COLOR_ATTACHMENT_WRITE)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_READ, A::SHADER_READ)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => {
            (A::TRANSFER_READ, A::COLOR_ATTACHMENT_WRITE)
        }
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::SHADER_READ, A::TRANSFER_READ)
        }
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            (A::INPUT_ATTACHMENT_READ, A::TRANSFER_WRITE)
        }
        (L::COLOR_ATTACHMENT_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            (A::COLOR_ATTACHMENT_WRITE, A::TRANSFER_WRITE)
        }
        (L::COLOR_ATTACHMENT_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::COLOR_ATTACHMENT_WRITE, A::TRANSFER_READ)
        }
        (from, to) => return Err(GpuError::UnsupportedTransition { from, to }),
    };

    Ok(masks)
}

/// Pipeline stage pair matching a layout transition.
///
/// The source stage is derived from the layout the image leaves, the
/// destination stage from the layout it enters.
pub fn transition_stage_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
    (stage_for(old_layout), stage_for(new_layout))
}

fn stage_for(layout: vk::ImageLayout) -> vk::PipelineStageFlags {
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    match layout {
        L::PREINITIALIZED | L::UNDEFINED => S::HOST,
        L::TRANSFER_SRC_OPTIMAL | L::TRANSFER_DST_OPTIMAL => S::TRANSFER,
        L::SHADER_READ_ONLY_OPTIMAL => S::FRAGMENT_SHADER,
        L::COLOR_ATTACHMENT_OPTIMAL => S::COLOR_ATTACHMENT_OUTPUT,
        _ => S::TOP_OF_PIPE,
    }
}

/// Full-opacity alpha sentinel for an element kind, little-endian, sized to
/// the element's byte width.
pub const fn opaque_alpha(element: ElementKind) -> &'static [u8] {
    match element {
        ElementKind::Int8 | ElementKind::UInt8 => &[0xFF],
        ElementKind::Int16 | ElementKind::UInt16 => &[0xFF, 0xFF],
        ElementKind::Int32 | ElementKind::UInt32 => &[0xFF, 0xFF, 0xFF, 0xFF],
        // 1.0f32
        ElementKind::Float32 => &[0x00, 0x00, 0x80, 0x3F],
        // 1.0f64
        ElementKind::Float64 => &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF0, 0x3F],
    }
}

/// Expand tightly-packed 3-channel data to 4 channels by appending an opaque
/// alpha value after every texel.
///
/// Most device formats have no fully-featured 3-channel storage variant, so
/// RGB sources are never uploaded directly. The result is `len / 3 * 4`
/// bytes; any trailing partial texel is dropped.
pub fn pad_three_channel(data: &[u8], element: ElementKind) -> Vec<u8> {
    let texel = element.byte_width() * 3;
    let alpha = opaque_alpha(element);
    let mut padded = Vec::with_capacity(data.len() / 3 * 4);

    for chunk in data.chunks_exact(texel) {
        padded.extend_from_slice(chunk);
        padded.extend_from_slice(alpha);
    }

    padded
}

/// Map a repeat mode to a sampler address mode.
pub const fn address_mode(mode: RepeatMode) -> vk::SamplerAddressMode {
    match mode {
        RepeatMode::Repeat => vk::SamplerAddressMode::REPEAT,
        RepeatMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        RepeatMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        RepeatMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

/// Map a border color to its sampler variant.
///
/// Integer element kinds use the int border variants.
pub const fn border_color(color: BorderColor, element: ElementKind) -> vk::BorderColor {
    let float = matches!(element, ElementKind::Float32 | ElementKind::Float64);
    match (color, float) {
        (BorderColor::TransparentBlack, true) => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        (BorderColor::TransparentBlack, false) => vk::BorderColor::INT_TRANSPARENT_BLACK,
        (BorderColor::OpaqueBlack, true) => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        (BorderColor::OpaqueBlack, false) => vk::BorderColor::INT_OPAQUE_BLACK,
        (BorderColor::OpaqueWhite, true) => vk::BorderColor::FLOAT_OPAQUE_WHITE,
        (BorderColor::OpaqueWhite, false) => vk::BorderColor::INT_OPAQUE_WHITE,
    }
}

/// Map a filtering mode to a sampler filter.
pub const fn filter(mode: FilteringMode) -> vk::Filter {
    match mode {
        FilteringMode::NearestNeighbour => vk::Filter::NEAREST,
        FilteringMode::Linear => vk::Filter::LINEAR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_channel_sources_promote_to_four_channel_formats() {
        assert_eq!(
            format_for(ElementKind::UInt8, 3, true),
            vk::Format::R8G8B8A8_UNORM
        );
        assert_eq!(
            format_for(ElementKind::UInt16, 3, true),
            vk::Format::R16G16B16A16_UNORM
        );
        assert_eq!(
            format_for(ElementKind::Float32, 3, false),
            vk::Format::R32G32B32A32_SFLOAT
        );
    }

    #[test]
    fn normalized_flag_switches_integer_formats() {
        assert_eq!(format_for(ElementKind::UInt16, 1, true), vk::Format::R16_UNORM);
        assert_eq!(format_for(ElementKind::UInt16, 1, false), vk::Format::R16_UINT);
        // 32-bit integers only have the non-normalized variants.
        assert_eq!(format_for(ElementKind::UInt32, 1, true), vk::Format::R32_UINT);
    }

    #[test]
    fn unsupported_combinations_fall_back_to_default() {
        assert_eq!(
            format_for(ElementKind::Float64, 4, true),
            vk::Format::R8G8B8A8_UNORM
        );
        assert_eq!(
            format_for(ElementKind::UInt8, 7, true),
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn upload_transitions_are_in_the_table() {
        let (src, dst) = transition_access_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src, vk::AccessFlags::empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);

        let (src, dst) = transition_access_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn unlisted_transition_pairs_are_rejected() {
        let result = transition_access_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::PREINITIALIZED,
        );
        assert!(matches!(
            result,
            Err(GpuError::UnsupportedTransition { .. })
        ));
    }

    #[test]
    fn alpha_sentinels_match_element_widths() {
        for element in [
            ElementKind::Int8,
            ElementKind::UInt8,
            ElementKind::Int16,
            ElementKind::UInt16,
            ElementKind::Int32,
            ElementKind::UInt32,
            ElementKind::Float32,
            ElementKind::Float64,
        ] {
            assert_eq!(opaque_alpha(element).len(), element.byte_width());
        }

        assert_eq!(opaque_alpha(ElementKind::Float32), &1.0f32.to_le_bytes());
        assert_eq!(opaque_alpha(ElementKind::Float64), &1.0f64.to_le_bytes());
    }

    #[test]
    fn padding_inserts_opaque_alpha_after_every_texel() {
        // Two RGB texels of u8 data.
        let data = [10, 20, 30, 40, 50, 60];
        let padded = pad_three_channel(&data, ElementKind::UInt8);
        assert_eq!(padded, vec![10, 20, 30, 0xFF, 40, 50, 60, 0xFF]);

        // One RGB texel of u16 data.
        let data = [1, 2, 3, 4, 5, 6];
        let padded = pad_three_channel(&data, ElementKind::UInt16);
        assert_eq!(padded, vec![1, 2, 3, 4, 5, 6, 0xFF, 0xFF]);
    }

    #[test]
    fn padded_float_texels_carry_unit_alpha() {
        let texels: [f32; 6] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let bytes: &[u8] = bytemuck::cast_slice(&texels);

        let padded = pad_three_channel(bytes, ElementKind::Float32);
        let padded_texels: Vec<f32> = bytemuck::pod_collect_to_vec(&padded);

        assert_eq!(padded_texels, vec![0.1, 0.2, 0.3, 1.0, 0.4, 0.5, 0.6, 1.0]);
    }

    #[test]
    fn border_colors_use_int_variants_for_integer_elements() {
        assert_eq!(
            border_color(BorderColor::OpaqueWhite, ElementKind::Float32),
            vk::BorderColor::FLOAT_OPAQUE_WHITE
        );
        assert_eq!(
            border_color(BorderColor::OpaqueWhite, ElementKind::UInt8),
            vk::BorderColor::INT_OPAQUE_WHITE
        );
    }
}
