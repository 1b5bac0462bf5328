//! Texture loading from files.
//!
//! Decoded images become 2D RGBA8 textures, optionally mipmapped. Raw
//! volumes are 16-bit scalar fields with a `.info` sidecar file carrying the
//! comma-separated dimensions.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::texture::GpuTexture;
use glam::UVec3;
use std::path::Path;
use std::sync::Arc;
use vista_core::texture::{ElementKind, FilteringMode, Texture};

/// Number of mip levels to generate for a 2D texture.
///
/// One level per halving of the smaller axis, stopping before a level would
/// drop below 2 px (matching where mip generation stops blitting).
pub fn mip_levels_for(width: u32, height: u32) -> u32 {
    let d = width.min(height).max(1);
    let mut levels = 1;
    while (d >> levels) >= 2 {
        levels += 1;
    }
    levels
}

/// Parse `.info` sidecar dimensions of the form `x,y,z`.
fn parse_dimensions(line: &str) -> Result<UVec3> {
    let parts: Vec<u32> = line
        .trim()
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| GpuError::Other(format!("Malformed volume dimensions: {e}")))?;

    if parts.len() != 3 || parts.contains(&0) {
        return Err(GpuError::Other(format!(
            "Expected three non-zero volume dimensions, got {line:?}"
        )));
    }

    Ok(UVec3::new(parts[0], parts[1], parts[2]))
}

/// Load an image file as a 2D RGBA8 texture and upload it.
pub fn load_texture(
    ctx: &Arc<GpuContext>,
    path: impl AsRef<Path>,
    linear_min: bool,
    linear_max: bool,
    generate_mipmaps: bool,
) -> Result<(Arc<Texture>, GpuTexture)> {
    let path = path.as_ref();
    tracing::debug!(
        "Loading{} texture from {}",
        if generate_mipmaps { " mipmapped" } else { "" },
        path.display()
    );

    let decoded = image::open(path)
        .map_err(|e| GpuError::Other(format!("Failed to decode {}: {e}", path.display())))?
        .to_rgba8();
    let (width, height) = decoded.dimensions();
    let data = decoded.into_raw();

    let mut descriptor = Texture::new(
        UVec3::new(width, height, 1),
        4,
        ElementKind::UInt8,
        Some(data.clone()),
    );
    descriptor.mipmap = generate_mipmaps;
    descriptor.min_filter = if linear_min {
        FilteringMode::Linear
    } else {
        FilteringMode::NearestNeighbour
    };
    descriptor.max_filter = if linear_max {
        FilteringMode::Linear
    } else {
        FilteringMode::NearestNeighbour
    };
    let descriptor = Arc::new(descriptor);

    let mip_levels = if generate_mipmaps {
        mip_levels_for(width, height)
    } else {
        1
    };

    let mut texture = GpuTexture::new(ctx, &descriptor, mip_levels)?;
    texture.copy_from(&data)?;

    Ok((descriptor, texture))
}

/// Load a raw 16-bit volume with a `.info` sidecar file and upload it.
pub fn load_raw_volume(
    ctx: &Arc<GpuContext>,
    path: impl AsRef<Path>,
) -> Result<(Arc<Texture>, GpuTexture)> {
    let path = path.as_ref();
    let info_path = path.with_extension("info");

    let info = std::fs::read_to_string(&info_path)?;
    let first_line = info.lines().next().ok_or_else(|| {
        GpuError::Other(format!("Empty volume info file {}", info_path.display()))
    })?;
    let dimensions = parse_dimensions(first_line)?;

    let data = std::fs::read(path)?;
    let expected = dimensions.x as usize * dimensions.y as usize * dimensions.z as usize * 2;
    if data.len() < expected {
        return Err(GpuError::Other(format!(
            "Volume {} holds {} bytes, expected {expected}",
            path.display(),
            data.len()
        )));
    }

    let mut descriptor = Texture::new(dimensions, 1, ElementKind::UInt16, Some(data.clone()));
    descriptor.normalized = false;
    descriptor.mipmap = false;
    let descriptor = Arc::new(descriptor);

    let mut texture = GpuTexture::new(ctx, &descriptor, 1)?;
    texture.copy_from(&data[..expected])?;

    Ok((descriptor, texture))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_levels_stop_above_two_pixels() {
        assert_eq!(mip_levels_for(2, 2), 1);
        assert_eq!(mip_levels_for(4, 4), 2);
        assert_eq!(mip_levels_for(256, 256), 8);
        // The smaller axis bounds the chain.
        assert_eq!(mip_levels_for(256, 16), 4);
        assert_eq!(mip_levels_for(1, 1), 1);
    }

    #[test]
    fn volume_dimensions_parse() {
        assert_eq!(parse_dimensions("64,32,16").unwrap(), UVec3::new(64, 32, 16));
        assert_eq!(
            parse_dimensions(" 128 , 128 , 64 ").unwrap(),
            UVec3::new(128, 128, 64)
        );

        assert!(parse_dimensions("64,32").is_err());
        assert!(parse_dimensions("64,32,0").is_err());
        assert!(parse_dimensions("sixty,four,teen").is_err());
    }
}
