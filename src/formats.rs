// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Pixel-format capability queries.

This is the narrow slice of the adapter's format table that dynamic resources
need: bytes per texel (for linear layout) and whether a format is
block-compressed (which dynamic textures reject).
*/

/// The pixel formats a dynamic texture can carry, plus a couple of compressed
/// formats so creation can reject them meaningfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Bgra8Unorm,
    R32Float,
    Rgba16Float,
    Rgba32Float,
    Bc1Unorm,
    Bc3Unorm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatCaps {
    pub bytes_per_texel: u32,
    pub compressed: bool,
}

pub fn format_caps(format: PixelFormat) -> FormatCaps {
    use PixelFormat::*;
    match format {
        R8Unorm => FormatCaps {
            bytes_per_texel: 1,
            compressed: false,
        },
        Rg8Unorm => FormatCaps {
            bytes_per_texel: 2,
            compressed: false,
        },
        Rgba8Unorm | Bgra8Unorm | R32Float => FormatCaps {
            bytes_per_texel: 4,
            compressed: false,
        },
        Rgba16Float => FormatCaps {
            bytes_per_texel: 8,
            compressed: false,
        },
        Rgba32Float => FormatCaps {
            bytes_per_texel: 16,
            compressed: false,
        },
        //block sizes, not texel sizes; dynamic textures reject these anyway
        Bc1Unorm => FormatCaps {
            bytes_per_texel: 8,
            compressed: true,
        },
        Bc3Unorm => FormatCaps {
            bytes_per_texel: 16,
            compressed: true,
        },
    }
}

/// A fully resolved view description: whole resource, single subresource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureViewDesc {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}
