#[cfg(feature = "serde-support")]
use serde::{Deserialize, Serialize};

/// Pixel formats the core needs to reason about. Full format metadata lives above this layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnFormat {
    Undefined,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R10G10B10A2Unorm,
    R16G16B16A16Float,
    R32Uint,
    R32Float,
    R32G32Float,
    R32G32B32Float,
    R32G32B32A32Float,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8Uint,
    Bc1RgbaUnorm,
    Bc3RgbaUnorm,
    Bc5RgUnorm,
    Bc7RgbaUnorm,
}

impl Default for KilnFormat {
    fn default() -> Self {
        KilnFormat::Undefined
    }
}

impl KilnFormat {
    pub fn is_undefined(self) -> bool {
        self == KilnFormat::Undefined
    }

    pub fn has_depth(self) -> bool {
        match self {
            KilnFormat::D16Unorm
            | KilnFormat::D24UnormS8Uint
            | KilnFormat::D32Float
            | KilnFormat::D32FloatS8Uint => true,
            _ => false,
        }
    }

    pub fn has_stencil(self) -> bool {
        match self {
            KilnFormat::D24UnormS8Uint | KilnFormat::D32FloatS8Uint => true,
            _ => false,
        }
    }

    pub fn is_depth_stencil(self) -> bool {
        self.has_depth() || self.has_stencil()
    }

    pub fn is_compressed(self) -> bool {
        match self {
            KilnFormat::Bc1RgbaUnorm
            | KilnFormat::Bc3RgbaUnorm
            | KilnFormat::Bc5RgUnorm
            | KilnFormat::Bc7RgbaUnorm => true,
            _ => false,
        }
    }

    pub fn is_srgb(self) -> bool {
        match self {
            KilnFormat::R8G8B8A8Srgb | KilnFormat::B8G8R8A8Srgb => true,
            _ => false,
        }
    }

    /// Width and height of a block. 1 for uncompressed formats.
    pub fn block_dimension(self) -> u32 {
        if self.is_compressed() {
            4
        } else {
            1
        }
    }

    /// Bytes per block (per pixel for uncompressed formats)
    pub fn block_size_in_bytes(self) -> u32 {
        match self {
            KilnFormat::Undefined => 0,
            KilnFormat::R8Unorm => 1,
            KilnFormat::R8G8Unorm | KilnFormat::D16Unorm => 2,
            KilnFormat::R8G8B8A8Unorm
            | KilnFormat::R8G8B8A8Srgb
            | KilnFormat::B8G8R8A8Unorm
            | KilnFormat::B8G8R8A8Srgb
            | KilnFormat::R10G10B10A2Unorm
            | KilnFormat::R32Uint
            | KilnFormat::R32Float
            | KilnFormat::D24UnormS8Uint
            | KilnFormat::D32Float => 4,
            KilnFormat::R16G16B16A16Float
            | KilnFormat::R32G32Float
            | KilnFormat::D32FloatS8Uint
            | KilnFormat::Bc1RgbaUnorm => 8,
            KilnFormat::R32G32B32Float => 12,
            KilnFormat::R32G32B32A32Float
            | KilnFormat::Bc3RgbaUnorm
            | KilnFormat::Bc5RgUnorm
            | KilnFormat::Bc7RgbaUnorm => 16,
        }
    }

    /// Tightly packed size of one row of blocks
    pub fn row_size_in_bytes(
        self,
        width: u32,
    ) -> u64 {
        let blocks = (width + self.block_dimension() - 1) / self.block_dimension();
        blocks as u64 * self.block_size_in_bytes() as u64
    }

    /// Number of block rows in an image of the given height
    pub fn row_count(
        self,
        height: u32,
    ) -> u32 {
        (height + self.block_dimension() - 1) / self.block_dimension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_sizes() {
        assert_eq!(256, KilnFormat::R8G8B8A8Unorm.row_size_in_bytes(64));
        assert_eq!(8, KilnFormat::Bc1RgbaUnorm.row_size_in_bytes(3));
        assert_eq!(2, KilnFormat::Bc7RgbaUnorm.row_count(5));
        assert_eq!(5, KilnFormat::R8Unorm.row_count(5));
    }

    #[test]
    fn test_depth_formats() {
        assert!(KilnFormat::D32Float.is_depth_stencil());
        assert!(!KilnFormat::D32Float.has_stencil());
        assert!(KilnFormat::D24UnormS8Uint.has_stencil());
        assert!(!KilnFormat::R32Float.is_depth_stencil());
    }
}
