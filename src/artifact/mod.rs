//! Artifact builders for live media.
//!
//! - [`squashfs`] - Compressed root filesystem images (mksquashfs)
//! - [`block_image`] - btrfs/ext4 whole-filesystem images
//! - [`checksum`] - SHA-512 sidecar files
//! - [`iso`] - Hybrid BIOS/UEFI ISO images (xorriso)

pub mod block_image;
pub mod checksum;
pub mod iso;
pub mod squashfs;
