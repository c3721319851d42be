//! Pure functions deriving region boundaries from a superblock's totals.
//!
//! None of these take a `BlockDevice`: they operate entirely on the counts
//! already validated by `Superblock::is_consistent`, which keeps them cheap
//! to call from both the engine and its tests.

use crate::superblock::Superblock;

/// The block holding the superblock.
pub const SUPERBLOCK_BLOCK: u32 = 0;

/// The first block of the inode table.
pub fn inode_region_start() -> u32 {
	1
}

/// One past the last block of the inode table; the first data block.
pub fn data_region_start(sb: &Superblock) -> u32 {
	inode_region_start() + sb.inode_blocks
}

/// The first block of the reserved free-map region.
pub fn map_region_start(sb: &Superblock) -> u32 {
	sb.blocks - sb.map_blocks
}

/// Returns the inode-table block index (0-based within the inode region)
/// and in-block slot for inumber `n`.
pub fn inode_location(n: u32) -> (u32, u32) {
	(
		n / crate::superblock::INODES_PER_BLOCK,
		n % crate::superblock::INODES_PER_BLOCK,
	)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn regions_are_contiguous_and_ordered() {
		let sb = Superblock::new(100);
		let inode_start = inode_region_start();
		let data_start = data_region_start(&sb);
		let map_start = map_region_start(&sb);

		assert_eq!(inode_start, 1);
		assert_eq!(data_start, 1 + sb.inode_blocks);
		assert!(data_start < map_start);
		assert!(map_start < sb.blocks);
	}

	#[test]
	fn inode_location_matches_per_block_count() {
		assert_eq!(inode_location(0), (0, 0));
		assert_eq!(
			inode_location(crate::superblock::INODES_PER_BLOCK),
			(1, 0)
		);
		assert_eq!(
			inode_location(crate::superblock::INODES_PER_BLOCK + 3),
			(1, 3)
		);
	}
}
