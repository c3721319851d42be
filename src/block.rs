//! A typed view over a disk image file providing fixed-size block I/O.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

/// The number of bytes per block.
pub const BLOCK_SIZE: usize = 512;

/// A single block's worth of bytes.
pub type BlockBuf = [u8; BLOCK_SIZE];

/// A block-addressed view over an image file.
///
/// `BlockDevice` performs no caching: every `read`/`write` round-trips to
/// the underlying file. Bounds are checked against the block count declared
/// at `open` time, not against the file's actual length.
pub struct BlockDevice {
	file: File,
	blocks: u32,
	mounts: u32,
	reads: u64,
	writes: u64,
}

impl BlockDevice {
	/// Opens the image at `path`, creating it if it doesn't exist yet.
	///
	/// `blocks` is the declared block count of the image; it is not derived
	/// from the file's length.
	pub fn open(path: &Path, blocks: u32) -> io::Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(path)?;
		Ok(Self {
			file,
			blocks,
			mounts: 0,
			reads: 0,
			writes: 0,
		})
	}

	/// Returns the declared number of blocks in the image.
	pub fn size(&self) -> u32 {
		self.blocks
	}

	/// Increments the mount counter.
	pub fn mount(&mut self) {
		self.mounts += 1;
	}

	/// Decrements the mount counter, saturating at zero.
	pub fn unmount(&mut self) {
		if self.mounts > 0 {
			self.mounts -= 1;
		}
	}

	/// Tells whether the device is currently mounted by at least one engine.
	pub fn mounted(&self) -> bool {
		self.mounts > 0
	}

	fn check_bounds(&self, block: u32) -> io::Result<()> {
		if block >= self.blocks {
			return Err(io::Error::new(
				io::ErrorKind::InvalidInput,
				format!("block {block} is out of range (0..{})", self.blocks),
			));
		}
		Ok(())
	}

	/// Reads block `block` in full into `buf`.
	pub fn read_block(&mut self, block: u32, buf: &mut BlockBuf) -> io::Result<()> {
		self.check_bounds(block)?;
		self.file.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
		self.file.read_exact(buf)?;
		self.reads += 1;
		Ok(())
	}

	/// Writes the full contents of `buf` to block `block`.
	pub fn write_block(&mut self, block: u32, buf: &BlockBuf) -> io::Result<()> {
		self.check_bounds(block)?;
		self.file.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
		self.file.write_all(buf)?;
		self.writes += 1;
		Ok(())
	}

	/// The number of successful block reads performed so far.
	pub fn read_count(&self) -> u64 {
		self.reads
	}

	/// The number of successful block writes performed so far.
	pub fn write_count(&self) -> u64 {
		self.writes
	}
}

impl Drop for BlockDevice {
	fn drop(&mut self) {
		eprintln!("{} disk block reads", self.reads);
		eprintln!("{} disk block writes", self.writes);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use tempfile::NamedTempFile;

	fn open_tmp(blocks: u32) -> BlockDevice {
		let path = NamedTempFile::new().unwrap().into_temp_path();
		let dev = BlockDevice::open(&path, blocks).unwrap();
		// Keep the file alive for the test's duration by leaking the path.
		std::mem::forget(path);
		dev
	}

	#[test]
	fn fresh_device_is_unmounted() {
		let dev = open_tmp(8);
		assert!(!dev.mounted());
		assert_eq!(dev.size(), 8);
	}

	#[test]
	fn mount_counter() {
		let mut dev = open_tmp(8);
		dev.mount();
		assert!(dev.mounted());
		dev.mount();
		dev.unmount();
		assert!(dev.mounted());
		dev.unmount();
		assert!(!dev.mounted());
		// Unmounting an already-unmounted device does not underflow.
		dev.unmount();
		assert!(!dev.mounted());
	}

	#[test]
	fn write_then_read_round_trips() {
		let mut dev = open_tmp(4);
		let mut buf = [0u8; BLOCK_SIZE];
		buf[0] = 0xAB;
		buf[BLOCK_SIZE - 1] = 0xCD;
		dev.write_block(2, &buf).unwrap();

		let mut out = [0u8; BLOCK_SIZE];
		dev.read_block(2, &mut out).unwrap();
		assert_eq!(buf, out);
		assert_eq!(dev.read_count(), 1);
		assert_eq!(dev.write_count(), 1);
	}

	#[test]
	fn out_of_range_block_fails() {
		let mut dev = open_tmp(4);
		let mut buf = [0u8; BLOCK_SIZE];
		assert!(dev.read_block(4, &mut buf).is_err());
		assert!(dev.write_block(100, &buf).is_err());
	}
}
