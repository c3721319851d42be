//! A compact Unix-style inode filesystem over a fixed-size block image.
//!
//! The crate is organized the way the on-disk layout is: [`block`] is the
//! raw block I/O layer, [`superblock`] and [`layout`] describe the regions
//! of the image, [`inode`] and [`dir`] are the on-disk records, [`bitmap`]
//! and [`alloc`] are the in-memory allocation state rebuilt at mount, and
//! this module ties all of it together into [`FileSystem`], the engine a
//! caller drives through `format`/`mount`/`create`/`remove`/`stat`/`read`/
//! `write`/`touch`.
//!
//! Driving this engine from a shell, parsing a disk-image path, and
//! hashing a mount password are all left to the caller: see
//! [`password::PasswordHasher`] and [`password::PasswordProvider`] for the
//! two seams this crate expects the caller to fill in.

mod alloc;
mod bitmap;
mod block;
mod dir;
mod inode;
mod layout;
mod password;
mod superblock;
mod util;

pub use block::BlockDevice;
pub use block::BlockBuf;
pub use block::BLOCK_SIZE;
pub use dir::AddEntryError;
pub use inode::DirEntry;
pub use inode::Inode;
pub use password::hashes_match;
pub use password::PasswordHasher;
pub use password::PasswordProvider;
pub use superblock::addressable_capacity;
pub use superblock::Superblock;
pub use superblock::DIR_PER_BLOCK;
pub use superblock::INODES_PER_BLOCK;
pub use superblock::MAGIC;
pub use superblock::NAMESIZE;
pub use superblock::POINTERS_PER_BLOCK;
pub use superblock::POINTERS_PER_INODE;

use bitmap::FreeMap;
use bitmap::InodeCounters;
use inode::default_file_mode;
use inode::mode_type;
use inode::root_dir_mode;
use inode::MODE_TYPE_DIR;
use inode::INODE_SIZE;
use std::io;

/// A mounted filesystem session, exclusively borrowing the [`BlockDevice`]
/// it was mounted on.
///
/// The borrow is the Rust rendering of "the BlockDevice is exclusively
/// owned by the mounted engine from mount() until released": the borrow
/// checker, not a runtime flag, prevents any other handle from touching
/// the device while `self` is alive.
pub struct FileSystem<'d> {
	device: &'d mut BlockDevice,
	superblock: Superblock,
	free_map: FreeMap,
	inode_counters: InodeCounters,
	/// The root directory's data block (inode 0's `direct[0]`).
	dir_block: u32,
}

/// Where a direct- or indirect-phase write loop landed.
enum WriteOutcome {
	/// The requested byte range is fully written.
	Done,
	/// More bytes remain to write but this phase's slots ran out (only
	/// relevant for the direct phase, which falls through to indirect).
	Continue,
	/// The allocator has no free blocks left.
	NoSpace,
}

impl<'d> FileSystem<'d> {
	/// Formats `device` with a fresh superblock, empty inode table, zeroed
	/// data and free-map regions, and a root directory containing `.` and
	/// `..`.
	///
	/// Returns `Ok(false)` (not an error) if `device` is already mounted.
	pub fn format(device: &mut BlockDevice) -> io::Result<bool> {
		if device.mounted() {
			return Ok(false);
		}

		let sb = Superblock::new(device.size());
		device.write_block(layout::SUPERBLOCK_BLOCK, &sb.to_bytes())?;

		let inode_start = layout::inode_region_start();
		let data_start = layout::data_region_start(&sb);
		let map_start = layout::map_region_start(&sb);

		let zero = [0u8; BLOCK_SIZE];
		for b in inode_start..data_start {
			device.write_block(b, &zero)?;
		}
		for b in data_start..map_start {
			device.write_block(b, &zero)?;
		}
		for b in map_start..sb.blocks {
			device.write_block(b, &zero)?;
		}

		let root_data_block = data_start;
		let mut root_direct = [0u32; POINTERS_PER_INODE as usize];
		root_direct[0] = root_data_block;
		let root_inode = Inode {
			mode: root_dir_mode(),
			bonds: 1,
			size: 0,
			direct: root_direct,
			indirect: 0,
		};
		let mut inode_block_buf = [0u8; BLOCK_SIZE];
		inode_block_buf[0..INODE_SIZE].copy_from_slice(&root_inode.to_bytes());
		device.write_block(inode_start, &inode_block_buf)?;

		let mut dir_buf = [0u8; BLOCK_SIZE];
		dir::init_root_entries(&mut dir_buf, 0);
		device.write_block(root_data_block, &dir_buf)?;

		Ok(true)
	}

	/// Validates the superblock, checks the mount password if the image is
	/// protected, reconstructs the free-block bitmap and inode counters by
	/// walking the inode table, and loads the root directory.
	///
	/// Returns `Ok(None)` (not an error) for any of: device already
	/// mounted, bad magic/derived counts, missing or wrong password, or a
	/// persisted pointer out of range. A genuine I/O failure propagates as
	/// `Err`.
	pub fn mount(
		device: &'d mut BlockDevice,
		hasher: &dyn PasswordHasher,
		provider: &dyn PasswordProvider,
	) -> io::Result<Option<FileSystem<'d>>> {
		if device.mounted() {
			return Ok(None);
		}

		let mut buf = [0u8; BLOCK_SIZE];
		device.read_block(layout::SUPERBLOCK_BLOCK, &mut buf)?;
		let sb = Superblock::from_bytes(&buf)?;
		if !sb.is_consistent() {
			return Ok(None);
		}

		if sb.protected == 1 {
			let Some(password) = provider.provide() else {
				return Ok(None);
			};
			let digest = hasher.hash_hex(&password);
			if !hashes_match(&digest, sb.password_hash_str()) {
				return Ok(None);
			}
		}

		let mut free_map = FreeMap::new(sb.blocks);
		let mut inode_counters = InodeCounters::new(sb.inode_blocks);
		let inode_start = layout::inode_region_start();

		for b in 0..inode_start {
			free_map.mark_used(b);
		}

		for block_index in 0..sb.inode_blocks {
			let abs_block = inode_start + block_index;
			let mut inode_buf = [0u8; BLOCK_SIZE];
			device.read_block(abs_block, &mut inode_buf)?;

			for slot in 0..INODES_PER_BLOCK as usize {
				let off = slot * INODE_SIZE;
				let bytes: [u8; INODE_SIZE] = inode_buf[off..off + INODE_SIZE]
					.try_into()
					.unwrap();
				let inode = Inode::from_bytes(&bytes);
				if !inode.is_live() {
					continue;
				}

				inode_counters.increment(block_index);
				free_map.mark_used(abs_block);

				for &d in &inode.direct {
					if d == 0 {
						continue;
					}
					if d >= sb.blocks {
						return Ok(None);
					}
					free_map.mark_used(d);
				}

				if inode.indirect != 0 {
					if inode.indirect >= sb.blocks {
						return Ok(None);
					}
					free_map.mark_used(inode.indirect);

					let mut ptr_buf = [0u8; BLOCK_SIZE];
					device.read_block(inode.indirect, &mut ptr_buf)?;
					for chunk in ptr_buf.chunks_exact(4) {
						let p = u32::from_le_bytes(chunk.try_into().unwrap());
						if p == 0 {
							continue;
						}
						if p >= sb.blocks {
							return Ok(None);
						}
						free_map.mark_used(p);
					}
				}
			}
		}

		let mut root_inode_buf = [0u8; BLOCK_SIZE];
		device.read_block(inode_start, &mut root_inode_buf)?;
		let root_bytes: [u8; INODE_SIZE] = root_inode_buf[0..INODE_SIZE]
			.try_into()
			.unwrap();
		let root_inode = Inode::from_bytes(&root_bytes);
		if !root_inode.is_live() || mode_type(root_inode.mode) != MODE_TYPE_DIR {
			return Ok(None);
		}
		let dir_block = root_inode.direct[0];

		device.mount();

		Ok(Some(FileSystem {
			device,
			superblock: sb,
			free_map,
			inode_counters,
			dir_block,
		}))
	}

	/// Allocates a new, empty regular-file inode. Returns `-1` when the
	/// inode table is full.
	pub fn create(&mut self) -> io::Result<i64> {
		for block_index in 0..self.superblock.inode_blocks {
			if self.inode_counters.is_full(block_index, INODES_PER_BLOCK) {
				continue;
			}

			let abs_block = layout::inode_region_start() + block_index;
			let mut buf = [0u8; BLOCK_SIZE];
			self.device.read_block(abs_block, &mut buf)?;

			for slot in 0..INODES_PER_BLOCK as usize {
				let off = slot * INODE_SIZE;
				let bytes: [u8; INODE_SIZE] = buf[off..off + INODE_SIZE].try_into().unwrap();
				if Inode::from_bytes(&bytes).is_live() {
					continue;
				}

				let inode = Inode {
					mode: default_file_mode(),
					bonds: 1,
					size: 0,
					direct: [0; POINTERS_PER_INODE as usize],
					indirect: 0,
				};
				buf[off..off + INODE_SIZE].copy_from_slice(&inode.to_bytes());

				self.free_map.mark_used(abs_block);
				self.inode_counters.increment(block_index);
				self.device.write_block(abs_block, &buf)?;

				return Ok((block_index * INODES_PER_BLOCK + slot as u32) as i64);
			}
		}
		Ok(-1)
	}

	/// Removes inode `n`: drops its reference count, frees every block it
	/// held, and zeroes its pointers. Returns `false` if `n` has no live
	/// inode.
	pub fn remove(&mut self, n: u32) -> io::Result<bool> {
		let Some(mut inode) = self.load_inode(n)? else {
			return Ok(false);
		};
		let (block_index, _) = layout::inode_location(n);

		inode.bonds = inode.bonds.saturating_sub(1);
		inode.size = 0;

		if self.inode_counters.decrement(block_index) == 0 {
			self.free_map
				.mark_free(layout::inode_region_start() + block_index);
		}

		for d in inode.direct.iter_mut() {
			if *d != 0 {
				self.free_map.mark_free(*d);
			}
			*d = 0;
		}

		if inode.indirect != 0 {
			let mut ptr_buf = [0u8; BLOCK_SIZE];
			self.device.read_block(inode.indirect, &mut ptr_buf)?;
			self.free_map.mark_free(inode.indirect);
			inode.indirect = 0;

			for chunk in ptr_buf.chunks_exact(4) {
				let p = u32::from_le_bytes(chunk.try_into().unwrap());
				if p != 0 {
					self.free_map.mark_free(p);
				}
			}
		}

		self.persist_inode(n, &inode)?;
		Ok(true)
	}

	/// Returns the byte size of inode `n`, or `-1` if it has no live inode.
	pub fn stat(&mut self, n: u32) -> io::Result<i64> {
		Ok(self.load_inode(n)?.map(|i| i.size as i64).unwrap_or(-1))
	}

	/// Reads up to `buf.len()` bytes of inode `inumber` starting at
	/// `offset` into `buf`. Returns the number of bytes actually copied
	/// (which may be less than `buf.len()` if the read runs past the end
	/// of the file), `0` if `offset` is at or past the end of the file or
	/// addresses an unallocated block, or `-1` if `inumber` has no live
	/// inode.
	pub fn read(&mut self, inumber: u32, buf: &mut [u8], offset: u64) -> io::Result<i64> {
		let Some(inode) = self.load_inode(inumber)? else {
			return Ok(-1);
		};

		let size = inode.size as u64;
		if offset >= size {
			return Ok(0);
		}
		let mut remaining = buf.len() as u64;
		if offset + remaining > size {
			remaining = size - offset;
		}
		let to_read = remaining;
		let mut written = 0u64;

		let ptrs_per_inode_bytes = POINTERS_PER_INODE as u64 * BLOCK_SIZE as u64;

		if offset < ptrs_per_inode_bytes {
			let start_slot = (offset / BLOCK_SIZE as u64) as usize;
			let start_intra = (offset % BLOCK_SIZE as u64) as usize;

			if inode.direct[start_slot] == 0 {
				return Ok(0);
			}

			let mut slot = start_slot;
			while remaining > 0 && slot < POINTERS_PER_INODE as usize && inode.direct[slot] != 0 {
				let intra = if slot == start_slot { start_intra } else { 0 };
				let n = self.copy_from_block(inode.direct[slot], intra, buf, &mut written, remaining)?;
				remaining -= n;
				slot += 1;
			}

			if remaining > 0 && slot == POINTERS_PER_INODE as usize && inode.indirect != 0 {
				let mut ptr_buf = [0u8; BLOCK_SIZE];
				self.device.read_block(inode.indirect, &mut ptr_buf)?;
				for i in 0..POINTERS_PER_BLOCK as usize {
					if remaining == 0 {
						break;
					}
					let off = i * 4;
					let p = u32::from_le_bytes(ptr_buf[off..off + 4].try_into().unwrap());
					if p == 0 {
						break;
					}
					let n = self.copy_from_block(p, 0, buf, &mut written, remaining)?;
					remaining -= n;
				}
			}
		} else {
			if inode.indirect == 0 {
				return Ok(0);
			}
			let indirect_off = offset - ptrs_per_inode_bytes;
			let start_slot = (indirect_off / BLOCK_SIZE as u64) as usize;
			let start_intra = (indirect_off % BLOCK_SIZE as u64) as usize;

			let mut ptr_buf = [0u8; BLOCK_SIZE];
			self.device.read_block(inode.indirect, &mut ptr_buf)?;

			let first_off = start_slot * 4;
			let first = u32::from_le_bytes(ptr_buf[first_off..first_off + 4].try_into().unwrap());
			if first == 0 {
				return Ok(0);
			}

			for i in start_slot..POINTERS_PER_BLOCK as usize {
				if remaining == 0 {
					break;
				}
				let off = i * 4;
				let p = u32::from_le_bytes(ptr_buf[off..off + 4].try_into().unwrap());
				if p == 0 {
					break;
				}
				let intra = if i == start_slot { start_intra } else { 0 };
				let n = self.copy_from_block(p, intra, buf, &mut written, remaining)?;
				remaining -= n;
			}
		}

		Ok((to_read - remaining) as i64)
	}

	/// Writes `buf` into inode `inumber` starting at `offset`, allocating
	/// blocks (direct, then a single indirect block) as needed.
	///
	/// Returns `-1` without touching the inode if `offset + buf.len()`
	/// exceeds [`addressable_capacity`] or `inumber` is out of range.
	/// Otherwise returns the number of bytes actually written: this is
	/// `buf.len()` on success, or fewer if the allocator ran out of space,
	/// in which case the inode's size reflects exactly what was written.
	///
	/// Precondition: `inumber` must have come from a prior `create()` call
	/// on this filesystem, or already hold a live inode. Calling `write`
	/// on an inumber that was never allocated synthesizes a new inode at
	/// that slot rather than failing.
	pub fn write(&mut self, inumber: u32, buf: &[u8], offset: u64) -> io::Result<i64> {
		let length = buf.len() as u64;
		if offset + length > addressable_capacity() {
			return Ok(-1);
		}
		if inumber >= self.superblock.inodes {
			return Ok(-1);
		}

		let mut inode = match self.load_inode(inumber)? {
			Some(mut existing) => {
				existing.size = existing.size.max((offset + length) as u32);
				existing
			}
			None => {
				let (block_index, _) = layout::inode_location(inumber);
				self.inode_counters.increment(block_index);
				self.free_map
					.mark_used(layout::inode_region_start() + block_index);
				Inode {
					mode: default_file_mode(),
					bonds: 1,
					size: (offset + length) as u32,
					direct: [0; POINTERS_PER_INODE as usize],
					indirect: 0,
				}
			}
		};

		let data_start = layout::data_region_start(&self.superblock);
		let map_start = layout::map_region_start(&self.superblock);
		let ptrs_per_inode_bytes = POINTERS_PER_INODE as u64 * BLOCK_SIZE as u64;

		let mut consumed = 0u64;
		let mut indirect_buf: Option<BlockBuf> = None;
		let mut out_of_space = false;

		if offset < ptrs_per_inode_bytes {
			let start_slot = (offset / BLOCK_SIZE as u64) as usize;
			let start_intra = (offset % BLOCK_SIZE as u64) as usize;

			match self.write_direct(
				&mut inode,
				start_slot,
				start_intra,
				buf,
				&mut consumed,
				data_start,
				map_start,
			)? {
				WriteOutcome::NoSpace => out_of_space = true,
				WriteOutcome::Continue => {
					if let WriteOutcome::NoSpace = self.write_indirect(
						&mut inode,
						0,
						0,
						buf,
						&mut consumed,
						data_start,
						map_start,
						&mut indirect_buf,
					)? {
						out_of_space = true;
					}
				}
				WriteOutcome::Done => {}
			}
		} else {
			let indirect_off = offset - ptrs_per_inode_bytes;
			let start_slot = (indirect_off / BLOCK_SIZE as u64) as usize;
			let start_intra = (indirect_off % BLOCK_SIZE as u64) as usize;

			if let WriteOutcome::NoSpace = self.write_indirect(
				&mut inode,
				start_slot,
				start_intra,
				buf,
				&mut consumed,
				data_start,
				map_start,
				&mut indirect_buf,
			)? {
				out_of_space = true;
			}
		}

		if out_of_space {
			inode.size = (offset + consumed) as u32;
		}

		if let Some(ptrs) = indirect_buf {
			self.device.write_block(inode.indirect, &ptrs)?;
		}
		self.persist_inode(inumber, &inode)?;

		Ok(consumed as i64)
	}

	/// Allocates an inode and binds `name` to it in the root directory.
	/// Returns `false`, with no net change to the filesystem, if `name` is
	/// already bound or the directory is full.
	pub fn touch(&mut self, name: &str) -> io::Result<bool> {
		let mut dir_buf = [0u8; BLOCK_SIZE];
		self.device.read_block(self.dir_block, &mut dir_buf)?;

		let inumber = self.create()?;
		if inumber < 0 {
			return Ok(false);
		}

		match dir::add_entry(&mut dir_buf, inumber as u32, name) {
			Ok(()) => {
				self.device.write_block(self.dir_block, &dir_buf)?;
				Ok(true)
			}
			Err(_) => {
				self.remove(inumber as u32)?;
				Ok(false)
			}
		}
	}

	/// Dumps a human-readable listing of the superblock and every live
	/// inode. Does not require mounting: it reads `device` directly, the
	/// way the reference implementation's `debug` takes a raw disk handle.
	pub fn debug(device: &mut BlockDevice) -> io::Result<String> {
		use std::fmt::Write as _;

		let mut out = String::new();
		let mut buf = [0u8; BLOCK_SIZE];
		device.read_block(layout::SUPERBLOCK_BLOCK, &mut buf)?;
		let sb = Superblock::from_bytes(&buf)?;

		writeln!(out, "SuperBlock:").unwrap();
		writeln!(out, "    {} blocks", sb.blocks).unwrap();
		writeln!(out, "    {} inode blocks", sb.inode_blocks).unwrap();
		writeln!(out, "    {} inodes", sb.inodes).unwrap();

		if sb.magic != MAGIC {
			return Ok(out);
		}

		let inode_start = layout::inode_region_start();
		let mut inumber = 0u32;
		for block_index in 0..sb.inode_blocks {
			let mut inode_buf = [0u8; BLOCK_SIZE];
			device.read_block(inode_start + block_index, &mut inode_buf)?;

			for slot in 0..INODES_PER_BLOCK as usize {
				let off = slot * INODE_SIZE;
				let bytes: [u8; INODE_SIZE] = inode_buf[off..off + INODE_SIZE]
					.try_into()
					.unwrap();
				let inode = Inode::from_bytes(&bytes);

				if inode.is_live() {
					writeln!(out, "Inode {inumber}:").unwrap();
					writeln!(out, "    size: {} bytes", inode.size).unwrap();
					write!(out, "    direct blocks:").unwrap();
					for &d in &inode.direct {
						if d != 0 {
							write!(out, " {d}").unwrap();
						}
					}
					writeln!(out).unwrap();

					if inode.indirect != 0 {
						writeln!(out, "    indirect block: {}", inode.indirect).unwrap();
						write!(out, "    indirect data blocks:").unwrap();
						let mut ptr_buf = [0u8; BLOCK_SIZE];
						device.read_block(inode.indirect, &mut ptr_buf)?;
						for chunk in ptr_buf.chunks_exact(4) {
							let p = u32::from_le_bytes(chunk.try_into().unwrap());
							if p != 0 {
								write!(out, " {p}").unwrap();
							}
						}
						writeln!(out).unwrap();
					}
				}

				inumber += 1;
			}
		}

		Ok(out)
	}

	fn load_inode(&mut self, n: u32) -> io::Result<Option<Inode>> {
		if n >= self.superblock.inodes {
			return Ok(None);
		}
		let (block_index, slot) = layout::inode_location(n);
		if self.inode_counters.get(block_index) == 0 {
			return Ok(None);
		}

		let abs_block = layout::inode_region_start() + block_index;
		let mut buf = [0u8; BLOCK_SIZE];
		self.device.read_block(abs_block, &mut buf)?;

		let off = slot as usize * INODE_SIZE;
		let bytes: [u8; INODE_SIZE] = buf[off..off + INODE_SIZE].try_into().unwrap();
		let inode = Inode::from_bytes(&bytes);

		Ok(inode.is_live().then_some(inode))
	}

	fn persist_inode(&mut self, n: u32, inode: &Inode) -> io::Result<()> {
		let (block_index, slot) = layout::inode_location(n);
		let abs_block = layout::inode_region_start() + block_index;

		let mut buf = [0u8; BLOCK_SIZE];
		self.device.read_block(abs_block, &mut buf)?;
		let off = slot as usize * INODE_SIZE;
		buf[off..off + INODE_SIZE].copy_from_slice(&inode.to_bytes());
		self.device.write_block(abs_block, &buf)
	}

	fn copy_from_block(
		&mut self,
		block: u32,
		start: usize,
		buf: &mut [u8],
		written: &mut u64,
		remaining: u64,
	) -> io::Result<u64> {
		let mut tmp = [0u8; BLOCK_SIZE];
		self.device.read_block(block, &mut tmp)?;
		let avail = (BLOCK_SIZE - start) as u64;
		let n = avail.min(remaining);
		let w = *written as usize;
		buf[w..w + n as usize].copy_from_slice(&tmp[start..start + n as usize]);
		*written += n;
		Ok(n)
	}

	fn copy_into_block(
		&mut self,
		block: u32,
		start: usize,
		buf: &[u8],
		consumed: &mut u64,
	) -> io::Result<()> {
		let mut tmp = [0u8; BLOCK_SIZE];
		self.device.read_block(block, &mut tmp)?;
		let avail = BLOCK_SIZE - start;
		let remaining = (buf.len() as u64 - *consumed) as usize;
		let n = avail.min(remaining);
		let c = *consumed as usize;
		tmp[start..start + n].copy_from_slice(&buf[c..c + n]);
		self.device.write_block(block, &tmp)?;
		*consumed += n as u64;
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	fn write_direct(
		&mut self,
		inode: &mut Inode,
		start_slot: usize,
		start_intra: usize,
		buf: &[u8],
		consumed: &mut u64,
		data_start: u32,
		map_start: u32,
	) -> io::Result<WriteOutcome> {
		let length = buf.len() as u64;
		for slot in start_slot..POINTERS_PER_INODE as usize {
			if *consumed == length {
				return Ok(WriteOutcome::Done);
			}
			if inode.direct[slot] == 0 {
				match alloc::allocate_block(&mut self.free_map, data_start, map_start) {
					Some(b) => inode.direct[slot] = b.get(),
					None => return Ok(WriteOutcome::NoSpace),
				}
			}
			let intra = if slot == start_slot { start_intra } else { 0 };
			self.copy_into_block(inode.direct[slot], intra, buf, consumed)?;
		}

		if *consumed == length {
			Ok(WriteOutcome::Done)
		} else {
			Ok(WriteOutcome::Continue)
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn write_indirect(
		&mut self,
		inode: &mut Inode,
		start_slot: usize,
		start_intra: usize,
		buf: &[u8],
		consumed: &mut u64,
		data_start: u32,
		map_start: u32,
		indirect_buf: &mut Option<BlockBuf>,
	) -> io::Result<WriteOutcome> {
		let length = buf.len() as u64;

		if indirect_buf.is_none() {
			if inode.indirect == 0 {
				match alloc::allocate_block(&mut self.free_map, data_start, map_start) {
					Some(b) => inode.indirect = b.get(),
					None => return Ok(WriteOutcome::NoSpace),
				}
				*indirect_buf = Some([0u8; BLOCK_SIZE]);
			} else {
				let mut tmp = [0u8; BLOCK_SIZE];
				self.device.read_block(inode.indirect, &mut tmp)?;
				*indirect_buf = Some(tmp);
			}
		}
		let ptrs = indirect_buf.as_mut().unwrap();

		for slot in start_slot..POINTERS_PER_BLOCK as usize {
			if *consumed == length {
				return Ok(WriteOutcome::Done);
			}
			let off = slot * 4;
			let mut p = u32::from_le_bytes(ptrs[off..off + 4].try_into().unwrap());
			if p == 0 {
				match alloc::allocate_block(&mut self.free_map, data_start, map_start) {
					Some(b) => p = b.get(),
					None => return Ok(WriteOutcome::NoSpace),
				}
				ptrs[off..off + 4].copy_from_slice(&p.to_le_bytes());
			}
			let intra = if slot == start_slot { start_intra } else { 0 };
			self.copy_into_block(p, intra, buf, consumed)?;
		}

		if *consumed == length {
			Ok(WriteOutcome::Done)
		} else {
			Ok(WriteOutcome::Continue)
		}
	}

	/// The number of blocks this filesystem currently considers used.
	/// Exposed for tests that check the free-block bitmap's invariants.
	#[cfg(test)]
	pub(crate) fn used_block_count(&self) -> usize {
		self.free_map.used_count()
	}

	#[cfg(test)]
	pub(crate) fn inode_counter_at(&self, block_index: u32) -> u32 {
		self.inode_counters.get(block_index)
	}
}

impl<'d> Drop for FileSystem<'d> {
	fn drop(&mut self) {
		// No explicit unmount operation exists beyond releasing the
		// device; tie it to this session's own lifetime instead.
		self.device.unmount();
	}
}

#[cfg(test)]
mod test_support {
	use super::*;
	use crate::password::test_support::FakeHasher;
	use crate::password::test_support::FixedProvider;
	use tempfile::NamedTempFile;

	pub fn open_image(blocks: u32) -> BlockDevice {
		let path = NamedTempFile::new().unwrap().into_temp_path();
		let dev = BlockDevice::open(&path, blocks).unwrap();
		std::mem::forget(path);
		dev
	}

	pub fn unprotected_mount(device: &mut BlockDevice) -> FileSystem<'_> {
		FileSystem::mount(device, &FakeHasher, &FixedProvider(None))
			.unwrap()
			.expect("mount of a freshly formatted image must succeed")
	}

	/// Reads the mount flag through an already-borrowed `FileSystem` so
	/// tests can observe it without a second borrow of the device.
	pub fn is_device_mounted(fs: &FileSystem) -> bool {
		fs.device.mounted()
	}
}


#[cfg(test)]
mod proptest_suite {
	use super::test_support::open_image;
	use super::test_support::unprotected_mount;
	use super::*;
	use proptest::prelude::*;

	proptest! {
		/// Property 4: write-then-read round trips for any in-capacity
		/// range.
		#[test]
		fn write_then_read_round_trips(
			data in proptest::collection::vec(any::<u8>(), 0..2000),
			offset in 0u64..2000,
		) {
			let cap = addressable_capacity();
			prop_assume!(offset + data.len() as u64 <= cap);

			let mut dev = open_image(400);
			FileSystem::format(&mut dev).unwrap();
			let mut fs = unprotected_mount(&mut dev);
			let i = fs.create().unwrap() as u32;

			let written = fs.write(i, &data, offset).unwrap();
			prop_assert_eq!(written, data.len() as i64);

			let mut out = vec![0u8; data.len()];
			let copied = fs.read(i, &mut out, offset).unwrap();
			prop_assert_eq!(copied, data.len() as i64);
			prop_assert_eq!(out, data);
		}

		/// Property 5: stat reflects exactly the high-water mark of bytes
		/// written, never more than the addressable capacity.
		#[test]
		fn stat_tracks_high_water_mark(
			writes in proptest::collection::vec((0u64..3000, 0usize..600), 1..6),
		) {
			let cap = addressable_capacity();
			let mut dev = open_image(400);
			FileSystem::format(&mut dev).unwrap();
			let mut fs = unprotected_mount(&mut dev);
			let i = fs.create().unwrap() as u32;

			let mut expected_max = 0u64;
			for (offset, len) in writes {
				if offset + len as u64 > cap {
					continue;
				}
				let data = vec![0x42u8; len];
				let written = fs.write(i, &data, offset).unwrap();
				prop_assert_eq!(written, len as i64);
				expected_max = expected_max.max(offset + len as u64);
			}

			prop_assert_eq!(fs.stat(i).unwrap() as u64, expected_max);
			prop_assert!(fs.stat(i).unwrap() as u64 <= cap);
		}

		/// Property 3: the inode counter for every inode block always
		/// equals its true live population, for any create/remove
		/// sequence.
		#[test]
		fn inode_counters_match_true_population(
			ops in proptest::collection::vec(any::<bool>(), 1..40),
		) {
			let mut dev = open_image(60);
			FileSystem::format(&mut dev).unwrap();
			let mut fs = unprotected_mount(&mut dev);

			let mut live = Vec::new();
			for create_op in ops {
				if create_op || live.is_empty() {
					let n = fs.create().unwrap();
					if n >= 0 {
						live.push(n as u32);
					}
				} else {
					let idx = live.len() - 1;
					let n = live.remove(idx);
					prop_assert!(fs.remove(n).unwrap());
				}
			}

			for block_index in 0..fs.superblock.inode_blocks {
				let expected = live
					.iter()
					.filter(|&&n| layout::inode_location(n).0 == block_index)
					.count() as u32;
				// Inode 0 (the root) lives in block 0 and is never in
				// `live`, but it does count toward block 0's population.
				let expected = if block_index == 0 {
					expected + 1
				} else {
					expected
				};
				prop_assert_eq!(fs.inode_counter_at(block_index), expected);
				prop_assert!(fs.inode_counter_at(block_index) <= INODES_PER_BLOCK);
			}
		}
	}
}
