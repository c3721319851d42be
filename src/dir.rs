//! The root directory: a single block of name-to-inode bindings.

use crate::block::BLOCK_SIZE;
use crate::inode::DirEntry;
use crate::inode::DIRENT_SIZE;
use crate::superblock::DIR_PER_BLOCK;

/// Reads all directory entries out of a raw directory block buffer.
pub fn read_entries(buf: &[u8; BLOCK_SIZE]) -> Vec<DirEntry> {
	(0..DIR_PER_BLOCK as usize)
		.map(|i| {
			let off = i * DIRENT_SIZE;
			let slice: [u8; DIRENT_SIZE] = buf[off..off + DIRENT_SIZE].try_into().unwrap();
			DirEntry::from_bytes(&slice)
		})
		.collect()
}

/// Writes `entry` into slot `index` of a raw directory block buffer.
pub fn write_entry(buf: &mut [u8; BLOCK_SIZE], index: usize, entry: &DirEntry) {
	let off = index * DIRENT_SIZE;
	buf[off..off + DIRENT_SIZE].copy_from_slice(&entry.to_bytes());
}

/// The outcome of attempting to bind a name to an inode in a directory
/// block.
#[derive(Debug, PartialEq, Eq)]
pub enum AddEntryError {
	/// The name is already bound to some inode in this directory.
	DuplicateName,
	/// Every slot is occupied.
	DirectoryFull,
}

/// Adds `{inum, name}` to the first available slot of `dir_block`.
///
/// Slots 0 and 1 (`.` and `..`) are installed by `format`, never by this
/// function; it only ever considers slots from index 2 onward for ordinary
/// entries, rejecting a name collision before it looks for a free slot.
pub fn add_entry(
	dir_block: &mut [u8; BLOCK_SIZE],
	inum: u32,
	name: &str,
) -> Result<(), AddEntryError> {
	let entries = read_entries(dir_block);

	for entry in entries.iter().skip(2) {
		if !entry.is_empty_slot() && entry.name_str() == name {
			return Err(AddEntryError::DuplicateName);
		}
	}

	let free_index = entries
		.iter()
		.enumerate()
		.skip(2)
		.find(|(_, e)| e.inum == 0)
		.map(|(i, _)| i);

	match free_index {
		Some(index) => {
			write_entry(dir_block, index, &DirEntry::new(inum, name));
			Ok(())
		}
		None => Err(AddEntryError::DirectoryFull),
	}
}

/// Installs the `.` and `..` entries for a freshly formatted root directory
/// block, both pointing at `root_inum`.
pub fn init_root_entries(dir_block: &mut [u8; BLOCK_SIZE], root_inum: u32) {
	write_entry(dir_block, 0, &DirEntry::new(root_inum, "."));
	write_entry(dir_block, 1, &DirEntry::new(root_inum, ".."));
}

#[cfg(test)]
mod test {
	use super::*;

	fn fresh_root_block() -> [u8; BLOCK_SIZE] {
		let mut buf = [0u8; BLOCK_SIZE];
		init_root_entries(&mut buf, 0);
		buf
	}

	#[test]
	fn root_entries_point_at_root() {
		let buf = fresh_root_block();
		let entries = read_entries(&buf);
		assert_eq!(entries[0].inum, 0);
		assert_eq!(entries[0].name_str(), ".");
		assert_eq!(entries[1].inum, 0);
		assert_eq!(entries[1].name_str(), "..");
	}

	#[test]
	fn adds_entry_into_first_free_slot() {
		let mut buf = fresh_root_block();
		add_entry(&mut buf, 5, "a.txt").unwrap();
		let entries = read_entries(&buf);
		assert_eq!(entries[2].inum, 5);
		assert_eq!(entries[2].name_str(), "a.txt");
	}

	#[test]
	fn rejects_duplicate_names() {
		let mut buf = fresh_root_block();
		add_entry(&mut buf, 5, "a.txt").unwrap();
		let err = add_entry(&mut buf, 6, "a.txt").unwrap_err();
		assert_eq!(err, AddEntryError::DuplicateName);
		// The directory was not otherwise mutated by the failed add.
		let entries = read_entries(&buf);
		assert_eq!(entries[2].inum, 5);
	}

	#[test]
	fn reports_full_directory() {
		let mut buf = fresh_root_block();
		for i in 2..DIR_PER_BLOCK {
			add_entry(&mut buf, i + 1, &format!("f{i}")).unwrap();
		}
		let err = add_entry(&mut buf, 999, "overflow").unwrap_err();
		assert_eq!(err, AddEntryError::DirectoryFull);
	}
}
