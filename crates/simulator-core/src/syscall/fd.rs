//! Guest file descriptor table.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct MemoryBuffer {
    data: Vec<u8>,
    pos: usize,
}

/// In-memory file. Clones share contents and offset, like duplicated descriptors.
#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    inner: Arc<Mutex<MemoryBuffer>>,
}

impl MemoryFile {
    /// File initially holding `data`, positioned at the start.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryBuffer { data, pos: 0 })),
        }
    }

    /// Current contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let start = inner.pos.min(inner.data.len());
        let n = buf.len().min(inner.data.len() - start);
        buf[..n].copy_from_slice(&inner.data[start..start + n]);
        inner.pos = start + n;
        n
    }

    fn write(&self, bytes: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        let start = inner.pos;
        let end = start + bytes.len();
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(bytes);
        inner.pos = end;
        bytes.len()
    }

    fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        let mut inner = self.inner.lock();
        let base = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => (inner.pos as u64).checked_add_signed(delta),
            SeekFrom::End(delta) => (inner.data.len() as u64).checked_add_signed(delta),
        };
        let target = base
            .and_then(|target| usize::try_from(target).ok())
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        inner.pos = target;
        Ok(target as u64)
    }

    fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        let start = usize::try_from(offset).map_or(inner.data.len(), |o| o.min(inner.data.len()));
        let end = start.saturating_add(len).min(inner.data.len());
        inner.data[start..end].to_vec()
    }
}

/// Host resource behind a guest descriptor.
#[derive(Debug)]
pub enum Descriptor {
    /// Host standard input.
    Stdin,
    /// Host standard output.
    Stdout,
    /// Host standard error.
    Stderr,
    /// Host file opened by the guest.
    File {
        /// Open file.
        file: File,
        /// Path as the guest named it.
        path: String,
    },
    /// Buffer living in the simulator.
    Memory(MemoryFile),
}

impl Descriptor {
    /// Reads into `buf`.
    ///
    /// # Errors
    ///
    /// Host I/O errors, or `EBADF`-style errors for write-only streams.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Stdin => io::stdin().lock().read(buf),
            Self::Stdout | Self::Stderr => Err(io::Error::from_raw_os_error(ebadf())),
            Self::File { file, .. } => file.read(buf),
            Self::Memory(memory) => Ok(memory.read(buf)),
        }
    }

    /// Writes `bytes`.
    ///
    /// # Errors
    ///
    /// Host I/O errors.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdin => Err(io::Error::from_raw_os_error(ebadf())),
            Self::Stdout => {
                let mut out = io::stdout().lock();
                let n = out.write(bytes)?;
                out.flush()?;
                Ok(n)
            }
            Self::Stderr => io::stderr().lock().write(bytes),
            Self::File { file, .. } => file.write(bytes),
            Self::Memory(memory) => Ok(memory.write(bytes)),
        }
    }

    /// Repositions the offset.
    ///
    /// # Errors
    ///
    /// `ESPIPE` for streams, host errors otherwise.
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Stdin | Self::Stdout | Self::Stderr => Err(io::Error::from_raw_os_error(
                nix::errno::Errno::ESPIPE as i32,
            )),
            Self::File { file, .. } => file.seek(pos),
            Self::Memory(memory) => memory.seek(pos),
        }
    }

    /// Reads up to `len` bytes at `offset` without moving the offset.
    ///
    /// # Errors
    ///
    /// `ENODEV` for streams, host errors otherwise.
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        match self {
            Self::Stdin | Self::Stdout | Self::Stderr => Err(io::Error::from_raw_os_error(
                nix::errno::Errno::ENODEV as i32,
            )),
            Self::File { file, .. } => {
                let mut buf = vec![0u8; len];
                let mut filled = 0;
                while filled < len {
                    let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            Self::Memory(memory) => Ok(memory.read_at(offset, len)),
        }
    }

    /// Second handle to the same resource.
    ///
    /// # Errors
    ///
    /// Host errors from duplicating a file handle.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Self::Stdin => Self::Stdin,
            Self::Stdout => Self::Stdout,
            Self::Stderr => Self::Stderr,
            Self::File { file, path } => Self::File {
                file: file.try_clone()?,
                path: path.clone(),
            },
            Self::Memory(memory) => Self::Memory(memory.clone()),
        })
    }

    /// Short description for traces and memory-map listings.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Stdin => "<stdin>".to_string(),
            Self::Stdout => "<stdout>".to_string(),
            Self::Stderr => "<stderr>".to_string(),
            Self::File { path, .. } => path.clone(),
            Self::Memory(_) => "<memory>".to_string(),
        }
    }
}

const fn ebadf() -> i32 {
    nix::errno::Errno::EBADF as i32
}

/// Maps guest descriptor numbers to [`Descriptor`]s, always handing out the
/// lowest free number.
#[derive(Debug, Default)]
pub struct FdTable {
    descriptors: HashMap<u32, Descriptor>,
    // Indices below `next_index` known to be free.
    available_indices: BTreeSet<u32>,
    // Lowest index not in `available_indices` that might be free.
    next_index: u32,
}

impl FdTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with 0, 1 and 2 bound to the host standard streams.
    #[must_use]
    pub fn with_stdio() -> Self {
        let mut table = Self::new();
        table.add(Descriptor::Stdin);
        table.add(Descriptor::Stdout);
        table.add(Descriptor::Stderr);
        table
    }

    /// Adds `descriptor` at the lowest unused index and returns it.
    pub fn add(&mut self, descriptor: Descriptor) -> u32 {
        let idx = if let Some(idx) = self.available_indices.pop_first() {
            log::trace!("reusing fd {idx}");
            idx
        } else {
            while self.descriptors.contains_key(&self.next_index) {
                self.next_index += 1;
            }
            let idx = self.next_index;
            self.next_index += 1;
            idx
        };
        let prev = self.descriptors.insert(idx, descriptor);
        debug_assert!(prev.is_none(), "fd {idx} already in use");
        idx
    }

    // Merges free indices adjacent to `next_index` back into it.
    fn trim_tail(&mut self) {
        while let Some(&last) = self.available_indices.last() {
            if last + 1 == self.next_index {
                self.next_index -= 1;
                self.available_indices.remove(&last);
            } else {
                break;
            }
        }
    }

    /// Removes and returns the descriptor at `idx`.
    pub fn remove(&mut self, idx: u32) -> Option<Descriptor> {
        let descriptor = self.descriptors.remove(&idx)?;
        if idx < self.next_index {
            self.available_indices.insert(idx);
            self.trim_tail();
        }
        Some(descriptor)
    }

    /// Binds `descriptor` to `idx`, returning what was there.
    pub fn set(&mut self, idx: u32, descriptor: Descriptor) -> Option<Descriptor> {
        self.available_indices.remove(&idx);
        self.descriptors.insert(idx, descriptor)
    }

    /// Descriptor at `idx`.
    #[must_use]
    pub fn get(&self, idx: u32) -> Option<&Descriptor> {
        self.descriptors.get(&idx)
    }

    /// Descriptor at `idx`, mutably.
    pub fn get_mut(&mut self, idx: u32) -> Option<&mut Descriptor> {
        self.descriptors.get_mut(&idx)
    }

    /// Open descriptor numbers in ascending order.
    #[must_use]
    pub fn fds(&self) -> Vec<u32> {
        let mut fds: Vec<u32> = self.descriptors.keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    /// Number of open descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether nothing is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Closes everything.
    pub fn release_all(&mut self) {
        let count = self.descriptors.len();
        self.descriptors.clear();
        self.available_indices.clear();
        self.next_index = 0;
        log::debug!("released {count} descriptors");
    }
}

#[cfg(test)]
mod tests {
    use std::io::SeekFrom;

    use super::{Descriptor, FdTable, MemoryFile};

    #[test]
    fn lowest_free_index_is_reused() {
        let mut table = FdTable::with_stdio();
        let a = table.add(Descriptor::Memory(MemoryFile::default()));
        let b = table.add(Descriptor::Memory(MemoryFile::default()));
        assert_eq!((a, b), (3, 4));
        assert!(table.remove(0).is_some());
        assert!(table.remove(3).is_some());
        assert_eq!(table.add(Descriptor::Stdin), 0);
        assert_eq!(table.add(Descriptor::Stdin), 3);
        assert_eq!(table.add(Descriptor::Stdin), 5);
    }

    #[test]
    fn set_beyond_next_index_is_skipped_by_add() {
        let mut table = FdTable::new();
        assert!(table.set(1, Descriptor::Stdout).is_none());
        assert_eq!(table.add(Descriptor::Stdin), 0);
        assert_eq!(table.add(Descriptor::Stdin), 2);
        assert!(table.remove(7).is_none());
        assert_eq!(table.fds(), vec![0, 1, 2]);
    }

    #[test]
    fn memory_files_share_offset_across_clones() {
        let mut first = Descriptor::Memory(MemoryFile::new(b"hello".to_vec()));
        let mut second = first.try_clone().expect("clone");
        let mut buf = [0u8; 2];
        assert_eq!(first.read(&mut buf).expect("read"), 2);
        assert_eq!(second.read(&mut buf).expect("read"), 2);
        assert_eq!(&buf, b"ll");
        assert_eq!(second.seek(SeekFrom::End(0)).expect("seek"), 5);
        second.write(b"!").expect("write");
        assert_eq!(first.read_at(3, 10).expect("read_at"), b"lo!".to_vec());
        assert!(Descriptor::Stdout.seek(SeekFrom::Start(0)).is_err());
    }

    #[test]
    fn release_all_empties_the_table() {
        let mut table = FdTable::with_stdio();
        table.release_all();
        assert!(table.is_empty());
        assert_eq!(table.add(Descriptor::Stdin), 0);
    }
}
