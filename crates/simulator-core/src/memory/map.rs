use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;

use thiserror::Error;

use super::access::{AccessKind, MemoryFault, MemoryFaultKind, Permissions};

/// One contiguous mapped range of guest memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    base: u32,
    data: Vec<u8>,
    perms: Permissions,
    name: String,
}

impl Segment {
    /// Creates a segment backed by `data`.
    #[must_use]
    pub fn new(base: u32, data: Vec<u8>, perms: Permissions, name: impl Into<String>) -> Self {
        Self {
            base,
            data,
            perms,
            name: name.into(),
        }
    }

    /// Creates a zero-filled segment.
    #[must_use]
    pub fn zeroed(base: u32, len: u32, perms: Permissions, name: impl Into<String>) -> Self {
        Self::new(base, vec![0; len as usize], perms, name)
    }

    /// First address.
    #[must_use]
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Length in bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Whether the segment holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last address, widened so a segment may end at 4 GiB.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base as u64 + self.data.len() as u64
    }

    /// Access permissions.
    #[must_use]
    pub const fn perms(&self) -> Permissions {
        self.perms
    }

    /// Human readable description.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether `addr` falls inside the segment.
    #[must_use]
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr as u64) < self.end()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn split_off(&mut self, at: u32) -> Self {
        let tail = self.data.split_off((at - self.base) as usize);
        Self {
            base: at,
            data: tail,
            perms: self.perms,
            name: self.name.clone(),
        }
    }
}

/// Rejected mapping requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    /// Zero-length segment.
    #[error("segment at 0x{base:08x} is empty")]
    Empty {
        /// Requested base.
        base: u32,
    },
    /// Segment would extend past the end of the address space.
    #[error("segment at 0x{base:08x} with length 0x{len:x} wraps the address space")]
    Overflow {
        /// Requested base.
        base: u32,
        /// Requested length.
        len: u64,
    },
    /// Segment overlaps an existing mapping.
    #[error("segment 0x{base:08x}+0x{len:x} overlaps existing segment at 0x{existing:08x}")]
    Overlap {
        /// Requested base.
        base: u32,
        /// Requested length.
        len: u64,
        /// Base of the segment already covering part of the range.
        existing: u32,
    },
}

/// One row of the memory-map listing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MapEntry {
    /// First address.
    pub start: u32,
    /// Length in bytes.
    pub len: u32,
    /// Access permissions.
    pub perms: Permissions,
    /// Description.
    pub name: String,
}

/// Guest address space made of non-overlapping permissioned segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMap {
    segments: BTreeMap<u32, Segment>,
}

impl MemoryMap {
    /// Creates an empty address space.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segments: BTreeMap::new(),
        }
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments in address order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// Adds a segment.
    ///
    /// # Errors
    ///
    /// Rejects empty segments, segments past 4 GiB and segments overlapping
    /// an existing mapping.
    pub fn map(&mut self, segment: Segment) -> Result<(), MapError> {
        let base = segment.base;
        let len = segment.data.len() as u64;
        if len == 0 {
            return Err(MapError::Empty { base });
        }
        if segment.end() > 1 << 32 {
            return Err(MapError::Overflow { base, len });
        }
        if let Some(existing) = self.overlapping(base, segment.end()) {
            return Err(MapError::Overlap {
                base,
                len,
                existing: existing.base,
            });
        }
        self.segments.insert(base, segment);
        Ok(())
    }

    /// Maps `segment`, discarding whatever was mapped underneath it.
    ///
    /// # Errors
    ///
    /// Same as [`MemoryMap::map`] apart from overlap.
    pub fn map_replace(&mut self, segment: Segment) -> Result<(), MapError> {
        self.unmap(segment.base, segment.len());
        self.map(segment)
    }

    /// Removes `[addr, addr + len)`, splitting segments at the boundaries.
    pub fn unmap(&mut self, addr: u32, len: u32) {
        let end = u64::from(addr) + u64::from(len);
        self.split_at(u64::from(addr));
        self.split_at(end);
        let doomed: Vec<u32> = self
            .segments
            .range(addr..)
            .take_while(|(base, _)| u64::from(**base) < end)
            .map(|(base, _)| *base)
            .collect();
        for base in doomed {
            self.segments.remove(&base);
        }
    }

    /// Changes permissions of `[addr, addr + len)`.
    ///
    /// # Errors
    ///
    /// Fails without changing anything when part of the range is unmapped.
    pub fn protect(&mut self, addr: u32, len: u32, perms: Permissions) -> Result<(), MemoryFault> {
        self.check(addr, len as usize, AccessKind::Peek)?;
        let end = u64::from(addr) + u64::from(len);
        self.split_at(u64::from(addr));
        self.split_at(end);
        for segment in self.segments.range_mut(addr..).map(|(_, s)| s) {
            if u64::from(segment.base) >= end {
                break;
            }
            segment.perms = perms;
        }
        Ok(())
    }

    /// Finds a hole of `len` bytes at or above `hint` that ends at or below `ceiling`.
    #[must_use]
    pub fn find_free(&self, len: u32, hint: u32, ceiling: u64) -> Option<u32> {
        let mut candidate = u64::from(super::page_ceil(hint)?);
        loop {
            let end = candidate + u64::from(len);
            if end > ceiling || end > 1 << 32 {
                return None;
            }
            let start = u32::try_from(candidate).ok()?;
            match self.overlapping(start, end) {
                None => return Some(start),
                Some(segment) => {
                    candidate = segment.end().next_multiple_of(u64::from(super::PAGE_SIZE));
                }
            }
        }
    }

    /// Whether every byte of `[addr, addr + len)` is mapped.
    #[must_use]
    pub fn is_mapped(&self, addr: u32, len: u32) -> bool {
        self.check(addr, len as usize, AccessKind::Peek).is_ok()
    }

    /// Checks that every byte of `[addr, addr + len)` is mapped writable.
    ///
    /// # Errors
    ///
    /// The fault a [`MemoryMap::write`] of the same range would raise.
    pub fn check_writable(&self, addr: u32, len: u32) -> Result<(), MemoryFault> {
        self.check(addr, len as usize, AccessKind::Write)
    }

    /// Segment covering `addr`.
    #[must_use]
    pub fn segment_containing(&self, addr: u32) -> Option<&Segment> {
        self.segments
            .range(..=addr)
            .next_back()
            .map(|(_, segment)| segment)
            .filter(|segment| segment.contains(addr))
    }

    /// Reads guest data, requiring read permission.
    ///
    /// # Errors
    ///
    /// Faults on the first byte that is unmapped or unreadable.
    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryFault> {
        self.copy_out(addr, buf, AccessKind::Read)
    }

    /// Fetches instruction bytes, requiring execute permission.
    ///
    /// # Errors
    ///
    /// Faults on the first byte that is unmapped or not executable.
    pub fn fetch(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryFault> {
        self.copy_out(addr, buf, AccessKind::Fetch)
    }

    /// Reads mapped bytes regardless of permissions.
    ///
    /// # Errors
    ///
    /// Faults on the first unmapped byte.
    pub fn peek(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryFault> {
        self.copy_out(addr, buf, AccessKind::Peek)
    }

    /// Writes guest data, requiring write permission on every byte first.
    ///
    /// # Errors
    ///
    /// Faults without writing anything when any byte is unmapped or read-only.
    pub fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemoryFault> {
        self.check(addr, bytes.len(), AccessKind::Write)?;
        self.copy_in(addr, bytes);
        Ok(())
    }

    /// Writes mapped bytes regardless of permissions (loader and stack setup).
    ///
    /// # Errors
    ///
    /// Faults without writing anything when any byte is unmapped.
    pub fn poke(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemoryFault> {
        self.check(addr, bytes.len(), AccessKind::Peek)?;
        self.copy_in(addr, bytes);
        Ok(())
    }

    /// Reads a little-endian word.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::read`].
    pub fn read_u32(&self, addr: u32) -> Result<u32, MemoryFault> {
        let mut word = [0u8; 4];
        self.read(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Writes a little-endian word.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::write`].
    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryFault> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Reads `len` bytes into a new buffer.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::read`].
    pub fn read_vec(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryFault> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Reads a NUL-terminated string of at most `max` bytes, without the terminator.
    ///
    /// # Errors
    ///
    /// Faults when the string runs into unreadable memory.
    pub fn read_cstring(&self, addr: u32, max: usize) -> Result<Vec<u8>, MemoryFault> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while out.len() < max {
            let cursor = addr.wrapping_add(u32::try_from(out.len()).unwrap_or(u32::MAX));
            self.read(cursor, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
        }
        Ok(out)
    }

    /// Listing rows in address order.
    #[must_use]
    pub fn entries(&self) -> Vec<MapEntry> {
        self.segments
            .values()
            .map(|segment| MapEntry {
                start: segment.base,
                len: segment.len(),
                perms: segment.perms,
                name: segment.name.clone(),
            })
            .collect()
    }

    /// Renders the memory-map listing, one line per segment.
    #[must_use]
    pub fn render(&self, title: &str, prefix: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{prefix}{title}");
        for segment in self.segments.values() {
            let _ = writeln!(
                out,
                "{prefix}    0x{:08x} + 0x{:08x} = 0x{:09x} {} {}",
                segment.base,
                segment.len(),
                segment.end(),
                segment.perms,
                segment.name
            );
        }
        out
    }

    /// Writes the listing produced by [`MemoryMap::render`].
    ///
    /// # Errors
    ///
    /// Propagates writer failures.
    pub fn write_map(&self, out: &mut dyn io::Write, title: &str, prefix: &str) -> io::Result<()> {
        out.write_all(self.render(title, prefix).as_bytes())
    }

    fn overlapping(&self, start: u32, end: u64) -> Option<&Segment> {
        let last = match u32::try_from(end) {
            Ok(end) => self.segments.range(..end).next_back(),
            Err(_) => self.segments.iter().next_back(),
        };
        last.map(|(_, segment)| segment)
            .filter(|segment| segment.end() > u64::from(start))
    }

    fn split_at(&mut self, at: u64) {
        let Ok(at) = u32::try_from(at) else {
            return;
        };
        let Some(base) = self
            .segment_containing(at)
            .map(Segment::base)
            .filter(|base| *base != at)
        else {
            return;
        };
        if let Some(head) = self.segments.get_mut(&base) {
            let tail = head.split_off(at);
            self.segments.insert(at, tail);
        }
    }

    fn check(&self, addr: u32, len: usize, access: AccessKind) -> Result<(), MemoryFault> {
        let mut done = 0usize;
        while done < len {
            let segment = self.resolve(addr, done, access)?;
            let cursor = u64::from(addr) + done as u64;
            let available = usize::try_from(segment.end() - cursor).unwrap_or(usize::MAX);
            done += available.min(len - done);
        }
        Ok(())
    }

    fn resolve(&self, addr: u32, done: usize, access: AccessKind) -> Result<&Segment, MemoryFault> {
        let fault = |at: u32, kind| MemoryFault {
            addr: at,
            access,
            kind,
        };
        let cursor = u32::try_from(u64::from(addr) + done as u64)
            .map_err(|_| fault(u32::MAX, MemoryFaultKind::Unmapped))?;
        let segment = self
            .segment_containing(cursor)
            .ok_or_else(|| fault(cursor, MemoryFaultKind::Unmapped))?;
        if !segment.perms.contains(access.required()) {
            return Err(fault(cursor, MemoryFaultKind::Protection));
        }
        Ok(segment)
    }

    fn copy_out(&self, addr: u32, buf: &mut [u8], access: AccessKind) -> Result<(), MemoryFault> {
        let mut done = 0usize;
        while done < buf.len() {
            let segment = self.resolve(addr, done, access)?;
            let offset = (u64::from(addr) + done as u64 - u64::from(segment.base)) as usize;
            let count = (buf.len() - done).min(segment.data.len() - offset);
            buf[done..done + count].copy_from_slice(&segment.data[offset..offset + count]);
            done += count;
        }
        Ok(())
    }

    fn copy_in(&mut self, addr: u32, bytes: &[u8]) {
        let mut done = 0usize;
        while done < bytes.len() {
            let Ok(cursor) = u32::try_from(u64::from(addr) + done as u64) else {
                return;
            };
            let Some(segment) = self
                .segments
                .range_mut(..=cursor)
                .next_back()
                .map(|(_, segment)| segment)
                .filter(|segment| segment.contains(cursor))
            else {
                return;
            };
            let offset = (cursor - segment.base) as usize;
            let count = (bytes.len() - done).min(segment.data.len() - offset);
            segment.data[offset..offset + count].copy_from_slice(&bytes[done..done + count]);
            done += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MapError, MemoryMap, Segment};
    use crate::memory::{MemoryFaultKind, Permissions, PAGE_SIZE};

    fn two_page_map() -> MemoryMap {
        let mut map = MemoryMap::new();
        map.map(Segment::zeroed(0x1000, 0x1000, Permissions::RW, "a"))
            .expect("map a");
        map.map(Segment::zeroed(0x2000, 0x1000, Permissions::RW, "b"))
            .expect("map b");
        map
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let mut map = two_page_map();
        let err = map
            .map(Segment::zeroed(0x1800, 0x100, Permissions::READ, "c"))
            .expect_err("overlap");
        assert_eq!(
            err,
            MapError::Overlap {
                base: 0x1800,
                len: 0x100,
                existing: 0x1000
            }
        );
        assert!(matches!(
            map.map(Segment::zeroed(0x5000, 0, Permissions::READ, "empty")),
            Err(MapError::Empty { .. })
        ));
    }

    #[test]
    fn access_spans_adjacent_segments() {
        let mut map = two_page_map();
        map.write(0x1FFE, &[1, 2, 3, 4]).expect("spanning write");
        let mut buf = [0u8; 4];
        map.read(0x1FFE, &mut buf).expect("spanning read");
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn write_into_gap_leaves_memory_untouched() {
        let mut map = two_page_map();
        let fault = map.write(0x2FFE, &[9, 9, 9, 9]).expect_err("gap");
        assert_eq!(fault.addr, 0x3000);
        assert_eq!(fault.kind, MemoryFaultKind::Unmapped);
        assert_eq!(map.read_vec(0x2FFE, 2).expect("read"), vec![0, 0]);
    }

    #[test]
    fn protect_splits_and_enforces() {
        let mut map = two_page_map();
        map.protect(0x1000, 0x800, Permissions::READ).expect("protect");
        assert_eq!(map.len(), 3);
        let fault = map.write_u32(0x1004, 7).expect_err("read-only");
        assert_eq!(fault.kind, MemoryFaultKind::Protection);
        map.write_u32(0x1800, 7).expect("still writable");
        assert!(map.protect(0x2800, 0x1000, Permissions::READ).is_err());
    }

    #[test]
    fn writable_check_matches_write() {
        let mut map = two_page_map();
        map.protect(0x2000, 0x1000, Permissions::READ).expect("protect");
        map.check_writable(0x1000, 0x1000).expect("writable page");
        let fault = map.check_writable(0x1FFC, 8).expect_err("read-only tail");
        assert_eq!(fault.kind, MemoryFaultKind::Protection);
        assert_eq!(fault.addr, 0x2000);
        let fault = map.check_writable(0x3000, 4).expect_err("gap");
        assert_eq!(fault.kind, MemoryFaultKind::Unmapped);
        assert!(map.check_writable(0x4000, 0).is_ok());
    }

    #[test]
    fn unmap_splits_segments() {
        let mut map = two_page_map();
        map.unmap(0x1800, 0x1000);
        let entries = map.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].start, entries[0].len), (0x1000, 0x800));
        assert_eq!((entries[1].start, entries[1].len), (0x2800, 0x800));
        assert!(!map.is_mapped(0x1800, 1));
    }

    #[test]
    fn find_free_skips_existing_segments() {
        let map = two_page_map();
        assert_eq!(map.find_free(PAGE_SIZE, 0x1000, 1 << 32), Some(0x3000));
        assert_eq!(map.find_free(PAGE_SIZE, 0x0, 1 << 32), Some(0x0));
        assert_eq!(map.find_free(PAGE_SIZE, 0x1000, 0x3800), None);
    }

    #[test]
    fn cstring_stops_at_nul() {
        let mut map = two_page_map();
        map.write(0x1100, b"hello\0world").expect("write");
        assert_eq!(map.read_cstring(0x1100, 64).expect("read"), b"hello");
        assert_eq!(map.read_cstring(0x1100, 3).expect("read"), b"hel");
    }

    #[test]
    fn render_lists_every_segment() {
        let map = two_page_map();
        let text = map.render("Memory map:", "  ");
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("0x00001000 + 0x00001000 = 0x000002000 rw- a"));
    }
}
