//! Guest address space: permissioned segments and access checking.

/// Permission bits, fault records and page arithmetic.
pub mod access;
/// Segment map and memory-map listing.
pub mod map;

pub use access::{
    is_page_aligned, page_ceil, page_floor, AccessKind, MemoryFault, MemoryFaultKind,
    Permissions, PAGE_SIZE,
};
pub use map::{MapEntry, MapError, MemoryMap, Segment};

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{MemoryMap, Permissions, Segment};

    const BASE: u32 = 0x0040_0000;
    const LEN: u32 = 0x3000;

    fn rw_map() -> MemoryMap {
        let mut map = MemoryMap::new();
        map.map(Segment::zeroed(BASE, LEN, Permissions::RW, "data"))
            .expect("map data");
        map
    }

    proptest! {
        #[test]
        fn write_then_read_returns_written_bytes(
            offset in 0u32..LEN,
            bytes in proptest::collection::vec(any::<u8>(), 1..256),
        ) {
            let mut map = rw_map();
            let len = u32::try_from(bytes.len()).expect("small");
            prop_assume!(offset + len <= LEN);
            map.write(BASE + offset, &bytes).expect("in-bounds write");
            let mut back = vec![0u8; bytes.len()];
            map.read(BASE + offset, &mut back).expect("in-bounds read");
            prop_assert_eq!(back, bytes);
        }

        #[test]
        fn accesses_outside_every_segment_fault(addr in any::<u32>(), len in 1usize..64) {
            let map = rw_map();
            let end = u64::from(addr) + len as u64;
            prop_assume!(end <= u64::from(BASE) || u64::from(addr) >= u64::from(BASE + LEN));
            let mut buf = vec![0u8; len];
            prop_assert!(map.read(addr, &mut buf).is_err());
        }
    }
}
