//! Initial stack construction.
//!
//! From `sp` upwards: `argc`, `argv[]` and a null, `envp[]` and a null, the
//! auxiliary vector, then the strings themselves near the top of the stack.

use crate::memory::{MemoryFault, MemoryMap};

/// End of the auxiliary vector.
pub const AT_NULL: u32 = 0;
/// Page size entry.
pub const AT_PAGESZ: u32 = 6;
/// Entry point entry.
pub const AT_ENTRY: u32 = 9;

const STACK_ALIGN: u32 = 16;

/// Writes the initial stack below `top` and returns the resulting `sp`.
///
/// # Errors
///
/// Fails when the stack segment is too small for the vectors and strings.
pub fn build_initial_stack(
    memory: &mut MemoryMap,
    top: u32,
    argv: &[String],
    envp: &[String],
    entry: u32,
) -> Result<u32, MemoryFault> {
    let mut cursor = top;
    let mut push_string = |memory: &mut MemoryMap, text: &str| -> Result<u32, MemoryFault> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        cursor = cursor.wrapping_sub(len);
        memory.write(cursor, &bytes)?;
        Ok(cursor)
    };

    let mut env_ptrs = Vec::with_capacity(envp.len());
    for var in envp.iter().rev() {
        env_ptrs.push(push_string(memory, var)?);
    }
    env_ptrs.reverse();
    let mut arg_ptrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        arg_ptrs.push(push_string(memory, arg)?);
    }
    arg_ptrs.reverse();

    let argc = u32::try_from(argv.len()).unwrap_or(u32::MAX);
    let mut words = Vec::with_capacity(argv.len() + envp.len() + 9);
    words.push(argc);
    words.extend_from_slice(&arg_ptrs);
    words.push(0);
    words.extend_from_slice(&env_ptrs);
    words.push(0);
    words.extend_from_slice(&[AT_PAGESZ, crate::memory::PAGE_SIZE, AT_ENTRY, entry, AT_NULL, 0]);

    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    let size = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    let sp = cursor.wrapping_sub(size) & !(STACK_ALIGN - 1);
    memory.write(sp, &bytes)?;
    Ok(sp)
}

#[cfg(test)]
mod tests {
    use super::{build_initial_stack, AT_ENTRY, AT_NULL, AT_PAGESZ};
    use crate::memory::{MemoryMap, Permissions, Segment};

    const TOP: u32 = 0x0010_0000;

    fn stack() -> MemoryMap {
        let mut memory = MemoryMap::new();
        memory
            .map(Segment::zeroed(TOP - 0x2000, 0x2000, Permissions::RW, "[stack]"))
            .expect("map stack");
        memory
    }

    fn string_at(memory: &MemoryMap, addr: u32) -> String {
        String::from_utf8(memory.read_cstring(addr, 256).expect("string")).expect("utf8")
    }

    #[test]
    fn argc_argv_envp_and_auxv_are_laid_out_upwards() {
        let mut memory = stack();
        let argv = vec!["prog".to_string(), "-v".to_string()];
        let envp = vec!["HOME=/".to_string()];
        let sp = build_initial_stack(&mut memory, TOP, &argv, &envp, 0x0804_8000).expect("stack");
        assert_eq!(sp % 16, 0);

        let word = |index: u32| memory.read_u32(sp + index * 4).expect("word");
        assert_eq!(word(0), 2);
        assert_eq!(string_at(&memory, word(1)), "prog");
        assert_eq!(string_at(&memory, word(2)), "-v");
        assert_eq!(word(3), 0);
        assert_eq!(string_at(&memory, word(4)), "HOME=/");
        assert_eq!(word(5), 0);
        assert_eq!(
            [word(6), word(7), word(8), word(9), word(10), word(11)],
            [AT_PAGESZ, 4096, AT_ENTRY, 0x0804_8000, AT_NULL, 0]
        );
    }

    #[test]
    fn undersized_stack_faults() {
        let mut memory = stack();
        let huge = vec!["x".repeat(0x3000)];
        assert!(build_initial_stack(&mut memory, TOP, &huge, &[], 0).is_err());
    }
}
