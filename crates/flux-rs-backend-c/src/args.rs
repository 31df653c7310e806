//! Packing of kernel arguments into the `struct kargs_<name>` every host
//! kernel receives.

use flux_rs::kernel::{ArgType, KernelArgs};

/// Field offsets of the argument struct under natural C alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StructLayout {
    pub offsets: Vec<usize>,
    pub size: usize,
}

impl StructLayout {
    pub fn of(types: &[ArgType]) -> Self {
        let mut offsets = Vec::with_capacity(types.len());
        let mut cursor = 0usize;
        let mut max_align = 1usize;
        for ty in types {
            let align = ty.size_bytes();
            max_align = max_align.max(align);
            cursor = cursor.next_multiple_of(align);
            offsets.push(cursor);
            cursor += ty.size_bytes();
        }
        Self {
            offsets,
            size: cursor.next_multiple_of(max_align),
        }
    }
}

/// Serialises `args` into 8-byte aligned words laid out like the C struct.
pub(crate) fn pack(layout: &StructLayout, args: &KernelArgs) -> Vec<u64> {
    let mut bytes = vec![0u8; layout.size.next_multiple_of(8)];
    for (offset, value) in layout.offsets.iter().zip(args.values()) {
        let encoded = value.to_ne_bytes();
        bytes[*offset..*offset + encoded.len()].copy_from_slice(&encoded);
    }
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_ne_bytes(word)
        })
        .collect()
}
