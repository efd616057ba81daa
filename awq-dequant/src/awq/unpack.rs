use rayon::iter::{IndexedParallelIterator, ParallelIterator};
use rayon::slice::{ParallelSlice, ParallelSliceMut};

/// Number of 4-bit values held by one packed `u32`.
pub const AWQ_PACK_FACTOR: usize = 8;

/// Column interleave of the AWQ packing format. Logical column `slot` of a block of 8 is
/// stored in nibble `AWQ_ORDER[slot]` of the packed word.
pub const AWQ_ORDER: [usize; AWQ_PACK_FACTOR] = [0, 4, 1, 5, 2, 6, 3, 7];

const NIBBLE_MASK: u32 = 0xF;

/// Split a packed word into its 8 nibbles, least significant first.
#[inline(always)]
pub fn unpack_word(word: u32) -> [u8; AWQ_PACK_FACTOR] {
    let mut out = [0u8; AWQ_PACK_FACTOR];
    for (k, v) in out.iter_mut().enumerate() {
        *v = ((word >> (4 * k)) & NIBBLE_MASK) as u8;
    }
    out
}

/// Reorder one unpacked block of 8 nibbles into logical column order.
#[inline(always)]
pub fn permute_block(block: &[u8; AWQ_PACK_FACTOR]) -> [u8; AWQ_PACK_FACTOR] {
    let mut out = [0u8; AWQ_PACK_FACTOR];
    for (slot, v) in out.iter_mut().enumerate() {
        *v = block[AWQ_ORDER[slot]];
    }
    out
}

/// The 8 nibbles of `word` in logical column order. Same as `permute_block(&unpack_word(word))`.
#[inline(always)]
pub fn unpack_reordered(word: u32) -> [u8; AWQ_PACK_FACTOR] {
    let mut out = [0u8; AWQ_PACK_FACTOR];
    for (slot, v) in out.iter_mut().enumerate() {
        *v = ((word >> (4 * AWQ_ORDER[slot])) & NIBBLE_MASK) as u8;
    }
    out
}

/// Unpack a row-major `rows x cols_packed` word matrix into `rows x cols_packed*8` nibbles,
/// without reordering.
pub fn unpack(packed: &[u32], rows: usize, cols_packed: usize) -> Vec<u8> {
    debug_assert_eq!(packed.len(), rows * cols_packed);
    packed.iter().flat_map(|w| unpack_word(*w)).collect()
}

/// Apply `AWQ_ORDER` to every block of 8 columns of an unpacked row-major matrix.
pub fn permute_columns(unpacked: &[u8], cols: usize) -> Vec<u8> {
    debug_assert_eq!(cols % AWQ_PACK_FACTOR, 0);
    let mut out = vec![0u8; unpacked.len()];
    for (src, dst) in unpacked
        .chunks_exact(AWQ_PACK_FACTOR)
        .zip(out.chunks_exact_mut(AWQ_PACK_FACTOR))
    {
        for (slot, v) in dst.iter_mut().enumerate() {
            *v = src[AWQ_ORDER[slot]];
        }
    }
    out
}

/// Unpack and reorder a packed matrix into `dst` (`rows x cols_packed*8`), rows in parallel.
pub fn unpack_reordered_into(dst: &mut [u8], packed: &[u32], cols_packed: usize) {
    let cols = cols_packed * AWQ_PACK_FACTOR;
    debug_assert_eq!(dst.len(), packed.len() * AWQ_PACK_FACTOR);
    if cols == 0 {
        return;
    }
    dst.par_chunks_mut(cols)
        .zip(packed.par_chunks(cols_packed))
        .for_each(|(dst_row, src_row)| {
            for (dst_block, word) in dst_row.chunks_exact_mut(AWQ_PACK_FACTOR).zip(src_row) {
                dst_block.copy_from_slice(&unpack_reordered(*word));
            }
        });
}
