mod awq_cpu;
pub(crate) mod expand;
pub(crate) mod kernel;
pub(crate) mod unpack;

pub use awq_cpu::awq_dequantize;
pub use expand::{expand_groups, expand_groups_into, GroupedRows};
pub use kernel::{dequantize_rows, select_kernel, AwqFloat, KernelFn, KernelShape};
pub use unpack::{
    permute_block, permute_columns, unpack, unpack_reordered, unpack_reordered_into, unpack_word,
    AWQ_ORDER, AWQ_PACK_FACTOR,
};
