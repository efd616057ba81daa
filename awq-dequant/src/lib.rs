mod awq;
mod config;
mod descriptor;
mod error;
mod registry;
pub mod reference;
mod stream;
mod tensor;
mod utils;

pub use awq::{
    awq_dequantize, dequantize_rows, expand_groups, expand_groups_into, permute_block,
    permute_columns, select_kernel, unpack, unpack_reordered, unpack_reordered_into, unpack_word,
    AwqFloat, GroupedRows, KernelFn, KernelShape, AWQ_ORDER, AWQ_PACK_FACTOR,
};
pub use config::{AwqConfig, AwqVersion};
pub use descriptor::{AwqDequantizeDescriptor, AwqDequantizeInfo, Handle, RawBuffers};
pub use error::{AwqError, AwqStatus, Result};
pub use registry::DescriptorTable;
pub use stream::Stream;
pub use tensor::{FloatDType, FloatSlice, FloatSliceMut, TensorDesc};
