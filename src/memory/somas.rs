//! Static memory plan
//!
//! The graph compiler may lay out fixed-size tensors at known offsets inside
//! one or more base blocks. [`SomasInfo`] is the compile-time description;
//! [`SomasPlan`] is the allocated form the actors read from.
//!
//! With merged blocks, an offset belongs to the block with the greatest start
//! offset not above it:
//!
//! ```text
//! blocks:   [0 ........ 256)[256 ...... 384)[384 .. 512)
//! offset 300 -> block starting at 256, address = base(256) + 44
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::device::{DeviceContext, DevicePtr};
use crate::error::{RuntimeError, RuntimeResult};

/// Compile-time layout of the static memory plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SomasInfo {
    whole_block_size: usize,
    /// Sizes of merged blocks, in offset order; empty for one contiguous block
    merged_block_sizes: Vec<usize>,
    device_index: usize,
}

impl SomasInfo {
    /// One contiguous block of `size` bytes
    pub fn single_block(size: usize) -> Self {
        SomasInfo {
            whole_block_size: size,
            merged_block_sizes: Vec::new(),
            device_index: 0,
        }
    }

    /// Several independently allocated blocks laid out back to back
    pub fn merged_blocks(sizes: Vec<usize>) -> Self {
        SomasInfo {
            whole_block_size: sizes.iter().sum(),
            merged_block_sizes: sizes,
            device_index: 0,
        }
    }

    pub fn on_device(mut self, index: usize) -> Self {
        self.device_index = index;
        self
    }

    pub fn whole_block_size(&self) -> usize {
        self.whole_block_size
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn is_merged(&self) -> bool {
        !self.merged_block_sizes.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct MergedBlock {
    base: DevicePtr,
    size: usize,
}

/// Allocated static memory plan; base blocks are freed on drop
#[derive(Debug)]
pub struct SomasPlan {
    device: Arc<dyn DeviceContext>,
    whole_block_size: usize,
    base_address: DevicePtr,
    /// Start offset -> block
    merged_base_addresses: BTreeMap<usize, MergedBlock>,
}

impl SomasPlan {
    /// Allocate the base block(s) described by `info`
    pub fn allocate(info: &SomasInfo, device: Arc<dyn DeviceContext>) -> RuntimeResult<Self> {
        let mut plan = SomasPlan {
            device,
            whole_block_size: info.whole_block_size,
            base_address: DevicePtr::NULL,
            merged_base_addresses: BTreeMap::new(),
        };

        if info.is_merged() {
            let mut offset = 0;
            for size in &info.merged_block_sizes {
                // On failure `plan` drops and releases what was allocated so far.
                let base = plan.device.allocate(*size)?;
                plan.merged_base_addresses
                    .insert(offset, MergedBlock { base, size: *size });
                offset += size;
            }
        } else {
            plan.base_address = plan.device.allocate(info.whole_block_size)?;
        }

        info!(
            whole_block_size = info.whole_block_size,
            blocks = plan.merged_base_addresses.len().max(1),
            "static memory plan allocated"
        );
        Ok(plan)
    }

    pub fn whole_block_size(&self) -> usize {
        self.whole_block_size
    }

    /// Address of a `size`-byte tensor placed at `offset`
    pub fn device_ptr(&self, offset: usize, size: usize) -> RuntimeResult<DevicePtr> {
        if self.merged_base_addresses.is_empty() {
            if self.base_address.is_null() {
                return Err(RuntimeError::SomasMismatch(
                    "static memory plan base address is null".to_string(),
                ));
            }
            if offset + size > self.whole_block_size {
                return Err(RuntimeError::SomasMismatch(format!(
                    "tensor at offset {} with size {} exceeds plan size {}",
                    offset, size, self.whole_block_size
                )));
            }
            return Ok(self.base_address.offset(offset));
        }

        let (start, block) = self
            .merged_base_addresses
            .range(..=offset)
            .next_back()
            .ok_or_else(|| {
                RuntimeError::SomasMismatch(format!("no merged block contains offset {}", offset))
            })?;
        let relative = offset - start;
        if relative + size > block.size {
            return Err(RuntimeError::SomasMismatch(format!(
                "tensor at offset {} with size {} crosses the merged block starting at {}",
                offset, size, start
            )));
        }
        Ok(block.base.offset(relative))
    }
}

impl Drop for SomasPlan {
    fn drop(&mut self) {
        let bases = std::iter::once(self.base_address)
            .chain(self.merged_base_addresses.values().map(|b| b.base))
            .filter(|p| !p.is_null());
        for base in bases {
            if let Err(e) = self.device.free(base) {
                warn!(%base, error = %e, "failed to release static memory plan block");
            }
        }
        debug!("static memory plan released");
    }
}
