//! Device memory: tensors, the memory manager, the static memory plan, the
//! persistent tensor store and the input copy store
//!
//! # Lifetime model
//!
//! Every non-persistent tensor carries an original reference count equal to
//! the number of releases one run performs on it: one by its producer after
//! launch, one per consuming input slot and one per graph output reading it.
//! When the count reaches zero the memory is freed and the count restored, so
//! each run starts from the same state. Tensors covered by the static memory
//! plan or bound into the store are persistent and never freed by counting.

pub mod copy_store;
pub mod device_tensor;
pub mod manager;
pub mod somas;
pub mod tensor_store;

pub use copy_store::DeviceTensorCopyStore;
pub use device_tensor::{DeviceTensor, PERSISTENT_REF_COUNT};
pub use manager::{MemoryClient, MemoryManager, MemoryService, MemoryStats};
pub use somas::{SomasInfo, SomasPlan};
pub use tensor_store::DeviceTensorStore;
