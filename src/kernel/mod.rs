//! Kernel executable node interface
//!
//! A [`KernelMod`] is the resolved implementation of one graph node. The
//! scheduler never looks inside it: it only asks for shape inference, resize,
//! size lists and launches.

pub mod shape_kind;
pub mod tensor;

use std::fmt;

use thiserror::Error;

use crate::device::{DeviceContext, StreamId};

pub use shape_kind::{InferStage, ShapeKind, StagePlan};
pub use tensor::{bytes_to_f32, f32_to_bytes, DType, Format, HostTensor, KernelTensor, TensorInfo};

/// Error raised by a kernel's inference or shape update
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct KernelError {
    message: String,
}

impl KernelError {
    pub fn new(message: impl Into<String>) -> Self {
        KernelError {
            message: message.into(),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Outcome of [`KernelMod::resize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStatus {
    Ok,
    ResizeFailed,
    /// Output shape only known after launch
    UnknownOutShape,
}

impl fmt::Display for ResizeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResizeStatus::Ok => write!(f, "Ok"),
            ResizeStatus::ResizeFailed => write!(f, "ResizeFailed"),
            ResizeStatus::UnknownOutShape => write!(f, "UnknownOutShape"),
        }
    }
}

/// Operands of one kernel launch
#[derive(Debug, Clone, Copy)]
pub struct LaunchArgs<'a> {
    pub inputs: &'a [KernelTensor],
    pub workspace: &'a [KernelTensor],
    pub outputs: &'a [KernelTensor],
}

/// Resolved kernel implementation of one graph node
pub trait KernelMod: Send + Sync {
    /// Primitive name, used in logs and failure diagnostics
    fn name(&self) -> &str;

    /// Infer output shapes from the current inputs
    ///
    /// The default keeps the current output shapes.
    fn infer_shape(
        &self,
        _inputs: &[KernelTensor],
        outputs: &[KernelTensor],
    ) -> KernelResult<Vec<Vec<usize>>> {
        Ok(outputs.iter().map(|o| o.shape.clone()).collect())
    }

    /// Infer output shapes and element types
    fn infer_shape_and_type(
        &self,
        inputs: &[KernelTensor],
        outputs: &[KernelTensor],
    ) -> KernelResult<Vec<(Vec<usize>, DType)>> {
        let shapes = self.infer_shape(inputs, outputs)?;
        Ok(shapes
            .into_iter()
            .zip(outputs.iter().map(|o| o.dtype))
            .collect())
    }

    /// Recompute output and workspace sizes for the given operands
    fn resize(&mut self, inputs: &[KernelTensor], outputs: &[KernelTensor]) -> ResizeStatus;

    /// Enqueue the kernel on `stream`; `false` reports failure
    fn launch(&self, args: &LaunchArgs<'_>, stream: StreamId, device: &dyn DeviceContext) -> bool;

    fn output_size_list(&self) -> Vec<usize>;

    fn workspace_size_list(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Output shapes are only final after launch
    fn need_update_output_shape_and_size(&self) -> bool {
        false
    }

    /// Final output shapes, read after launch
    fn update_output_shape_and_size(
        &mut self,
        _inputs: &[KernelTensor],
        outputs: &[KernelTensor],
    ) -> KernelResult<Vec<Vec<usize>>> {
        Ok(outputs.iter().map(|o| o.shape.clone()).collect())
    }

    /// Inference reads host data that an earlier stage must have produced
    fn need_user_data(&self) -> bool {
        false
    }

    /// Inputs the kernel never reads; they are not adapted or copied
    fn launch_ignored_inputs(&self) -> Vec<usize> {
        Vec::new()
    }
}

impl fmt::Debug for dyn KernelMod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelMod({})", self.name())
    }
}
