//! Tensor descriptors shared by kernels, the graph and the scheduler

use std::fmt;

use serde::Serialize;

use crate::device::{DevicePtr, StreamId};

/// Element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DType {
    F32,
    F16,
    I32,
    I64,
    U8,
    Bool,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::U8 | DType::Bool => 1,
        }
    }
}

/// Memory layout of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Format {
    #[default]
    Default,
    Nd,
    Nchw,
    Nhwc,
    Nc1hwc0,
    FracZ,
}

impl Format {
    /// Formats that describe the same byte layout
    ///
    /// Default, ND and NCHW are all the plain row-major layout.
    pub fn is_equivalent(&self, other: &Format) -> bool {
        self == other || (self.is_row_major() && other.is_row_major())
    }

    fn is_row_major(&self) -> bool {
        matches!(self, Format::Default | Format::Nd | Format::Nchw)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Default => "DefaultFormat",
            Format::Nd => "ND",
            Format::Nchw => "NCHW",
            Format::Nhwc => "NHWC",
            Format::Nc1hwc0 => "NC1HWC0",
            Format::FracZ => "FRACTAL_Z",
        };
        f.write_str(name)
    }
}

/// Static description of one tensor: shape, element type and layout
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TensorInfo {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub format: Format,
}

impl TensorInfo {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        TensorInfo {
            shape,
            dtype,
            format: Format::Default,
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }
}

/// Read-only snapshot of a device tensor handed to a kernel module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTensor {
    pub ptr: DevicePtr,
    pub size: usize,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub format: Format,
    pub stream_id: StreamId,
}

impl KernelTensor {
    pub fn info(&self) -> TensorInfo {
        TensorInfo {
            shape: self.shape.clone(),
            dtype: self.dtype,
            format: self.format,
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Tensor data living in host memory (graph inputs, outputs, parameters)
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub info: TensorInfo,
    pub data: Vec<u8>,
}

impl HostTensor {
    pub fn new(info: TensorInfo, data: Vec<u8>) -> Self {
        HostTensor { info, data }
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        HostTensor {
            info: TensorInfo::new(shape, DType::F32),
            data,
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.info.format = format;
        self
    }

    /// Interpret the bytes as little-endian f32 values
    pub fn to_f32(&self) -> Vec<f32> {
        bytes_to_f32(&self.data)
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// Little-endian f32 decode; trailing partial values are dropped
pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
