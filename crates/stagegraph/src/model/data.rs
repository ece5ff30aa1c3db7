use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::dims::{Dim, DimValues, DimsOrder};
use super::strides::{DimStride, StridesRequirement};
use crate::stages::StageId;

/// Handle of a [`Data`] node inside its owning [`Model`](super::Model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId(pub u32);

impl DataId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%d{}", self.0)
    }
}

/// Per-tensor results returned by stage operations, ordered by handle.
pub type DataMap<T> = BTreeMap<DataId, T>;

/// Element types understood by the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Fp16,
    Fp32,
    U8,
    S32,
}

impl DataType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::Fp16 => 2,
            DataType::Fp32 | DataType::S32 => 4,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            DataType::Fp16 => 0,
            DataType::U8 => 1,
            DataType::S32 => 2,
            DataType::Fp32 => 3,
        }
    }
}

/// Immutable element type and named-axis shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataDesc {
    dtype: DataType,
    dims: DimValues,
}

impl DataDesc {
    pub fn new(dtype: DataType, dims: impl Into<DimValues>) -> Self {
        Self {
            dtype,
            dims: dims.into(),
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn dims(&self) -> &DimValues {
        &self.dims
    }

    pub fn dim(&self, dim: Dim) -> Option<usize> {
        self.dims.get(dim)
    }

    pub fn total_elements(&self) -> usize {
        self.dims.product()
    }
}

/// Role of a tensor in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataUsage {
    /// Network input; never produced by a stage.
    Input,
    /// Produced and consumed inside the network.
    Intermediate,
    /// Produced inside the network and returned to the caller.
    Output,
}

/// Whether the batch axis of a tensor may be split for parallel execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchSupport {
    #[default]
    Split,
    /// The tensor must be processed as a whole batch.
    Whole,
}

/// Tensor node of the stage graph.
#[derive(Debug, Clone)]
pub struct Data {
    pub(crate) id: DataId,
    pub(crate) name: String,
    pub(crate) desc: DataDesc,
    pub(crate) usage: DataUsage,
    pub(crate) order: DimsOrder,
    pub(crate) required_strides: StridesRequirement,
    pub(crate) strides: Option<DimValues>,
    pub(crate) scale: f32,
    pub(crate) batch: BatchSupport,
    pub(crate) producer: Option<StageId>,
    pub(crate) consumers: SmallVec<[StageId; 4]>,
}

impl Data {
    pub(crate) fn new(id: DataId, name: String, desc: DataDesc, usage: DataUsage) -> Self {
        let order = DimsOrder::default_for(desc.dims());
        Self {
            id,
            name,
            desc,
            usage,
            order,
            required_strides: StridesRequirement::empty(),
            strides: None,
            scale: 1.0,
            batch: BatchSupport::Split,
            producer: None,
            consumers: SmallVec::new(),
        }
    }

    pub fn id(&self) -> DataId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &DataDesc {
        &self.desc
    }

    pub fn usage(&self) -> DataUsage {
        self.usage
    }

    pub fn order(&self) -> &DimsOrder {
        &self.order
    }

    pub fn required_strides(&self) -> &StridesRequirement {
        &self.required_strides
    }

    /// Requirement for a named axis under the current order.
    pub fn requirement_for(&self, dim: Dim) -> DimStride {
        self.order
            .dim_ind(dim)
            .map(|pos| self.required_strides.get(pos))
            .unwrap_or_default()
    }

    /// Byte strides resolved by layout finalization.
    pub fn strides(&self) -> Option<&DimValues> {
        self.strides.as_ref()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn batch_support(&self) -> BatchSupport {
        self.batch
    }

    pub fn producer(&self) -> Option<StageId> {
        self.producer
    }

    /// Consumers in wiring order.
    pub fn consumers(&self) -> &[StageId] {
        &self.consumers
    }

    /// Byte strides of a dense tensor in the current order.
    pub fn compact_strides(&self) -> DimValues {
        let mut strides = DimValues::new();
        let mut stride = self.desc.dtype().size_in_bytes();
        for dim in self.order.dims() {
            strides.set(*dim, stride);
            stride *= self.desc.dim(*dim).unwrap_or(1);
        }
        strides
    }

    /// Resolves concrete byte strides from the order and requirement.
    ///
    /// Positions without a fixed stride get the smallest stride that keeps the inner
    /// positions dense. Returns the offending axis, demand and minimum when a fixed stride
    /// cannot hold the inner positions.
    pub(crate) fn resolve_strides(&self) -> Result<DimValues, (Dim, u32, usize)> {
        let mut strides = DimValues::new();
        let mut minimum = self.desc.dtype().size_in_bytes();
        for (pos, dim) in self.order.dims().iter().enumerate() {
            let stride = match self.required_strides.get(pos) {
                DimStride::Fixed(bytes) if (bytes as usize) < minimum => {
                    return Err((*dim, bytes, minimum));
                }
                DimStride::Fixed(bytes) => bytes as usize,
                DimStride::Any | DimStride::Compact => minimum,
            };
            strides.set(*dim, stride);
            minimum = stride * self.desc.dim(*dim).unwrap_or(1);
        }
        Ok(strides)
    }

    /// Describes the first position whose resolved stride violates the requirement.
    pub(crate) fn layout_violation(&self) -> Option<String> {
        let Some(strides) = self.strides.as_ref() else {
            return Some("strides were never resolved".to_string());
        };
        let mut compact = self.desc.dtype().size_in_bytes();
        for (pos, dim) in self.order.dims().iter().enumerate() {
            let Some(stride) = strides.get(*dim) else {
                return Some(format!("no resolved stride for axis {dim}"));
            };
            if !self.required_strides.is_satisfied_by(pos, stride, compact) {
                return Some(format!(
                    "axis {dim} stride {stride} violates {}",
                    self.required_strides.get(pos)
                ));
            }
            compact = stride * self.desc.dim(*dim).unwrap_or(1);
        }
        None
    }
}
