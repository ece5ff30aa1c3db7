//! Error classes surfaced by graph construction and the compile passes.
//!
//! [`ContractViolation`] signals a defect introduced earlier in the pipeline (malformed arity,
//! a cycle, a refused stage operation, ...). It is fatal: callers abort compilation and never
//! retry. [`NegotiationError`] is a property of the particular model being compiled and may be
//! reported to the user as an ordinary compilation failure.

use thiserror::Error;

use crate::blob::BlobError;
use crate::model::{DataId, Dim, DimStride};
use crate::stages::{StageId, StageKind};

/// Fatal invariant or contract violation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContractViolation {
    #[error("stage `{stage}` ({kind}): {operation} must never be called")]
    MustNeverBeCalled {
        stage: String,
        kind: StageKind,
        operation: &'static str,
    },
    #[error(
        "stage `{stage}` ({kind}) expects {expected_inputs} input(s) and {expected_outputs} \
         output(s), got {inputs} and {outputs}"
    )]
    Arity {
        stage: String,
        kind: StageKind,
        expected_inputs: usize,
        expected_outputs: usize,
        inputs: usize,
        outputs: usize,
    },
    #[error("data `{data}` is already produced by stage `{producer}`")]
    MultipleProducers { data: String, producer: String },
    #[error("network input `{data}` cannot be produced by stage `{stage}`")]
    ProducedNetworkInput { data: String, stage: String },
    #[error("wiring stage `{stage}` would create a cycle through data `{data}`")]
    Cycle { stage: String, data: String },
    #[error("data `{data}` has no producer")]
    MissingProducer { data: String },
    #[error("data `{data}` is neither produced nor consumed")]
    OrphanData { data: String },
    #[error("inconsistent edge between stage `{stage}` and data `{data}`")]
    DanglingEdge { stage: String, data: String },
    #[error("unknown data handle {0}")]
    UnknownData(DataId),
    #[error("unknown stage handle {0}")]
    UnknownStage(StageId),
    #[error("stage `{stage}` params are not of type {expected}")]
    ParamsMismatch {
        stage: String,
        expected: &'static str,
    },
    #[error("stage `{stage}` ({kind}): assertion failed: {message}")]
    Assertion {
        stage: String,
        kind: StageKind,
        message: String,
    },
    #[error("data `{data}`: {message}")]
    DataInvariant { data: String, message: String },
}

/// Recoverable outcome of layout negotiation for a particular model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NegotiationError {
    #[error(
        "conflicting stride demands on `{data}` axis {dim}: {existing} ({existing_source}) vs \
         {demanded} (stage `{demanded_by}`)"
    )]
    Conflict {
        data: String,
        dim: Dim,
        existing: DimStride,
        demanded: DimStride,
        existing_source: String,
        demanded_by: String,
    },
    #[error("fixed point over [{passes}] still changing after {iterations} iterations")]
    NotConverged { passes: String, iterations: usize },
    #[error(
        "stage `{stage}` needs `{data}` at scale {requested}, but it is already scaled by \
         {current}"
    )]
    ScaleMismatch {
        data: String,
        stage: String,
        current: f32,
        requested: f32,
    },
    #[error("`{data}` axis {dim}: fixed stride {demanded} is below the minimum {minimum}")]
    InfeasibleStride {
        data: String,
        dim: Dim,
        demanded: u32,
        minimum: usize,
    },
}

/// Any failure produced while building or compiling a [`Model`](crate::Model).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl CompileError {
    /// Returns `true` for compiler-bug class errors that must abort compilation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CompileError::Negotiation(_))
    }

    pub fn as_contract(&self) -> Option<&ContractViolation> {
        match self {
            CompileError::Contract(violation) => Some(violation),
            _ => None,
        }
    }

    pub fn as_negotiation(&self) -> Option<&NegotiationError> {
        match self {
            CompileError::Negotiation(err) => Some(err),
            _ => None,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
