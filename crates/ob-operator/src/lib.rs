#![forbid(unsafe_code)]

//! Forward/adjoint operator contract.
//!
//! Every operator declares a fixed arity and implements `compute_forward` and
//! `compute_adjoint`. The provided `forward` and `adjoint` methods check
//! arity, residency and output shapes before any output is written.

mod pad2d;

use std::fmt;

use ob_core::{DenseTensor, DenseTensorError, Element, TensorCompatError, ensure_compatible};
use ob_kernel_cpu::{KernelError, dot_contiguous};

pub use ob_kernel_cpu::{Pad2dGeometry, PaddingMode};
pub use pad2d::{Pad2dConfig, Pad2dOperator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorCall {
    Forward,
    Adjoint,
}

impl OperatorCall {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Adjoint => "adjoint",
        }
    }
}

/// `(inputs, outputs)` counts of the forward and adjoint evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperatorArity {
    pub inputs_forward: usize,
    pub outputs_forward: usize,
    pub inputs_adjoint: usize,
    pub outputs_adjoint: usize,
}

impl OperatorArity {
    #[must_use]
    pub const fn new(
        inputs_forward: usize,
        outputs_forward: usize,
        inputs_adjoint: usize,
        outputs_adjoint: usize,
    ) -> Self {
        Self {
            inputs_forward,
            outputs_forward,
            inputs_adjoint,
            outputs_adjoint,
        }
    }

    #[must_use]
    pub const fn unary() -> Self {
        Self::new(1, 1, 1, 1)
    }

    #[must_use]
    pub const fn inputs(self, call: OperatorCall) -> usize {
        match call {
            OperatorCall::Forward => self.inputs_forward,
            OperatorCall::Adjoint => self.inputs_adjoint,
        }
    }

    #[must_use]
    pub const fn outputs(self, call: OperatorCall) -> usize {
        match call {
            OperatorCall::Forward => self.outputs_forward,
            OperatorCall::Adjoint => self.outputs_adjoint,
        }
    }

    /// Whether the adjoint consumes what the forward produces and vice versa.
    #[must_use]
    pub const fn is_adjoint_paired(self) -> bool {
        self.inputs_forward == self.outputs_adjoint && self.outputs_forward == self.inputs_adjoint
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorErrorKind {
    Configuration,
    Arity,
    Shape,
    Execution,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorError {
    Configuration {
        operator: &'static str,
        field: &'static str,
        value: String,
        reason: String,
    },
    Arity {
        operator: &'static str,
        call: OperatorCall,
        role: &'static str,
        expected: usize,
        actual: usize,
    },
    Shape {
        operator: &'static str,
        call: OperatorCall,
        reason: String,
    },
    Incompatible(TensorCompatError),
    Tensor(DenseTensorError),
    Kernel(KernelError),
}

impl OperatorError {
    #[must_use]
    pub fn kind(&self) -> OperatorErrorKind {
        match self {
            Self::Configuration { .. } => OperatorErrorKind::Configuration,
            Self::Arity { .. } => OperatorErrorKind::Arity,
            Self::Shape { .. } => OperatorErrorKind::Shape,
            Self::Kernel(
                KernelError::ShapeMismatch { .. }
                | KernelError::RankTooSmall { .. }
                | KernelError::EmptyAxis { .. }
                | KernelError::ExtentOverflow { .. },
            ) => OperatorErrorKind::Shape,
            Self::Kernel(KernelError::UnknownPaddingMode { .. }) => {
                OperatorErrorKind::Configuration
            }
            Self::Incompatible(_) | Self::Tensor(_) | Self::Kernel(_) => {
                OperatorErrorKind::Execution
            }
        }
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration {
                operator,
                field,
                value,
                reason,
            } => write!(
                f,
                "{operator}: invalid configuration {field}='{value}': {reason}"
            ),
            Self::Arity {
                operator,
                call,
                role,
                expected,
                actual,
            } => write!(
                f,
                "{operator}: {} expects {expected} {role}, got {actual}",
                call.label()
            ),
            Self::Shape {
                operator,
                call,
                reason,
            } => write!(f, "{operator}: {} shape error: {reason}", call.label()),
            Self::Incompatible(error) => write!(f, "incompatible tensors: {error}"),
            Self::Tensor(error) => write!(f, "tensor error: {error}"),
            Self::Kernel(error) => write!(f, "kernel error: {error}"),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<TensorCompatError> for OperatorError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

impl From<DenseTensorError> for OperatorError {
    fn from(value: DenseTensorError) -> Self {
        Self::Tensor(value)
    }
}

impl From<KernelError> for OperatorError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

/// A linear operator with a forward evaluation and its adjoint.
///
/// Implementations must satisfy `<forward(x), y> == <x, adjoint(y)>` for all
/// inputs of matching shapes. Operators are shared by reference and are not
/// meant to be cloned.
pub trait Operator<T: Element>: Send + Sync {
    fn name(&self) -> &'static str;

    fn arity(&self) -> OperatorArity;

    /// Shapes of the tensors `call` will produce for the given input shapes.
    fn output_shapes(
        &self,
        call: OperatorCall,
        input_shapes: &[&[usize]],
    ) -> Result<Vec<Vec<usize>>, OperatorError>;

    fn compute_forward(
        &self,
        outputs: &mut [&mut DenseTensor<T>],
        inputs: &[&DenseTensor<T>],
    ) -> Result<(), OperatorError>;

    fn compute_adjoint(
        &self,
        outputs: &mut [&mut DenseTensor<T>],
        inputs: &[&DenseTensor<T>],
    ) -> Result<(), OperatorError>;

    fn forward(
        &self,
        outputs: &mut [&mut DenseTensor<T>],
        inputs: &[&DenseTensor<T>],
    ) -> Result<(), OperatorError> {
        self.validate_call(OperatorCall::Forward, outputs, inputs)?;
        self.compute_forward(outputs, inputs)
    }

    fn adjoint(
        &self,
        outputs: &mut [&mut DenseTensor<T>],
        inputs: &[&DenseTensor<T>],
    ) -> Result<(), OperatorError> {
        self.validate_call(OperatorCall::Adjoint, outputs, inputs)?;
        self.compute_adjoint(outputs, inputs)
    }

    /// Checks arity, residency and output shapes without touching any data.
    fn validate_call(
        &self,
        call: OperatorCall,
        outputs: &[&mut DenseTensor<T>],
        inputs: &[&DenseTensor<T>],
    ) -> Result<(), OperatorError> {
        let arity = self.arity();
        check_count(self.name(), call, "inputs", arity.inputs(call), inputs.len())?;
        check_count(self.name(), call, "outputs", arity.outputs(call), outputs.len())?;

        if let Some(first) = inputs.first() {
            for tensor in inputs.iter().skip(1) {
                ensure_compatible(first.meta(), tensor.meta())?;
            }
            for tensor in outputs {
                ensure_compatible(first.meta(), tensor.meta())?;
            }
        }

        let input_shapes = inputs.iter().map(|tensor| tensor.shape()).collect::<Vec<_>>();
        let expected = self.output_shapes(call, &input_shapes)?;
        for (position, (tensor, shape)) in outputs.iter().zip(expected.iter()).enumerate() {
            if tensor.shape() != shape.as_slice() {
                return Err(OperatorError::Shape {
                    operator: self.name(),
                    call,
                    reason: format!(
                        "output {position} has shape {:?}, expected {shape:?}",
                        tensor.shape()
                    ),
                });
            }
        }
        Ok(())
    }
}

fn check_count(
    operator: &'static str,
    call: OperatorCall,
    role: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), OperatorError> {
    if expected != actual {
        return Err(OperatorError::Arity {
            operator,
            call,
            role,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Allocates zeroed outputs of the inferred shapes on the first input's device.
pub fn allocate_outputs<T, O>(
    op: &O,
    call: OperatorCall,
    inputs: &[&DenseTensor<T>],
) -> Result<Vec<DenseTensor<T>>, OperatorError>
where
    T: Element,
    O: Operator<T> + ?Sized,
{
    check_count(
        op.name(),
        call,
        "inputs",
        op.arity().inputs(call),
        inputs.len(),
    )?;
    let device = inputs
        .first()
        .map_or(ob_core::Device::Cpu, |tensor| tensor.meta().device());
    let input_shapes = inputs.iter().map(|tensor| tensor.shape()).collect::<Vec<_>>();
    Ok(op
        .output_shapes(call, &input_shapes)?
        .into_iter()
        .map(|shape| DenseTensor::zeros(shape, device))
        .collect())
}

/// Allocates outputs and runs `call`.
pub fn apply<T, O>(
    op: &O,
    call: OperatorCall,
    inputs: &[&DenseTensor<T>],
) -> Result<Vec<DenseTensor<T>>, OperatorError>
where
    T: Element,
    O: Operator<T> + ?Sized,
{
    let mut outputs = allocate_outputs(op, call, inputs)?;
    {
        let mut output_refs = outputs.iter_mut().collect::<Vec<_>>();
        match call {
            OperatorCall::Forward => op.forward(&mut output_refs, inputs)?,
            OperatorCall::Adjoint => op.adjoint(&mut output_refs, inputs)?,
        }
    }
    Ok(outputs)
}

/// Both sides of the dot-product test `<Fx, y> == <x, F*y>`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjointDotReport {
    pub forward_dot: f64,
    pub adjoint_dot: f64,
    pub abs_error: f64,
    /// `abs_error` over the Cauchy-Schwarz bound `max(|Fx||y|, |x||F*y|)`.
    pub relative_error: f64,
}

impl AdjointDotReport {
    #[must_use]
    pub fn passes(&self, tolerance: f64) -> bool {
        self.relative_error.is_finite() && self.relative_error <= tolerance
    }
}

pub fn adjoint_dot_test<T, O>(
    op: &O,
    x: &DenseTensor<T>,
    y: &DenseTensor<T>,
) -> Result<AdjointDotReport, OperatorError>
where
    T: Element,
    O: Operator<T> + ?Sized,
{
    let arity = op.arity();
    if arity != OperatorArity::unary() {
        return Err(OperatorError::Arity {
            operator: op.name(),
            call: OperatorCall::Forward,
            role: "inputs",
            expected: 1,
            actual: arity.inputs_forward,
        });
    }

    let fx = apply(op, OperatorCall::Forward, &[x])?;
    let aty = apply(op, OperatorCall::Adjoint, &[y])?;
    let (fx, aty) = (&fx[0], &aty[0]);

    let forward_dot = dot(fx, y)?;
    let adjoint_dot = dot(x, aty)?;
    let bound = (dot(fx, fx)? * dot(y, y)?)
        .sqrt()
        .max((dot(x, x)? * dot(aty, aty)?).sqrt());

    let abs_error = (forward_dot - adjoint_dot).abs();
    let relative_error = if bound > 0.0 {
        abs_error / bound
    } else {
        abs_error
    };

    Ok(AdjointDotReport {
        forward_dot,
        adjoint_dot,
        abs_error,
        relative_error,
    })
}

fn dot<T: Element>(lhs: &DenseTensor<T>, rhs: &DenseTensor<T>) -> Result<f64, OperatorError> {
    Ok(dot_contiguous(
        lhs.storage(),
        rhs.storage(),
        lhs.meta(),
        rhs.meta(),
    )?)
}
