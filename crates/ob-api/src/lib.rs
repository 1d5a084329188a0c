#![forbid(unsafe_code)]

use std::collections::vec_deque;

use ob_core::{DenseTensor, Element, ExecutionMode};
use ob_operator::{
    AdjointDotReport, Operator, OperatorCall, OperatorError, Pad2dConfig, Pad2dOperator,
    adjoint_dot_test, apply,
};
use ob_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};

pub use ob_operator::{OperatorArity, OperatorErrorKind, PaddingMode};

/// Host-side entry point: builds operators, routes calls to them one to one
/// and keeps an evidence trail of every call.
#[derive(Debug, Clone)]
pub struct OperatorSession {
    runtime: RuntimeContext,
}

impl OperatorSession {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            runtime: RuntimeContext::new(mode),
        }
    }

    /// Session whose evidence trail keeps at most `capacity` entries.
    #[must_use]
    pub fn with_evidence_capacity(mode: ExecutionMode, capacity: usize) -> Self {
        Self {
            runtime: RuntimeContext::with_ledger_capacity(mode, capacity),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    /// Builds a padding operator that runs under the session's execution mode.
    pub fn pad2d<T: Element>(
        &mut self,
        config: &Pad2dConfig,
    ) -> Result<Pad2dOperator<T>, OperatorError> {
        match Pad2dOperator::<T>::from_config(config) {
            Ok(op) => {
                let op = op.with_execution_mode(self.mode());
                self.runtime.ledger_mut().record(
                    EvidenceKind::Construction,
                    format!(
                        "op=pad2d dtype={:?} left={} right={} top={} bottom={} mode={} exec={}",
                        T::DTYPE,
                        op.left(),
                        op.right(),
                        op.top(),
                        op.bottom(),
                        op.mode(),
                        op.execution_mode().label()
                    ),
                );
                Ok(op)
            }
            Err(error) => {
                self.runtime.record_failure("pad2d construction", &error);
                Err(error)
            }
        }
    }

    pub fn forward<T, O>(
        &mut self,
        op: &O,
        inputs: &[&DenseTensor<T>],
    ) -> Result<Vec<DenseTensor<T>>, OperatorError>
    where
        T: Element,
        O: Operator<T> + ?Sized,
    {
        self.call(op, OperatorCall::Forward, inputs)
    }

    pub fn adjoint<T, O>(
        &mut self,
        op: &O,
        inputs: &[&DenseTensor<T>],
    ) -> Result<Vec<DenseTensor<T>>, OperatorError>
    where
        T: Element,
        O: Operator<T> + ?Sized,
    {
        self.call(op, OperatorCall::Adjoint, inputs)
    }

    /// Runs `call` into caller-provided outputs.
    pub fn call_into<T, O>(
        &mut self,
        op: &O,
        call: OperatorCall,
        outputs: &mut [&mut DenseTensor<T>],
        inputs: &[&DenseTensor<T>],
    ) -> Result<(), OperatorError>
    where
        T: Element,
        O: Operator<T> + ?Sized,
    {
        let result = match call {
            OperatorCall::Forward => op.forward(outputs, inputs),
            OperatorCall::Adjoint => op.adjoint(outputs, inputs),
        };
        match result {
            Ok(()) => {
                let output_shapes = outputs
                    .iter()
                    .map(|tensor| tensor.shape().to_vec())
                    .collect::<Vec<_>>();
                self.record_call(op.name(), call, inputs, &output_shapes);
                Ok(())
            }
            Err(error) => {
                self.record_error(op.name(), call, &error);
                Err(error)
            }
        }
    }

    pub fn dot_test<T, O>(
        &mut self,
        op: &O,
        x: &DenseTensor<T>,
        y: &DenseTensor<T>,
    ) -> Result<AdjointDotReport, OperatorError>
    where
        T: Element,
        O: Operator<T> + ?Sized,
    {
        match adjoint_dot_test(op, x, y) {
            Ok(report) => {
                self.runtime.ledger_mut().record(
                    EvidenceKind::Adjoint,
                    format!(
                        "op={} dot_test forward_dot={:e} adjoint_dot={:e} rel_err={:e}",
                        op.name(),
                        report.forward_dot,
                        report.adjoint_dot,
                        report.relative_error
                    ),
                );
                Ok(report)
            }
            Err(error) => {
                self.record_error(op.name(), OperatorCall::Adjoint, &error);
                Err(error)
            }
        }
    }

    /// Retained evidence, oldest first.
    pub fn evidence(&self) -> vec_deque::Iter<'_, EvidenceEntry> {
        self.runtime.ledger().entries()
    }

    /// Hands the retained evidence to the caller and clears the trail.
    pub fn take_evidence(&mut self) -> Vec<EvidenceEntry> {
        self.runtime.ledger_mut().take_entries()
    }

    fn call<T, O>(
        &mut self,
        op: &O,
        call: OperatorCall,
        inputs: &[&DenseTensor<T>],
    ) -> Result<Vec<DenseTensor<T>>, OperatorError>
    where
        T: Element,
        O: Operator<T> + ?Sized,
    {
        match apply(op, call, inputs) {
            Ok(outputs) => {
                let output_shapes = outputs
                    .iter()
                    .map(|tensor| tensor.shape().to_vec())
                    .collect::<Vec<_>>();
                self.record_call(op.name(), call, inputs, &output_shapes);
                Ok(outputs)
            }
            Err(error) => {
                self.record_error(op.name(), call, &error);
                Err(error)
            }
        }
    }

    fn record_call<T: Element>(
        &mut self,
        name: &str,
        call: OperatorCall,
        inputs: &[&DenseTensor<T>],
        output_shapes: &[Vec<usize>],
    ) {
        let kind = match call {
            OperatorCall::Forward => EvidenceKind::Forward,
            OperatorCall::Adjoint => EvidenceKind::Adjoint,
        };
        let input_shapes = inputs
            .iter()
            .map(|tensor| tensor.shape().to_vec())
            .collect::<Vec<_>>();
        let mode = self.mode().label();
        self.runtime.ledger_mut().record(
            kind,
            format!(
                "op={name} call={} dtype={:?} inputs={input_shapes:?} outputs={output_shapes:?} mode={mode}",
                call.label(),
                T::DTYPE,
            ),
        );
    }

    fn record_error(&mut self, name: &str, call: OperatorCall, error: &OperatorError) {
        self.runtime.record_failure(
            &format!("op={name} call={} kind={:?}", call.label(), error.kind()),
            error,
        );
    }
}
