use std::borrow::Cow;
use std::marker::PhantomData;

use ob_core::{DenseTensor, Element, ExecutionMode, TensorMeta};
use ob_kernel_cpu::{
    KernelError, Pad2dGeometry, PaddingMode, pad2d_adjoint_contiguous, pad2d_forward_contiguous,
    padded_extent,
};
use serde::{Deserialize, Serialize};

use crate::{Operator, OperatorArity, OperatorCall, OperatorError};

const NAME: &str = "pad2d";

/// Serialized form of a padding operator configuration.
///
/// `mode` stays a plain string so that an unknown mode is reported by the
/// operator constructor rather than by the JSON decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pad2dConfig {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
    pub mode: String,
}

/// Pads the last two axes of a `(..., H, W)` tensor.
///
/// Forward maps an interior of `(H, W)` to `(H + top + bottom, W + left + right)`.
/// Adjoint maps a gradient on the padded image back onto the interior,
/// summing every border copy into the sample it came from.
#[derive(Debug)]
pub struct Pad2dOperator<T: Element> {
    geometry: Pad2dGeometry,
    mode: PaddingMode,
    execution: ExecutionMode,
    _element: PhantomData<fn() -> T>,
}

impl<T: Element> Pad2dOperator<T> {
    pub fn new(
        left: usize,
        right: usize,
        top: usize,
        bottom: usize,
        mode: &str,
    ) -> Result<Self, OperatorError> {
        let mode = PaddingMode::parse(mode).map_err(|error| OperatorError::Configuration {
            operator: NAME,
            field: "mode",
            value: mode.to_string(),
            reason: error.to_string(),
        })?;
        Ok(Self::with_mode(left, right, top, bottom, mode))
    }

    #[must_use]
    pub fn with_mode(
        left: usize,
        right: usize,
        top: usize,
        bottom: usize,
        mode: PaddingMode,
    ) -> Self {
        Self {
            geometry: Pad2dGeometry::new(left, right, top, bottom),
            mode,
            execution: ExecutionMode::default(),
            _element: PhantomData,
        }
    }

    pub fn from_config(config: &Pad2dConfig) -> Result<Self, OperatorError> {
        Self::new(
            config.left,
            config.right,
            config.top,
            config.bottom,
            config.mode.as_str(),
        )
    }

    pub fn from_json(raw: &str) -> Result<Self, OperatorError> {
        let config: Pad2dConfig =
            serde_json::from_str(raw).map_err(|error| OperatorError::Configuration {
                operator: NAME,
                field: "json",
                value: raw.chars().take(64).collect(),
                reason: error.to_string(),
            })?;
        Self::from_config(&config)
    }

    #[must_use]
    pub fn with_execution_mode(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    #[must_use]
    pub fn config(&self) -> Pad2dConfig {
        Pad2dConfig {
            left: self.geometry.left,
            right: self.geometry.right,
            top: self.geometry.top,
            bottom: self.geometry.bottom,
            mode: self.mode.as_str().to_string(),
        }
    }

    #[must_use]
    pub fn left(&self) -> usize {
        self.geometry.left
    }

    #[must_use]
    pub fn right(&self) -> usize {
        self.geometry.right
    }

    #[must_use]
    pub fn top(&self) -> usize {
        self.geometry.top
    }

    #[must_use]
    pub fn bottom(&self) -> usize {
        self.geometry.bottom
    }

    #[must_use]
    pub fn padding_x(&self) -> usize {
        self.geometry.padding_x()
    }

    #[must_use]
    pub fn padding_y(&self) -> usize {
        self.geometry.padding_y()
    }

    #[must_use]
    pub fn geometry(&self) -> Pad2dGeometry {
        self.geometry
    }

    #[must_use]
    pub fn mode(&self) -> PaddingMode {
        self.mode
    }

    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution
    }

    pub fn padded_shape(&self, interior: &[usize]) -> Result<Vec<usize>, OperatorError> {
        let (height, width) = self.plane(OperatorCall::Forward, interior)?;
        if height == 0 && self.padding_y() > 0 {
            return Err(self.shape_error(
                OperatorCall::Forward,
                format!("cannot pad an empty row axis by {}", self.padding_y()),
            ));
        }
        if width == 0 && self.padding_x() > 0 {
            return Err(self.shape_error(
                OperatorCall::Forward,
                format!("cannot pad an empty column axis by {}", self.padding_x()),
            ));
        }

        let geometry = self.geometry;
        let overflow = |error: KernelError| {
            self.shape_error(OperatorCall::Forward, error.to_string())
        };
        let rank = interior.len();
        let mut shape = interior.to_vec();
        shape[rank - 2] =
            padded_extent(height, geometry.top, geometry.bottom, "row").map_err(overflow)?;
        shape[rank - 1] =
            padded_extent(width, geometry.left, geometry.right, "column").map_err(overflow)?;
        Ok(shape)
    }

    pub fn interior_shape(&self, padded: &[usize]) -> Result<Vec<usize>, OperatorError> {
        let (height, width) = self.plane(OperatorCall::Adjoint, padded)?;
        let interior_height = self.interior_extent(height, self.padding_y(), "row")?;
        let interior_width = self.interior_extent(width, self.padding_x(), "column")?;

        let rank = padded.len();
        let mut shape = padded.to_vec();
        shape[rank - 2] = interior_height;
        shape[rank - 1] = interior_width;
        Ok(shape)
    }

    fn interior_extent(
        &self,
        padded: usize,
        margin: usize,
        axis: &str,
    ) -> Result<usize, OperatorError> {
        match padded.checked_sub(margin) {
            Some(0) if margin > 0 => Err(self.shape_error(
                OperatorCall::Adjoint,
                format!("{axis} extent {padded} leaves no interior after margins {margin}"),
            )),
            Some(extent) => Ok(extent),
            None => Err(self.shape_error(
                OperatorCall::Adjoint,
                format!("{axis} extent {padded} is smaller than margins {margin}"),
            )),
        }
    }

    fn plane(&self, call: OperatorCall, shape: &[usize]) -> Result<(usize, usize), OperatorError> {
        match shape {
            [.., height, width] => Ok((*height, *width)),
            _ => Err(self.shape_error(
                call,
                format!("expected a (..., H, W) tensor, got rank {}", shape.len()),
            )),
        }
    }

    fn shape_error(&self, call: OperatorCall, reason: String) -> OperatorError {
        OperatorError::Shape {
            operator: NAME,
            call,
            reason,
        }
    }

    fn unary<'a, 'i, 'o: 'a>(
        &self,
        call: OperatorCall,
        outputs: &'a mut [&'o mut DenseTensor<T>],
        inputs: &'a [&'i DenseTensor<T>],
    ) -> Result<(&'i DenseTensor<T>, &'a mut DenseTensor<T>), OperatorError> {
        match (inputs, outputs) {
            ([input], [output]) => Ok((*input, &mut **output)),
            ([_], outputs) => Err(OperatorError::Arity {
                operator: NAME,
                call,
                role: "outputs",
                expected: 1,
                actual: outputs.len(),
            }),
            (inputs, _) => Err(OperatorError::Arity {
                operator: NAME,
                call,
                role: "inputs",
                expected: 1,
                actual: inputs.len(),
            }),
        }
    }
}

/// Contiguous view of `tensor`, copying only when it is strided.
fn staged_input<T: Element>(
    tensor: &DenseTensor<T>,
) -> Result<(Cow<'_, [T]>, TensorMeta), OperatorError> {
    if tensor.meta().is_contiguous() {
        return Ok((Cow::Borrowed(tensor.storage()), tensor.meta().clone()));
    }
    let meta = TensorMeta::from_shape(
        tensor.shape().to_vec(),
        tensor.meta().dtype(),
        tensor.meta().device(),
    );
    Ok((Cow::Owned(tensor.to_vec()?), meta))
}

impl<T: Element> Operator<T> for Pad2dOperator<T> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn arity(&self) -> OperatorArity {
        OperatorArity::unary()
    }

    fn output_shapes(
        &self,
        call: OperatorCall,
        input_shapes: &[&[usize]],
    ) -> Result<Vec<Vec<usize>>, OperatorError> {
        let [shape] = input_shapes else {
            return Err(OperatorError::Arity {
                operator: NAME,
                call,
                role: "inputs",
                expected: 1,
                actual: input_shapes.len(),
            });
        };
        let output = match call {
            OperatorCall::Forward => self.padded_shape(shape)?,
            OperatorCall::Adjoint => self.interior_shape(shape)?,
        };
        Ok(vec![output])
    }

    fn compute_forward(
        &self,
        outputs: &mut [&mut DenseTensor<T>],
        inputs: &[&DenseTensor<T>],
    ) -> Result<(), OperatorError> {
        let (input, output) = self.unary(OperatorCall::Forward, outputs, inputs)?;
        let (values, input_meta) = staged_input(input)?;
        let (output_meta, storage) = output.parts_mut();
        pad2d_forward_contiguous(
            &values,
            &input_meta,
            storage,
            output_meta,
            self.geometry,
            self.mode,
            self.execution,
        )?;
        Ok(())
    }

    fn compute_adjoint(
        &self,
        outputs: &mut [&mut DenseTensor<T>],
        inputs: &[&DenseTensor<T>],
    ) -> Result<(), OperatorError> {
        let (grad, output) = self.unary(OperatorCall::Adjoint, outputs, inputs)?;
        let (values, grad_meta) = staged_input(grad)?;
        let (output_meta, storage) = output.parts_mut();
        pad2d_adjoint_contiguous(
            &values,
            &grad_meta,
            storage,
            output_meta,
            self.geometry,
            self.mode,
            self.execution,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ob_core::{DType, DenseTensor, DenseTensorError, Device, ExecutionMode, TensorMeta};
    use proptest::prelude::*;

    use super::{Pad2dConfig, Pad2dOperator, staged_input};
    use crate::{
        Operator, OperatorArity, OperatorCall, OperatorError, OperatorErrorKind, PaddingMode,
        adjoint_dot_test, apply,
    };

    fn ramp(shape: Vec<usize>) -> DenseTensor<f64> {
        let len = shape.iter().product::<usize>();
        let values = (0..len).map(|v| v as f64).collect();
        DenseTensor::from_vec(shape, values, Device::Cpu).expect("ramp tensor")
    }

    fn pseudo_random<T: ob_core::Element>(shape: Vec<usize>, seed: u64) -> DenseTensor<T> {
        let len = shape.iter().product::<usize>();
        let mut state = seed ^ 0x2545_f491_4f6c_dd1d;
        let values = (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                T::narrow((state >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0)
            })
            .collect();
        DenseTensor::from_vec(shape, values, Device::Cpu).expect("random tensor")
    }

    fn forward(op: &Pad2dOperator<f64>, x: &DenseTensor<f64>) -> DenseTensor<f64> {
        apply(op, OperatorCall::Forward, &[x])
            .expect("forward should succeed")
            .remove(0)
    }

    fn adjoint(op: &Pad2dOperator<f64>, y: &DenseTensor<f64>) -> DenseTensor<f64> {
        apply(op, OperatorCall::Adjoint, &[y])
            .expect("adjoint should succeed")
            .remove(0)
    }

    #[test]
    fn construction_rejects_unknown_mode() {
        let err = Pad2dOperator::<f64>::new(1, 1, 1, 1, "bogus")
            .expect_err("bogus mode must fail construction");
        assert_eq!(err.kind(), OperatorErrorKind::Configuration);
        assert!(matches!(
            err,
            OperatorError::Configuration {
                field: "mode",
                ref value,
                ..
            } if value == "bogus"
        ));
    }

    #[test]
    fn padding_totals_and_arity() {
        let op = Pad2dOperator::<f32>::new(1, 2, 3, 4, "symmetric").expect("valid config");
        assert_eq!(op.padding_x(), 3);
        assert_eq!(op.padding_y(), 7);
        assert_eq!(op.mode(), PaddingMode::Symmetric);
        assert_eq!(op.arity(), OperatorArity::unary());
        assert_eq!(op.execution_mode(), ExecutionMode::Parallel);
    }

    #[test]
    fn shape_law_holds_for_batched_tensors() {
        let op = Pad2dOperator::<f64>::new(1, 2, 3, 4, "reflect").expect("valid config");
        let x = ramp(vec![2, 3, 5, 6]);
        let fx = forward(&op, &x);
        assert_eq!(fx.shape(), &[2, 3, 12, 9]);

        let back = adjoint(&op, &fx);
        assert_eq!(back.shape(), x.shape());
    }

    #[test]
    fn zero_margins_are_identity_in_every_mode() {
        let x = ramp(vec![3, 4]);
        for mode in PaddingMode::all() {
            let op = Pad2dOperator::<f64>::with_mode(0, 0, 0, 0, *mode);
            assert_eq!(forward(&op, &x), x, "forward mode={mode}");
            assert_eq!(adjoint(&op, &x), x, "adjoint mode={mode}");
        }
    }

    #[test]
    fn identical_configuration_gives_bit_identical_output() {
        let x = pseudo_random::<f64>(vec![4, 5], 11);
        let a = Pad2dOperator::<f64>::new(3, 1, 2, 5, "symmetric").expect("a");
        let b = Pad2dOperator::<f64>::new(3, 1, 2, 5, "symmetric").expect("b");
        let bits = |t: &DenseTensor<f64>| t.storage().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&forward(&a, &x)), bits(&forward(&b, &x)));
    }

    #[test]
    fn reflect_corner_accumulates_every_mirrored_position() {
        let op = Pad2dOperator::<f64>::new(2, 2, 2, 2, "reflect").expect("valid config");
        let ones = DenseTensor::from_vec(vec![7, 7], vec![1.0; 49], Device::Cpu).expect("ones");
        let counts = adjoint(&op, &ones);
        // corners: 2 rows x 2 cols, edges: 3 x 2, centre: 3 x 3
        assert_eq!(
            counts.storage(),
            &[4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]
        );

        // Enumerate the padded positions whose forward value is interior (0, 0).
        let probe = DenseTensor::from_vec(
            vec![3, 3],
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            Device::Cpu,
        )
        .expect("probe");
        let image = forward(&op, &probe);
        let sources = image
            .storage()
            .iter()
            .enumerate()
            .filter(|(_, value)| **value == 1.0)
            .map(|(position, _)| position)
            .collect::<Vec<_>>();
        assert_eq!(sources, vec![16, 20, 44, 48]);

        let ramp = ramp(vec![7, 7]);
        let corner = adjoint(&op, &ramp).storage()[0];
        let expected: f64 = sources.iter().map(|position| *position as f64).sum();
        assert_eq!(corner, expected);
    }

    #[test]
    fn margins_wider_than_interior_fold_periodically() {
        let op = Pad2dOperator::<f64>::new(5, 5, 0, 0, "reflect").expect("valid config");
        let x = DenseTensor::from_vec(vec![1, 3], vec![1.0, 2.0, 3.0], Device::Cpu).expect("x");
        let fx = forward(&op, &x);
        assert_eq!(
            fx.storage(),
            &[2.0, 1.0, 2.0, 3.0, 2.0, 1.0, 2.0, 3.0, 2.0, 1.0, 2.0, 3.0, 2.0]
        );

        let op = Pad2dOperator::<f64>::new(4, 4, 0, 0, "symmetric").expect("valid config");
        let fx = forward(&op, &x);
        assert_eq!(
            fx.storage(),
            &[3.0, 3.0, 2.0, 1.0, 1.0, 2.0, 3.0, 3.0, 2.0, 1.0, 1.0]
        );
    }

    #[test]
    fn forward_with_wrong_input_count_leaves_output_untouched() {
        let op = Pad2dOperator::<f64>::new(1, 1, 1, 1, "replicate").expect("valid config");
        let x = ramp(vec![2, 2]);
        let mut out = DenseTensor::from_vec(vec![4, 4], vec![7.0; 16], Device::Cpu).expect("out");

        let err = op
            .forward(&mut [&mut out], &[])
            .expect_err("zero inputs must fail");
        assert!(matches!(
            err,
            OperatorError::Arity {
                role: "inputs",
                expected: 1,
                actual: 0,
                ..
            }
        ));

        let err = op
            .forward(&mut [&mut out], &[&x, &x])
            .expect_err("two inputs must fail");
        assert!(matches!(
            err,
            OperatorError::Arity {
                role: "inputs",
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert_eq!(out.storage(), &[7.0; 16]);

        let err = op.adjoint(&mut [], &[&out]).expect_err("zero outputs must fail");
        assert!(matches!(
            err,
            OperatorError::Arity {
                role: "outputs",
                ..
            }
        ));
    }

    #[test]
    fn forward_rejects_mis_shaped_output_before_writing() {
        let op = Pad2dOperator::<f64>::new(1, 1, 1, 1, "replicate").expect("valid config");
        let x = ramp(vec![2, 2]);
        let mut out = DenseTensor::from_vec(vec![4, 5], vec![7.0; 20], Device::Cpu).expect("out");
        let err = op
            .forward(&mut [&mut out], &[&x])
            .expect_err("wrong output shape must fail");
        assert_eq!(err.kind(), OperatorErrorKind::Shape);
        assert_eq!(out.storage(), &[7.0; 20]);
    }

    #[test]
    fn shape_errors_for_rank_and_margins() {
        let op = Pad2dOperator::<f64>::new(2, 2, 1, 1, "reflect").expect("valid config");
        let err = op.padded_shape(&[5]).expect_err("rank-1 must fail");
        assert_eq!(err.kind(), OperatorErrorKind::Shape);

        let err = op.interior_shape(&[3, 3]).expect_err("3 columns < 4 margins");
        assert_eq!(err.kind(), OperatorErrorKind::Shape);

        let err = op.interior_shape(&[2, 5]).expect_err("rows leave no interior");
        assert_eq!(err.kind(), OperatorErrorKind::Shape);

        let err = op.padded_shape(&[0, 4]).expect_err("empty rows cannot be padded");
        assert_eq!(err.kind(), OperatorErrorKind::Shape);

        let identity = Pad2dOperator::<f64>::new(0, 0, 0, 0, "reflect").expect("valid config");
        assert_eq!(identity.padded_shape(&[0, 4]).expect("empty identity"), vec![0, 4]);
    }

    #[test]
    fn huge_margins_report_shape_error_instead_of_overflowing() {
        let op =
            Pad2dOperator::<f64>::new(usize::MAX, 1, 0, 0, "replicate").expect("valid config");
        assert_eq!(op.padding_x(), usize::MAX);
        let err = op.padded_shape(&[2, 2]).expect_err("column extent overflows");
        assert_eq!(err.kind(), OperatorErrorKind::Shape);
        assert!(err.to_string().contains("overflows"), "unexpected error: {err}");

        let op =
            Pad2dOperator::<f64>::new(0, 0, usize::MAX - 1, 0, "reflect").expect("valid config");
        let x = ramp(vec![2, 2]);
        let err = apply(&op, OperatorCall::Forward, &[&x]).expect_err("row extent overflows");
        assert_eq!(err.kind(), OperatorErrorKind::Shape);

        let err = op.interior_shape(&[3, 3]).expect_err("margins exceed extent");
        assert_eq!(err.kind(), OperatorErrorKind::Shape);
    }

    #[test]
    fn staging_copies_strided_input_in_logical_order() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 2], vec![1, 2], 0, DType::F64, Device::Cpu)
                .expect("transposed meta");
        let x = DenseTensor::from_storage(meta, vec![1.0, 2.0, 3.0, 4.0]).expect("strided tensor");
        let (values, staged_meta) = staged_input(&x).expect("staging should succeed");
        assert_eq!(values.as_ref(), &[1.0, 3.0, 2.0, 4.0]);
        assert!(staged_meta.is_contiguous());

        let err = OperatorError::from(DenseTensorError::InsufficientStorage {
            needed: 3,
            available: 2,
        });
        assert_eq!(err.kind(), OperatorErrorKind::Execution);
    }

    #[test]
    fn forward_rejects_mixed_residency() {
        let op = Pad2dOperator::<f64>::new(1, 1, 1, 1, "replicate").expect("valid config");
        let x = ramp(vec![2, 2]);
        let mut out = DenseTensor::<f64>::zeros(vec![4, 4], Device::Cuda);
        let err = op
            .forward(&mut [&mut out], &[&x])
            .expect_err("cpu input with cuda output must fail");
        assert!(matches!(err, OperatorError::Incompatible(_)));
    }

    #[test]
    fn strided_input_is_staged_before_padding() {
        let op = Pad2dOperator::<f64>::new(1, 0, 0, 0, "replicate").expect("valid config");
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 2], vec![1, 2], 0, DType::F64, Device::Cpu)
                .expect("transposed meta");
        let x = DenseTensor::from_storage(meta, vec![1.0, 2.0, 3.0, 4.0]).expect("strided x");
        let fx = forward(&op, &x);
        assert_eq!(fx.storage(), &[1.0, 1.0, 3.0, 2.0, 2.0, 4.0]);
    }

    #[test]
    fn config_round_trips_through_json() {
        let op = Pad2dOperator::<f64>::from_json(
            r#"{"left": 1, "right": 2, "top": 3, "bottom": 4, "mode": "symmetric"}"#,
        )
        .expect("json config");
        assert_eq!(
            op.config(),
            Pad2dConfig {
                left: 1,
                right: 2,
                top: 3,
                bottom: 4,
                mode: "symmetric".to_string(),
            }
        );

        let err = Pad2dOperator::<f64>::from_json(
            r#"{"left": 1, "right": 2, "top": 3, "bottom": 4, "mode": "wrap"}"#,
        )
        .expect_err("unknown mode in json must fail");
        assert_eq!(err.kind(), OperatorErrorKind::Configuration);

        let err = Pad2dOperator::<f64>::from_json(
            r#"{"left": 1, "right": 2, "top": 3, "bottom": 4, "mode": "reflect", "value": 0}"#,
        )
        .expect_err("unknown field must fail");
        assert!(matches!(
            err,
            OperatorError::Configuration { field: "json", .. }
        ));

        let err = Pad2dOperator::<f64>::from_json(
            r#"{"left": -1, "right": 2, "top": 3, "bottom": 4, "mode": "reflect"}"#,
        )
        .expect_err("negative margin must fail");
        assert_eq!(err.kind(), OperatorErrorKind::Configuration);
    }

    #[test]
    fn f32_adjoint_identity_within_tolerance() {
        for mode in PaddingMode::all() {
            for margin in [0usize, 1, 3, 6] {
                let op = Pad2dOperator::<f32>::with_mode(margin, margin, margin, margin, *mode);
                let x = pseudo_random::<f32>(vec![2, 6, 5], 3);
                let y = pseudo_random::<f32>(vec![2, 6 + 2 * margin, 5 + 2 * margin], 5);
                let report = adjoint_dot_test(&op, &x, &y).expect("dot test");
                assert!(
                    report.passes(1e-5),
                    "mode={mode} margin={margin} report={report:?}"
                );
            }
        }
    }

    fn mode_strategy() -> impl Strategy<Value = PaddingMode> {
        prop::sample::select(PaddingMode::all().to_vec())
    }

    proptest! {
        #[test]
        fn prop_adjoint_identity_f64(
            height in 1usize..=6,
            width in 1usize..=6,
            margin_pick in prop::array::uniform4(0usize..4),
            mode in mode_strategy(),
            serial in any::<bool>(),
            seed in any::<u64>(),
        ) {
            // margins drawn from {0, 1, 3, H}
            let pick = |choice: usize, extent: usize| [0, 1, 3, extent][choice];
            let (left, right) = (pick(margin_pick[0], width), pick(margin_pick[1], width));
            let (top, bottom) = (pick(margin_pick[2], height), pick(margin_pick[3], height));
            let execution = if serial { ExecutionMode::Serial } else { ExecutionMode::Parallel };
            let op = Pad2dOperator::<f64>::with_mode(left, right, top, bottom, mode)
                .with_execution_mode(execution);

            let x = pseudo_random::<f64>(vec![height, width], seed);
            let y = pseudo_random::<f64>(
                vec![height + top + bottom, width + left + right],
                seed.rotate_left(17),
            );
            let report = adjoint_dot_test(&op, &x, &y).expect("dot test");
            prop_assert!(report.passes(1e-12), "report={report:?}");
        }

        #[test]
        fn prop_serial_and_parallel_agree(
            batch in 1usize..=3,
            height in 1usize..=5,
            width in 1usize..=5,
            margins in prop::array::uniform4(0usize..=8),
            mode in mode_strategy(),
            seed in any::<u64>(),
        ) {
            let serial = Pad2dOperator::<f64>::with_mode(margins[0], margins[1], margins[2], margins[3], mode)
                .with_execution_mode(ExecutionMode::Serial);
            let parallel = Pad2dOperator::<f64>::with_mode(margins[0], margins[1], margins[2], margins[3], mode)
                .with_execution_mode(ExecutionMode::Parallel);

            let x = pseudo_random::<f64>(vec![batch, height, width], seed);
            prop_assert_eq!(forward(&serial, &x), forward(&parallel, &x));

            let padded = serial.padded_shape(x.shape()).expect("padded shape");
            let y = pseudo_random::<f64>(padded, seed ^ 1);
            let lhs = adjoint(&serial, &y);
            let rhs = adjoint(&parallel, &y);
            let bits = |t: &DenseTensor<f64>| t.storage().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
            prop_assert_eq!(bits(&lhs), bits(&rhs));
        }
    }
}
