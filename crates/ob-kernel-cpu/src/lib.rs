#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use ob_core::{Device, Element, ExecutionMode, TensorCompatError, TensorMeta, ensure_compatible};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Incompatible(TensorCompatError),
    ShapeMismatch {
        side: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    RankTooSmall {
        side: &'static str,
        rank: usize,
        minimum: usize,
    },
    EmptyAxis {
        axis: &'static str,
        margin: usize,
    },
    ExtentOverflow {
        axis: &'static str,
        extent: usize,
        margin: usize,
    },
    UnsupportedLayout {
        side: &'static str,
    },
    UnsupportedDevice {
        side: &'static str,
        device: Device,
    },
    StorageSpanOverflow {
        side: &'static str,
        storage_offset: usize,
        numel: usize,
    },
    InsufficientStorage {
        side: &'static str,
        needed: usize,
        available: usize,
    },
    UnknownPaddingMode {
        value: String,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible(error) => write!(f, "incompatible tensors: {error}"),
            Self::ShapeMismatch {
                side,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "shape mismatch on {side}: expected={expected:?}, actual={actual:?}"
                )
            }
            Self::RankTooSmall {
                side,
                rank,
                minimum,
            } => write!(f, "rank {rank} on {side} is below the minimum of {minimum}"),
            Self::EmptyAxis { axis, margin } => {
                write!(f, "cannot pad empty {axis} axis by {margin}")
            }
            Self::ExtentOverflow {
                axis,
                extent,
                margin,
            } => write!(f, "{axis} extent {extent} overflows when padded by {margin}"),
            Self::UnsupportedLayout { side } => {
                write!(f, "unsupported non-contiguous layout on {side}")
            }
            Self::UnsupportedDevice { side, device } => {
                write!(f, "cpu kernel cannot address {device:?} storage on {side}")
            }
            Self::StorageSpanOverflow {
                side,
                storage_offset,
                numel,
            } => write!(
                f,
                "storage span overflow on {side}: storage_offset={storage_offset}, numel={numel}"
            ),
            Self::InsufficientStorage {
                side,
                needed,
                available,
            } => write!(
                f,
                "insufficient storage on {side}: needed={needed}, available={available}"
            ),
            Self::UnknownPaddingMode { value } => write!(
                f,
                "unknown padding mode '{value}'; expected symmetric|reflect|replicate"
            ),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorCompatError> for KernelError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

/// Boundary extension used to fill the margins of a padded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Mirror about the half-sample boundary; the edge sample repeats.
    Symmetric,
    /// Mirror about the edge sample; the edge sample does not repeat.
    Reflect,
    /// Clamp to the nearest edge sample.
    Replicate,
}

impl PaddingMode {
    #[must_use]
    pub const fn all() -> &'static [PaddingMode] {
        &[
            PaddingMode::Symmetric,
            PaddingMode::Reflect,
            PaddingMode::Replicate,
        ]
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Symmetric => "symmetric",
            Self::Reflect => "reflect",
            Self::Replicate => "replicate",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, KernelError> {
        match raw {
            "symmetric" => Ok(Self::Symmetric),
            "reflect" => Ok(Self::Reflect),
            "replicate" => Ok(Self::Replicate),
            other => Err(KernelError::UnknownPaddingMode {
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for PaddingMode {
    type Err = KernelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for PaddingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Margins added around the last two axes of a `(..., H, W)` tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pad2dGeometry {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

impl Pad2dGeometry {
    #[must_use]
    pub const fn new(left: usize, right: usize, top: usize, bottom: usize) -> Self {
        Self {
            left,
            right,
            top,
            bottom,
        }
    }

    /// Total column margin, saturating at `usize::MAX`.
    #[must_use]
    pub const fn padding_x(self) -> usize {
        self.left.saturating_add(self.right)
    }

    /// Total row margin, saturating at `usize::MAX`.
    #[must_use]
    pub const fn padding_y(self) -> usize {
        self.top.saturating_add(self.bottom)
    }

    #[must_use]
    pub const fn is_identity(self) -> bool {
        self.left == 0 && self.right == 0 && self.top == 0 && self.bottom == 0
    }
}

/// Maps a padded-axis position to the interior sample it copies.
///
/// `position` counts from the first margin element; `before` is the margin
/// preceding the interior. Reflect and symmetric fold periodically, so any
/// margin width resolves to a valid index.
pub fn fold_index(
    position: usize,
    before: usize,
    len: usize,
    mode: PaddingMode,
) -> Result<usize, KernelError> {
    if len == 0 {
        return Err(KernelError::EmptyAxis {
            axis: "interior",
            margin: before,
        });
    }

    let folded = match mode {
        PaddingMode::Replicate => position.saturating_sub(before).min(len - 1),
        PaddingMode::Symmetric => {
            let period = 2 * len;
            let phase = (position % period + period - before % period) % period;
            if phase < len {
                phase
            } else {
                period - 1 - phase
            }
        }
        PaddingMode::Reflect => {
            if len == 1 {
                0
            } else {
                let period = 2 * len - 2;
                let phase = (position % period + period - before % period) % period;
                if phase < len { phase } else { period - phase }
            }
        }
    };
    Ok(folded)
}

/// `len + before + after`, or an overflow error naming the axis.
pub fn padded_extent(
    len: usize,
    before: usize,
    after: usize,
    axis: &'static str,
) -> Result<usize, KernelError> {
    before
        .checked_add(after)
        .and_then(|margin| len.checked_add(margin))
        .ok_or(KernelError::ExtentOverflow {
            axis,
            extent: len,
            margin: before.saturating_add(after),
        })
}

/// Source interior index for every position of one padded axis.
pub fn axis_source_map(
    len: usize,
    before: usize,
    after: usize,
    mode: PaddingMode,
    axis: &'static str,
) -> Result<Vec<usize>, KernelError> {
    let padded = padded_extent(len, before, after, axis)?;
    if len == 0 {
        if padded > 0 {
            return Err(KernelError::EmptyAxis {
                axis,
                margin: padded,
            });
        }
        return Ok(Vec::new());
    }

    (0..padded)
        .map(|position| fold_index(position, before, len, mode))
        .collect()
}

/// Inverts a source map: for every interior index, the padded positions
/// that copy it, in increasing order. The interior position itself is
/// included.
#[must_use]
pub fn axis_preimages(source_map: &[usize], len: usize) -> Vec<Vec<usize>> {
    let mut preimages: Vec<Vec<usize>> = vec![Vec::new(); len];
    for (position, source) in source_map.iter().copied().enumerate() {
        preimages[source].push(position);
    }
    preimages
}

fn ensure_meta_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), KernelError> {
    ensure_compatible(lhs, rhs)?;

    for (side, meta) in [("lhs", lhs), ("rhs", rhs)] {
        if meta.device() != Device::Cpu {
            return Err(KernelError::UnsupportedDevice {
                side,
                device: meta.device(),
            });
        }
        if !meta.is_contiguous() {
            return Err(KernelError::UnsupportedLayout { side });
        }
    }

    Ok(())
}

fn contiguous_required_len(meta: &TensorMeta, side: &'static str) -> Result<usize, KernelError> {
    let numel = meta.numel();
    if numel == 0 {
        return Ok(0);
    }

    meta.storage_offset()
        .checked_add(numel)
        .ok_or(KernelError::StorageSpanOverflow {
            side,
            storage_offset: meta.storage_offset(),
            numel,
        })
}

fn ensure_storage_len<T>(
    buffer: &[T],
    meta: &TensorMeta,
    side: &'static str,
) -> Result<(), KernelError> {
    let needed = contiguous_required_len(meta, side)?;
    if buffer.len() < needed {
        return Err(KernelError::InsufficientStorage {
            side,
            needed,
            available: buffer.len(),
        });
    }
    Ok(())
}

fn window<'a, T>(buffer: &'a [T], meta: &TensorMeta) -> &'a [T] {
    if meta.numel() == 0 {
        return &[];
    }
    let start = meta.storage_offset();
    &buffer[start..start + meta.numel()]
}

fn window_mut<'a, T>(buffer: &'a mut [T], meta: &TensorMeta) -> &'a mut [T] {
    if meta.numel() == 0 {
        return &mut [];
    }
    let start = meta.storage_offset();
    &mut buffer[start..start + meta.numel()]
}

/// Splits a `(..., H, W)` shape into `(batch, H, W)`.
fn split_planes(meta: &TensorMeta, side: &'static str) -> Result<(usize, usize, usize), KernelError> {
    let shape = meta.shape();
    if shape.len() < 2 {
        return Err(KernelError::RankTooSmall {
            side,
            rank: shape.len(),
            minimum: 2,
        });
    }
    let rank = shape.len();
    let batch = shape[..rank - 2].iter().copied().product();
    Ok((batch, shape[rank - 2], shape[rank - 1]))
}

/// Shape of `interior` once its last two axes are padded by `geometry`.
/// Shapes of rank below two are returned unchanged.
pub fn padded_shape(
    interior: &[usize],
    geometry: Pad2dGeometry,
) -> Result<Vec<usize>, KernelError> {
    let mut shape = interior.to_vec();
    if let [.., height, width] = shape.as_mut_slice() {
        *height = padded_extent(*height, geometry.top, geometry.bottom, "row")?;
        *width = padded_extent(*width, geometry.left, geometry.right, "column")?;
    }
    Ok(shape)
}

fn ensure_pad_shapes(
    interior: &TensorMeta,
    padded: &TensorMeta,
    geometry: Pad2dGeometry,
    padded_side: &'static str,
) -> Result<(), KernelError> {
    split_planes(interior, "interior")?;
    let expected = padded_shape(interior.shape(), geometry)?;
    if padded.shape() != expected.as_slice() {
        return Err(KernelError::ShapeMismatch {
            side: padded_side,
            expected,
            actual: padded.shape().to_vec(),
        });
    }
    Ok(())
}

/// Runs `fill` over consecutive `row_len` chunks of `out`, in parallel or
/// serially. Each chunk is owned by exactly one invocation.
fn for_each_row<T, F>(out: &mut [T], row_len: usize, exec: ExecutionMode, fill: F)
where
    T: Element,
    F: Fn(usize, &mut [T]) + Send + Sync,
{
    if out.is_empty() || row_len == 0 {
        return;
    }
    match exec {
        ExecutionMode::Parallel => out
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(row, chunk)| fill(row, chunk)),
        ExecutionMode::Serial => out
            .chunks_mut(row_len)
            .enumerate()
            .for_each(|(row, chunk)| fill(row, chunk)),
    }
}

/// Pads the last two axes of `input` into `output`.
///
/// `output` is fully overwritten and never read.
pub fn pad2d_forward_contiguous<T: Element>(
    input: &[T],
    input_meta: &TensorMeta,
    output: &mut [T],
    output_meta: &TensorMeta,
    geometry: Pad2dGeometry,
    mode: PaddingMode,
    exec: ExecutionMode,
) -> Result<(), KernelError> {
    ensure_meta_compatible(input_meta, output_meta)?;
    ensure_pad_shapes(input_meta, output_meta, geometry, "output")?;
    ensure_storage_len(input, input_meta, "input")?;
    ensure_storage_len(output, output_meta, "output")?;

    let (_, height, width) = split_planes(input_meta, "input")?;
    let (_, out_height, out_width) = split_planes(output_meta, "output")?;
    let row_map = axis_source_map(height, geometry.top, geometry.bottom, mode, "row")?;
    let col_map = axis_source_map(width, geometry.left, geometry.right, mode, "column")?;

    let src = window(input, input_meta);
    let dst = window_mut(output, output_meta);

    for_each_row(dst, out_width, exec, |row, out_row| {
        let plane = row / out_height;
        let src_row = row_map[row % out_height];
        let start = (plane * height + src_row) * width;
        let src_row = &src[start..start + width];
        for (value, source) in out_row.iter_mut().zip(col_map.iter().copied()) {
            *value = src_row[source];
        }
    });

    Ok(())
}

/// Exact adjoint of [`pad2d_forward_contiguous`].
///
/// Every interior element gathers the gradient of its own padded position
/// first, then of every border position copied from it in increasing
/// row-major offset, so the result does not depend on scheduling.
pub fn pad2d_adjoint_contiguous<T: Element>(
    grad: &[T],
    grad_meta: &TensorMeta,
    output: &mut [T],
    output_meta: &TensorMeta,
    geometry: Pad2dGeometry,
    mode: PaddingMode,
    exec: ExecutionMode,
) -> Result<(), KernelError> {
    ensure_meta_compatible(grad_meta, output_meta)?;
    ensure_pad_shapes(output_meta, grad_meta, geometry, "gradient")?;
    ensure_storage_len(grad, grad_meta, "gradient")?;
    ensure_storage_len(output, output_meta, "output")?;

    let (_, height, width) = split_planes(output_meta, "output")?;
    let (_, grad_height, grad_width) = split_planes(grad_meta, "gradient")?;
    let row_map = axis_source_map(height, geometry.top, geometry.bottom, mode, "row")?;
    let col_map = axis_source_map(width, geometry.left, geometry.right, mode, "column")?;
    let row_preimages = axis_preimages(&row_map, height);
    let col_preimages = axis_preimages(&col_map, width);

    let src = window(grad, grad_meta);
    let dst = window_mut(output, output_meta);

    for_each_row(dst, width, exec, |row, out_row| {
        let plane = row / height;
        let plane_start = plane * grad_height * grad_width;
        let own_row = row % height + geometry.top;
        let rows = &row_preimages[row % height];
        for (col, (value, cols)) in out_row.iter_mut().zip(col_preimages.iter()).enumerate() {
            let own = (own_row, col + geometry.left);
            let mut acc = src[plane_start + own.0 * grad_width + own.1];
            // Border copies in increasing padded offset.
            for grad_row in rows.iter().copied() {
                let grad_row_values = &src[plane_start + grad_row * grad_width..][..grad_width];
                for grad_col in cols.iter().copied() {
                    if (grad_row, grad_col) != own {
                        acc = acc + grad_row_values[grad_col];
                    }
                }
            }
            *value = acc;
        }
    });

    Ok(())
}

/// Inner product accumulated in `f64`, in index order.
pub fn dot_contiguous<T: Element>(
    lhs: &[T],
    rhs: &[T],
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<f64, KernelError> {
    ensure_meta_compatible(lhs_meta, rhs_meta)?;
    if lhs_meta.shape() != rhs_meta.shape() {
        return Err(KernelError::ShapeMismatch {
            side: "rhs",
            expected: lhs_meta.shape().to_vec(),
            actual: rhs_meta.shape().to_vec(),
        });
    }
    ensure_storage_len(lhs, lhs_meta, "lhs")?;
    ensure_storage_len(rhs, rhs_meta, "rhs")?;

    if lhs_meta.numel() == 0 {
        return Ok(0.0);
    }

    Ok(window(lhs, lhs_meta)
        .iter()
        .zip(window(rhs, rhs_meta).iter())
        .map(|(left, right)| left.widen() * right.widen())
        .sum())
}
