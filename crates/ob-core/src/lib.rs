#![forbid(unsafe_code)]

use std::fmt;

use num_traits::Float;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
}

/// How a kernel walks its independent units of work.
///
/// Both modes visit the same elements with the same per-element arithmetic,
/// so they must produce bit-identical results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    Serial,
    #[default]
    Parallel,
}

impl ExecutionMode {
    #[must_use]
    pub const fn all() -> &'static [ExecutionMode] {
        &[ExecutionMode::Serial, ExecutionMode::Parallel]
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Parallel => "parallel",
        }
    }
}

/// Scalar element types an operator can be instantiated with.
pub trait Element: Float + Default + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    /// Lossless widening used for inner products and reporting.
    fn widen(self) -> f64;

    fn narrow(value: f64) -> Self;
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn widen(self) -> f64 {
        self
    }

    fn narrow(value: f64) -> Self {
        value
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn widen(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn narrow(value: f64) -> Self {
        value as f32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            storage_offset: 0,
            dtype,
            device,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            storage_offset,
            dtype,
            device,
        };
        meta.validate()?;
        Ok(meta)
    }

    #[must_use]
    pub fn with_storage_offset(mut self, storage_offset: usize) -> Self {
        self.storage_offset = storage_offset;
        self
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        self.max_linear_offset().map(|_| ())
    }

    fn max_linear_offset(&self) -> Result<usize, TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }

        let mut max_linear_offset = 0usize;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            if size == 0 {
                continue;
            }

            let span = stride
                .checked_mul(size.saturating_sub(1))
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset.checked_add(span).ok_or(
                TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset,
                },
            )?;
        }

        self.storage_offset.checked_add(max_linear_offset).ok_or(
            TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset,
            },
        )
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            return 1;
        }
        self.shape.iter().copied().product()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Singleton dimensions are contiguous regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    /// Storage length needed to address every element of this view.
    pub fn required_storage_len(&self) -> Result<usize, TensorMetaError> {
        if self.shape.iter().any(|size| *size == 0) {
            return Ok(0);
        }
        let last = self.max_linear_offset()?;
        last.checked_add(1)
            .ok_or(TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset: last,
            })
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, TensorMetaError> {
        if index.len() != self.shape.len() {
            return Err(TensorMetaError::IndexRankMismatch {
                expected: self.shape.len(),
                actual: index.len(),
            });
        }

        let mut linear = self.storage_offset;
        for (dim, ((idx, dim_size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= dim_size {
                return Err(TensorMetaError::IndexOutOfBounds {
                    dim,
                    index: idx,
                    size: dim_size,
                });
            }

            let step = idx
                .checked_mul(stride)
                .ok_or(TensorMetaError::StrideOverflow { size: idx, stride })?;
            linear = linear
                .checked_add(step)
                .ok_or(TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset: step,
                })?;
        }

        Ok(linear)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    StorageOffsetOverflow {
        storage_offset: usize,
        max_linear_offset: usize,
    },
    IndexRankMismatch {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            } => write!(
                f,
                "storage offset overflow for storage_offset={storage_offset}, max_linear_offset={max_linear_offset}"
            ),
            Self::IndexRankMismatch { expected, actual } => {
                write!(
                    f,
                    "index rank mismatch expected={expected}, actual={actual}"
                )
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(
                    f,
                    "index out of bounds at dim={dim}: index={index}, size={size}"
                )
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorCompatError {
    DTypeMismatch { lhs: DType, rhs: DType },
    DeviceMismatch { lhs: Device, rhs: Device },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

pub fn ensure_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), TensorCompatError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.device() != rhs.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenseTensorError {
    Meta(TensorMetaError),
    DTypeMismatch { expected: DType, actual: DType },
    StorageLengthMismatch { expected: usize, actual: usize },
    InsufficientStorage { needed: usize, available: usize },
    NonContiguous { shape: Vec<usize>, strides: Vec<usize> },
}

impl fmt::Display for DenseTensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta(error) => write!(f, "invalid tensor meta: {error}"),
            Self::DTypeMismatch { expected, actual } => {
                write!(f, "dtype mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::StorageLengthMismatch { expected, actual } => {
                write!(
                    f,
                    "storage length mismatch: shape needs {expected} elements, got {actual}"
                )
            }
            Self::InsufficientStorage { needed, available } => {
                write!(
                    f,
                    "insufficient storage: needed={needed}, available={available}"
                )
            }
            Self::NonContiguous { shape, strides } => {
                write!(
                    f,
                    "non-contiguous view shape={shape:?} strides={strides:?}"
                )
            }
        }
    }
}

impl std::error::Error for DenseTensorError {}

impl From<TensorMetaError> for DenseTensorError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

/// Dense tensor owning its storage.
///
/// The meta may describe a strided view into `storage`; operators that
/// need a flat buffer go through [`DenseTensor::contiguous_values`].
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor<T: Element> {
    meta: TensorMeta,
    storage: Vec<T>,
}

impl<T: Element> DenseTensor<T> {
    #[must_use]
    pub fn zeros(shape: Vec<usize>, device: Device) -> Self {
        let meta = TensorMeta::from_shape(shape, T::DTYPE, device);
        let storage = vec![T::zero(); meta.numel()];
        Self { meta, storage }
    }

    pub fn from_vec(
        shape: Vec<usize>,
        values: Vec<T>,
        device: Device,
    ) -> Result<Self, DenseTensorError> {
        let meta = TensorMeta::from_shape(shape, T::DTYPE, device);
        if values.len() != meta.numel() {
            return Err(DenseTensorError::StorageLengthMismatch {
                expected: meta.numel(),
                actual: values.len(),
            });
        }
        Ok(Self {
            meta,
            storage: values,
        })
    }

    pub fn from_storage(meta: TensorMeta, storage: Vec<T>) -> Result<Self, DenseTensorError> {
        if meta.dtype() != T::DTYPE {
            return Err(DenseTensorError::DTypeMismatch {
                expected: T::DTYPE,
                actual: meta.dtype(),
            });
        }
        let needed = meta.required_storage_len()?;
        if storage.len() < needed {
            return Err(DenseTensorError::InsufficientStorage {
                needed,
                available: storage.len(),
            });
        }
        Ok(Self { meta, storage })
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.meta.numel()
    }

    #[must_use]
    pub fn storage(&self) -> &[T] {
        &self.storage
    }

    /// Meta and full backing storage, for kernels that write in place.
    pub fn parts_mut(&mut self) -> (&TensorMeta, &mut [T]) {
        (&self.meta, &mut self.storage)
    }

    pub fn contiguous_values(&self) -> Result<&[T], DenseTensorError> {
        let (start, len) = self.contiguous_window()?;
        Ok(&self.storage[start..start + len])
    }

    /// Values in logical row-major order, regardless of layout.
    pub fn to_vec(&self) -> Result<Vec<T>, DenseTensorError> {
        if self.meta.is_contiguous() {
            return self.contiguous_values().map(<[T]>::to_vec);
        }

        let shape = self.meta.shape().to_vec();
        let mut out = Vec::with_capacity(self.numel());
        let mut index = vec![0usize; shape.len()];
        for _ in 0..self.numel() {
            let linear = self.meta.storage_index_for(&index)?;
            let value = self.storage.get(linear).copied().ok_or(
                DenseTensorError::InsufficientStorage {
                    needed: linear + 1,
                    available: self.storage.len(),
                },
            )?;
            out.push(value);
            for dim in (0..shape.len()).rev() {
                index[dim] += 1;
                if index[dim] < shape[dim] {
                    break;
                }
                index[dim] = 0;
            }
        }
        Ok(out)
    }

    fn contiguous_window(&self) -> Result<(usize, usize), DenseTensorError> {
        if !self.meta.is_contiguous() {
            return Err(DenseTensorError::NonContiguous {
                shape: self.meta.shape().to_vec(),
                strides: self.meta.strides().to_vec(),
            });
        }
        let len = self.meta.numel();
        if len == 0 {
            return Ok((0, 0));
        }
        let start = self.meta.storage_offset();
        let available = self.storage.len();
        if start.saturating_add(len) > available {
            return Err(DenseTensorError::InsufficientStorage {
                needed: start.saturating_add(len),
                available,
            });
        }
        Ok((start, len))
    }
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}
