//! Dense row-major tensors.
//!
//! A [`Tensor`] owns its buffer. Reshaping without a copy is expressed as a
//! borrow: [`Tensor::view`] / [`Tensor::view_mut`] hand out a
//! [`TensorView`] / [`TensorViewMut`] over the same buffer, so a view can
//! never outlive the data it reinterprets, and writes through a mutable view
//! are visible in the source. [`Tensor::reshape`] is the owned, zero-copy
//! counterpart. Anything that must produce independent data (`clone`,
//! `ops::transpose`, `TensorView::to_tensor`) allocates a fresh buffer.

use rand::Rng;

use crate::error::{Result, TensorError};

fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl Tensor {
    /// Zero-filled tensor.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(0.0, shape)
    }

    /// Tensor filled with a constant.
    pub fn full(value: f32, shape: &[usize]) -> Self {
        Tensor {
            data: vec![value; numel(shape)],
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        }
    }

    /// Uniform samples in `[0, 1)` drawn from the supplied generator.
    pub fn rand<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Self {
        let data = (0..numel(shape)).map(|_| rng.random::<f32>()).collect();
        Tensor {
            data,
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        }
    }

    /// Wraps an existing buffer; its length must equal the product of `shape`.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        if data.len() != numel(shape) {
            return Err(TensorError::DataLength {
                len: data.len(),
                shape: shape.to_vec(),
            });
        }
        Ok(Tensor {
            data,
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Size of the trailing axis (1 for a scalar).
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of rows when every leading axis is flattened.
    pub fn rows(&self) -> usize {
        self.size() / self.last_dim().max(1)
    }

    /// Contiguous slice for row `i` of the flattened `[rows, last_dim]` layout.
    pub fn row(&self, i: usize) -> &[f32] {
        let d = self.last_dim();
        &self.data[i * d..(i + 1) * d]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let d = self.last_dim();
        &mut self.data[i * d..(i + 1) * d]
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|x| *x = value);
    }

    /// Borrowed reinterpretation of the buffer under `shape`.
    pub fn view(&self, shape: &[usize]) -> Result<TensorView<'_>> {
        check_view(&self.shape, shape)?;
        Ok(TensorView {
            data: &self.data,
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        })
    }

    /// Mutable borrowed reinterpretation; writes land in this tensor.
    pub fn view_mut(&mut self, shape: &[usize]) -> Result<TensorViewMut<'_>> {
        check_view(&self.shape, shape)?;
        Ok(TensorViewMut {
            data: &mut self.data,
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        })
    }

    /// Owned reshape. Keeps the buffer, only shape and strides change.
    pub fn reshape(mut self, shape: &[usize]) -> Result<Tensor> {
        check_view(&self.shape, shape)?;
        self.shape = shape.to_vec();
        self.strides = compute_strides(shape);
        Ok(self)
    }
}

fn check_view(from: &[usize], to: &[usize]) -> Result<()> {
    if numel(from) != numel(to) {
        return Err(TensorError::shape_mismatch(from, to));
    }
    Ok(())
}

/// Read-only view sharing the buffer of a [`Tensor`].
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    data: &'a [f32],
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl<'a> TensorView<'a> {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// A view of a view still borrows the original buffer.
    pub fn view(&self, shape: &[usize]) -> Result<TensorView<'a>> {
        check_view(&self.shape, shape)?;
        Ok(TensorView {
            data: self.data,
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        })
    }

    /// Copies the viewed data into a new owned tensor.
    pub fn to_tensor(&self) -> Tensor {
        Tensor {
            data: self.data.to_vec(),
            shape: self.shape.clone(),
            strides: self.strides.clone(),
        }
    }
}

/// Mutable view sharing the buffer of a [`Tensor`].
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    data: &'a mut [f32],
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl TensorViewMut<'_> {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn data(&self) -> &[f32] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        self.data
    }

    /// Writes `value` at a multi-index of this view.
    pub fn set(&mut self, index: &[usize], value: f32) {
        assert_eq!(
            index.len(),
            self.shape.len(),
            "index rank {} does not match view rank {}",
            index.len(),
            self.shape.len()
        );
        let offset: usize = index
            .iter()
            .zip(&self.strides)
            .zip(&self.shape)
            .map(|((&i, &s), &dim)| {
                assert!(i < dim, "index {i} out of bounds for axis of size {dim}");
                i * s
            })
            .sum();
        self.data[offset] = value;
    }
}

/// Integer token ids laid out `[batch, time]`.
///
/// Ids stay integers all the way into the embedding lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIds {
    ids: Vec<usize>,
    batch: usize,
    time: usize,
}

impl TokenIds {
    pub fn new(ids: Vec<usize>, batch: usize, time: usize) -> Result<Self> {
        if ids.len() != batch * time {
            return Err(TensorError::DataLength {
                len: ids.len(),
                shape: vec![batch, time],
            });
        }
        Ok(TokenIds { ids, batch, time })
    }

    /// A single sequence, shaped `[1, len]`.
    pub fn from_sequence(ids: &[usize]) -> Self {
        TokenIds {
            ids: ids.to_vec(),
            batch: 1,
            time: ids.len(),
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn time(&self) -> usize {
        self.time
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.batch, self.time]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.ids
    }

    pub fn max_id(&self) -> Option<usize> {
        self.ids.iter().copied().max()
    }
}
