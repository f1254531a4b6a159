//! Row-major dense tensors over float element types.
//!
//! The last axis is the fastest-varying one. Shapes are listed slowest to
//! fastest, so an activation of shape `[C, T, B]` is laid out as a `C x (T*B)`
//! matrix and a linear projection over the channel axis is a single 2-D
//! matmul.

use num_traits::{Float, NumCast, One, Zero};
use thiserror::Error;

pub use half::{bf16, f16};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorError {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("out of bounds: {0}")]
    OutOfBounds(String),
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("conversion error: {0}")]
    ConversionError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub data: Vec<T>,
    pub shape: Vec<usize>,
}

/// Converts an `f64` literal into `T`, NaN if it is not representable.
pub fn float_const<T: Float>(v: f64) -> T {
    <T as NumCast>::from(v).unwrap_or_else(T::nan)
}

// Reductions accumulate in f64 so f16/bf16 sums keep growing past the
// element type's mantissa.
fn widen<T: Float>(x: T) -> f64 {
    x.to_f64().unwrap_or(f64::NAN)
}

/// Row-major strides for `shape`.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

// Splits `shape` around `axis` into (outer, axis length, inner) extents.
fn axis_extents(shape: &[usize], axis: usize) -> Result<(usize, usize, usize), TensorError> {
    if axis >= shape.len() {
        return Err(TensorError::InvalidShape(format!(
            "Axis {} out of bounds for rank {}",
            axis,
            shape.len()
        )));
    }
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    Ok((outer, shape[axis], inner))
}

// --- Generic Tensor Operations ---
impl<T: Clone> Tensor<T> {
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> Result<Tensor<T>, TensorError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(TensorError::DimensionMismatch(format!(
                "Data length {} does not match product of shape dimensions {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Tensor { data, shape })
    }

    pub fn full(shape: Vec<usize>, value: T) -> Tensor<T> {
        let num_elements = shape.iter().product();
        Tensor { data: vec![value; num_elements], shape }
    }

    pub fn from_fn(shape: Vec<usize>, f: impl FnMut(usize) -> T) -> Tensor<T> {
        let num_elements = shape.iter().product();
        Tensor { data: (0..num_elements).map(f).collect(), shape }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    fn flat_index(&self, indices: &[usize]) -> Result<usize, TensorError> {
        if indices.len() != self.rank() {
            return Err(TensorError::InvalidShape(format!(
                "Number of indices {} does not match tensor rank {}",
                indices.len(),
                self.rank()
            )));
        }
        let mut index = 0;
        let mut multiplier = 1;
        for (i, &dim_idx) in indices.iter().rev().enumerate() {
            let dim_size = self.shape[self.rank() - 1 - i];
            if dim_idx >= dim_size {
                return Err(TensorError::OutOfBounds(format!(
                    "Index {} out of bounds for dimension {} with size {}",
                    dim_idx,
                    self.rank() - 1 - i,
                    dim_size
                )));
            }
            index += dim_idx * multiplier;
            multiplier *= dim_size;
        }
        Ok(index)
    }

    pub fn get(&self, indices: &[usize]) -> Result<&T, TensorError> {
        let flat_index = self.flat_index(indices)?;
        self.data.get(flat_index).ok_or_else(|| {
            TensorError::OutOfBounds("Calculated flat index is out of data bounds".to_string())
        })
    }

    pub fn get_mut(&mut self, indices: &[usize]) -> Result<&mut T, TensorError> {
        let flat_index = self.flat_index(indices)?;
        self.data.get_mut(flat_index).ok_or_else(|| {
            TensorError::OutOfBounds("Calculated flat index is out of data bounds".to_string())
        })
    }

    pub fn reshape(&self, new_shape: Vec<usize>) -> Result<Tensor<T>, TensorError> {
        self.clone().into_shape(new_shape)
    }

    /// Same as [`Tensor::reshape`] but reuses the buffer.
    pub fn into_shape(self, new_shape: Vec<usize>) -> Result<Tensor<T>, TensorError> {
        let new_num_elements: usize = new_shape.iter().product();
        if new_num_elements != self.num_elements() {
            return Err(TensorError::DimensionMismatch(format!(
                "Cannot reshape {:?} into {:?}: element count differs",
                self.shape, new_shape
            )));
        }
        Ok(Tensor { data: self.data, shape: new_shape })
    }

    pub fn transpose(&self) -> Result<Tensor<T>, TensorError> {
        if self.rank() != 2 {
            return Err(TensorError::InvalidShape(
                "Transpose only supports 2D tensors, use permute".to_string(),
            ));
        }
        self.permute(&[1, 0])
    }

    /// Reorders axes; output axis `i` is input axis `axes[i]`.
    pub fn permute(&self, axes: &[usize]) -> Result<Tensor<T>, TensorError> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        if axes.len() != rank {
            return Err(TensorError::InvalidShape(format!(
                "Permutation {:?} does not match rank {}",
                axes, rank
            )));
        }
        for &a in axes {
            if a >= rank || seen[a] {
                return Err(TensorError::InvalidShape(format!("Invalid permutation {:?}", axes)));
            }
            seen[a] = true;
        }

        let new_shape: Vec<usize> = axes.iter().map(|&a| self.shape[a]).collect();
        let old_strides = strides(&self.shape);
        let gather: Vec<usize> = axes.iter().map(|&a| old_strides[a]).collect();
        let new_strides = strides(&new_shape);

        let mut new_data = Vec::with_capacity(self.data.len());
        for flat in 0..self.data.len() {
            let mut rem = flat;
            let mut src = 0;
            for d in 0..rank {
                let idx = rem / new_strides[d];
                rem %= new_strides[d];
                src += idx * gather[d];
            }
            new_data.push(self.data[src].clone());
        }
        Ok(Tensor { data: new_data, shape: new_shape })
    }

    /// Copies rows `[start, end)` of the leading axis.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Tensor<T>, TensorError> {
        let rows = *self.shape.first().ok_or_else(|| {
            TensorError::InvalidShape("Cannot slice rows of a scalar tensor".to_string())
        })?;
        if start > end || end > rows {
            return Err(TensorError::OutOfBounds(format!(
                "Row range {}..{} out of bounds for {} rows",
                start, end, rows
            )));
        }
        let row_len: usize = self.shape[1..].iter().product();
        let mut new_shape = self.shape.clone();
        new_shape[0] = end - start;
        Ok(Tensor {
            data: self.data[start * row_len..end * row_len].to_vec(),
            shape: new_shape,
        })
    }
}

impl<T: Clone + Zero> Tensor<T> {
    pub fn zeros(shape: Vec<usize>) -> Tensor<T> {
        Tensor::full(shape, T::zero())
    }
}

impl<T: Clone + One> Tensor<T> {
    pub fn ones(shape: Vec<usize>) -> Tensor<T> {
        Tensor::full(shape, T::one())
    }
}

// --- Float Operations ---
impl<T: Float> Tensor<T> {
    pub fn map(&self, f: impl Fn(T) -> T) -> Tensor<T> {
        Tensor {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }

    pub fn zip_with(&self, other: &Tensor<T>, f: impl Fn(T, T) -> T) -> Result<Tensor<T>, TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::DimensionMismatch(format!(
                "Element-wise op requires identical shapes. Got {:?} and {:?}",
                self.shape, other.shape
            )));
        }
        let data = self.data.iter().zip(other.data.iter()).map(|(&a, &b)| f(a, b)).collect();
        Ok(Tensor { data, shape: self.shape.clone() })
    }

    pub fn add(&self, other: &Tensor<T>) -> Result<Tensor<T>, TensorError> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn mul(&self, other: &Tensor<T>) -> Result<Tensor<T>, TensorError> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Element-wise product where every axis of `other` either matches `self`
    /// or has extent 1 and is broadcast.
    pub fn mul_broadcast(&self, other: &Tensor<T>) -> Result<Tensor<T>, TensorError> {
        if self.rank() != other.rank() {
            return Err(TensorError::DimensionMismatch(format!(
                "Broadcast requires equal ranks. Got {:?} and {:?}",
                self.shape, other.shape
            )));
        }
        for (&a, &b) in self.shape.iter().zip(other.shape.iter()) {
            if b != a && b != 1 {
                return Err(TensorError::DimensionMismatch(format!(
                    "Shape {:?} is not broadcastable to {:?}",
                    other.shape, self.shape
                )));
            }
        }
        let out_strides = strides(&self.shape);
        let other_strides: Vec<usize> = strides(&other.shape)
            .into_iter()
            .zip(other.shape.iter())
            .map(|(s, &dim)| if dim == 1 { 0 } else { s })
            .collect();

        let mut data = Vec::with_capacity(self.data.len());
        for (flat, &x) in self.data.iter().enumerate() {
            let mut rem = flat;
            let mut src = 0;
            for d in 0..self.rank() {
                src += (rem / out_strides[d]) * other_strides[d];
                rem %= out_strides[d];
            }
            data.push(x * other.data[src]);
        }
        Ok(Tensor { data, shape: self.shape.clone() })
    }

    pub fn scalar_mul(&mut self, scalar: T) -> Result<(), TensorError> {
        for val in self.data.iter_mut() {
            *val = *val * scalar;
        }
        Ok(())
    }

    pub fn scalar_add(&mut self, scalar: T) -> Result<(), TensorError> {
        for val in self.data.iter_mut() {
            *val = *val + scalar;
        }
        Ok(())
    }

    pub fn sum(&self) -> T {
        float_const(self.data.iter().map(|&x| widen(x)).sum())
    }

    pub fn mean(&self) -> Result<T, TensorError> {
        if self.data.is_empty() {
            return Err(TensorError::InvalidShape("Mean of an empty tensor".to_string()));
        }
        Ok(self.sum() / float_const(self.data.len() as f64))
    }

    pub fn max_abs_diff(&self, other: &Tensor<T>) -> Result<T, TensorError> {
        let diff = self.zip_with(other, |a, b| (a - b).abs())?;
        Ok(diff.data.iter().fold(T::zero(), |acc, &x| acc.max(x)))
    }

    pub fn matmul(&self, b: &Tensor<T>) -> Result<Tensor<T>, TensorError> {
        if self.rank() != 2 || b.rank() != 2 {
            return Err(TensorError::InvalidShape("Matmul only supports 2D tensors.".to_string()));
        }
        let m = self.shape[0];
        let k1 = self.shape[1];
        let k2 = b.shape[0];
        let n = b.shape[1];
        if k1 != k2 {
            return Err(TensorError::DimensionMismatch(format!(
                "Matrix dimensions incompatible for multiplication: A({},{}) B({},{})",
                m, k1, k2, n
            )));
        }
        let mut c_data = vec![T::zero(); m * n];
        matmul_into(&self.data, &b.data, m, k1, n, &mut c_data);
        Tensor::new(c_data, vec![m, n])
    }

    /// `[N, M, K] x [N, K, P] -> [N, M, P]`.
    pub fn batched_matmul(&self, b: &Tensor<T>) -> Result<Tensor<T>, TensorError> {
        let (n, m, k) = self.batch_dims("batched_matmul lhs")?;
        let (n_b, k_b, p) = b.batch_dims("batched_matmul rhs")?;
        if n != n_b || k != k_b {
            return Err(TensorError::DimensionMismatch(format!(
                "batched_matmul: {:?} x {:?}",
                self.shape, b.shape
            )));
        }
        let mut out = vec![T::zero(); n * m * p];
        for i in 0..n {
            matmul_into(
                &self.data[i * m * k..(i + 1) * m * k],
                &b.data[i * k * p..(i + 1) * k * p],
                m,
                k,
                p,
                &mut out[i * m * p..(i + 1) * m * p],
            );
        }
        Tensor::new(out, vec![n, m, p])
    }

    /// `[N, M, K] x [N, P, K]^T -> [N, M, P]`.
    pub fn batched_matmul_nt(&self, b: &Tensor<T>) -> Result<Tensor<T>, TensorError> {
        let (n, m, k) = self.batch_dims("batched_matmul_nt lhs")?;
        let (n_b, p, k_b) = b.batch_dims("batched_matmul_nt rhs")?;
        if n != n_b || k != k_b {
            return Err(TensorError::DimensionMismatch(format!(
                "batched_matmul_nt: {:?} x {:?}^T",
                self.shape, b.shape
            )));
        }
        let mut out = Vec::with_capacity(n * m * p);
        for i in 0..n {
            let a_mat = &self.data[i * m * k..(i + 1) * m * k];
            let b_mat = &b.data[i * p * k..(i + 1) * p * k];
            for row in a_mat.chunks_exact(k) {
                for col in b_mat.chunks_exact(k) {
                    let dot: f64 =
                        row.iter().zip(col.iter()).map(|(&x, &y)| widen(x) * widen(y)).sum();
                    out.push(float_const(dot));
                }
            }
        }
        Tensor::new(out, vec![n, m, p])
    }

    fn batch_dims(&self, what: &str) -> Result<(usize, usize, usize), TensorError> {
        if self.rank() != 3 {
            return Err(TensorError::InvalidShape(format!(
                "{} expects a 3D tensor, got {:?}",
                what, self.shape
            )));
        }
        Ok((self.shape[0], self.shape[1], self.shape[2]))
    }

    /// Softmax along `axis`, stabilized by subtracting the per-slice max.
    pub fn softmax(&mut self, axis: usize) -> Result<(), TensorError> {
        let (outer, len, inner) = axis_extents(&self.shape, axis)?;
        if len == 0 {
            return Ok(());
        }
        let mut exps = vec![0.0f64; len];
        for o in 0..outer {
            for i in 0..inner {
                let base = o * len * inner + i;
                let max_val = (0..len)
                    .map(|j| widen(self.data[base + j * inner]))
                    .fold(f64::NEG_INFINITY, f64::max);
                let mut sum_exp = 0.0;
                for (j, e) in exps.iter_mut().enumerate() {
                    *e = (widen(self.data[base + j * inner]) - max_val).exp();
                    sum_exp += *e;
                }
                let inv_sum_exp = if sum_exp == 0.0 { 0.0 } else { 1.0 / sum_exp };
                for (j, &e) in exps.iter().enumerate() {
                    self.data[base + j * inner] = float_const(e * inv_sum_exp);
                }
            }
        }
        Ok(())
    }

    /// Layer normalization over `axis` with biased variance, followed by the
    /// affine `gamma * x_hat + beta`.
    pub fn layernorm(
        &mut self,
        axis: usize,
        gamma: &Tensor<T>,
        beta: &Tensor<T>,
        epsilon: T,
    ) -> Result<(), TensorError> {
        let (outer, len, inner) = axis_extents(&self.shape, axis)?;
        if gamma.shape != [len] || beta.shape != [len] {
            return Err(TensorError::DimensionMismatch(format!(
                "Gamma/Beta shapes {:?}/{:?} must be [{}]",
                gamma.shape, beta.shape, len
            )));
        }
        if len == 0 {
            return Ok(());
        }
        let n = len as f64;
        let epsilon = widen(epsilon);
        for o in 0..outer {
            for i in 0..inner {
                let base = o * len * inner + i;
                let mean = (0..len).map(|j| widen(self.data[base + j * inner])).sum::<f64>() / n;
                let variance = (0..len)
                    .map(|j| {
                        let d = widen(self.data[base + j * inner]) - mean;
                        d * d
                    })
                    .sum::<f64>()
                    / n;
                let std_dev_inv = 1.0 / (variance + epsilon).sqrt();
                for j in 0..len {
                    let idx = base + j * inner;
                    let x_hat = (widen(self.data[idx]) - mean) * std_dev_inv;
                    self.data[idx] = float_const(x_hat * widen(gamma.data[j]) + widen(beta.data[j]));
                }
            }
        }
        Ok(())
    }

    pub fn cast<U: Float>(&self) -> Result<Tensor<U>, TensorError> {
        let data = self
            .data
            .iter()
            .map(|&x| {
                <U as NumCast>::from(x).ok_or_else(|| {
                    TensorError::ConversionError("Value not representable in target type".to_string())
                })
            })
            .collect::<Result<Vec<U>, TensorError>>()?;
        Tensor::new(data, self.shape.clone())
    }
}

// C[m,n] = A[m,k] * B[k,n]; i-k-j order keeps the inner loop contiguous.
fn matmul_into<T: Float>(a: &[T], b: &[T], m: usize, k: usize, n: usize, c: &mut [T]) {
    let b_wide: Vec<f64> = b.iter().map(|&x| widen(x)).collect();
    let mut acc = vec![0.0f64; n];
    for i in 0..m {
        acc.iter_mut().for_each(|v| *v = 0.0);
        for l in 0..k {
            let a_val = widen(a[i * k + l]);
            let b_row = &b_wide[l * n..(l + 1) * n];
            for (s, &b_val) in acc.iter_mut().zip(b_row.iter()) {
                *s += a_val * b_val;
            }
        }
        for (c_val, &s) in c[i * n..(i + 1) * n].iter_mut().zip(acc.iter()) {
            *c_val = float_const(s);
        }
    }
}
