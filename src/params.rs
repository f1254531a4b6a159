use num_traits::Float;
use tensor_core::Tensor;

use crate::error::{BlockError, Result};

/// A named tensor owned by exactly one sublayer. Its shape is fixed at
/// creation; `replace` only accepts tensors of the same shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter<T> {
    pub name: String,
    tensor: Tensor<T>,
    pub requires_grad: bool,
}

impl<T: Clone> Parameter<T> {
    /// Trainable parameter.
    pub fn new(name: impl Into<String>, tensor: Tensor<T>) -> Self {
        Parameter { name: name.into(), tensor, requires_grad: true }
    }

    /// Loaded parameter, excluded from gradient tracking.
    pub fn frozen(name: impl Into<String>, tensor: Tensor<T>) -> Self {
        Parameter { name: name.into(), tensor, requires_grad: false }
    }

    pub fn tensor(&self) -> &Tensor<T> {
        &self.tensor
    }

    pub fn shape(&self) -> &[usize] {
        &self.tensor.shape
    }

    pub fn num_elements(&self) -> usize {
        self.tensor.num_elements()
    }

    pub fn replace(&mut self, tensor: Tensor<T>) -> Result<()> {
        if tensor.shape != self.tensor.shape {
            return Err(BlockError::InvalidWeightShape(format!(
                "{} shape mismatch: expected {:?}, got {:?}",
                self.name, self.tensor.shape, tensor.shape
            )));
        }
        self.tensor = tensor;
        Ok(())
    }
}

impl<T: Float> Parameter<T> {
    pub fn cast<U: Float>(&self) -> Result<Parameter<U>> {
        Ok(Parameter {
            name: self.name.clone(),
            tensor: self.tensor.cast()?,
            requires_grad: self.requires_grad,
        })
    }
}
