//! Dense row-major tensors holding model parameters and activations.
//!
//! Layout changes (e.g. between `HWIO` and `OIHW` kernels) are expressed as axis
//! permutations, which are bijective: [`Tensor::permute`] followed by the
//! [`inverse_permutation`] of the same axes gives back the original tensor bit for bit.

mod error;
mod utilities;

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

pub use error::TensorError;
pub use utilities::inverse_permutation;
pub(crate) use utilities::strides;
use utilities::{get_all_coords, is_permutation};

pub type Shape = Vec<usize>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T> {
    /// The dimensions of the tensor
    shape: Shape,
    /// The actual data, row-major
    data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Creates a new tensor, panicking if `data` does not fill `shape`
    pub fn new(shape: Shape, data: Vec<T>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {shape:?} incompatible with data of length {}",
            data.len()
        );
        Self { shape, data }
    }

    pub fn try_new(shape: Shape, data: Vec<T>) -> Result<Self, TensorError> {
        let total_size = shape.iter().product::<usize>();
        if data.len() != total_size {
            return Err(TensorError::ParameterError(format!(
                "Could not construct Tensor, expected data length to be {}, supplied data had length: {}",
                total_size,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn get_shape(&self) -> Shape {
        self.shape.clone()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// How many dimensions the tensor has
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn get_data(&self) -> &[T] {
        &self.data
    }

    pub fn get_data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reinterprets the data under a new shape with the same number of elements
    pub fn reshape(self, shape: Shape) -> Result<Self, TensorError> {
        if shape.iter().product::<usize>() != self.data.len() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape,
                found: shape,
            });
        }
        Ok(Self {
            shape,
            data: self.data,
        })
    }
}

impl<T: Copy> Tensor<T> {
    /// This converts a position given in "cartesian" form to the relevant index in the
    /// `self.data` vector.
    ///
    /// ```
    /// use optkit::tensor::Tensor;
    ///
    /// let tensor = Tensor::new(vec![2, 2, 3], vec![0.0f32; 12]);
    /// assert_eq!(tensor.get_index(&[0, 1, 2]).unwrap(), 5);
    /// ```
    pub fn get_index(&self, coords: &[usize]) -> Result<usize, TensorError> {
        let shape = self.shape();
        if shape.len() != coords.len() {
            return Err(TensorError::ParameterError(format!(
                "Cannot convert coordinates to an index if coords length != shape length, coords length: {}, shape length: {}",
                coords.len(),
                shape.len()
            )));
        }

        let (index, _): (usize, usize) = coords.iter().zip(shape.iter()).rev().try_fold(
            (0usize, 1usize),
            |(index_acc, dim_acc), (&coord, &dim)| {
                if coord >= dim {
                    return Err(TensorError::ParameterError(
                        "Coordinate value was larger than the axes size, cannot get index"
                            .to_string(),
                    ));
                }

                Ok((index_acc + dim_acc * coord, dim_acc * dim))
            },
        )?;

        Ok(index)
    }

    pub fn get(&self, coords: &[usize]) -> Result<T, TensorError> {
        Ok(self.data[self.get_index(coords)?])
    }

    /// Reorders the axes: axis `i` of the output is axis `axes[i]` of `self`.
    pub fn permute(&self, axes: &[usize]) -> Result<Self, TensorError> {
        if axes.len() != self.rank() || !is_permutation(axes) {
            return Err(TensorError::ParameterError(format!(
                "{axes:?} is not a permutation of the {} axes of the tensor",
                self.rank()
            )));
        }
        let old_strides = strides(&self.shape);
        let new_shape: Shape = axes.iter().map(|&a| self.shape[a]).collect();
        let moved_strides: Vec<usize> = axes.iter().map(|&a| old_strides[a]).collect();
        let data = get_all_coords(&new_shape)
            .iter()
            .map(|coords| {
                let old_index: usize = coords
                    .iter()
                    .zip(moved_strides.iter())
                    .map(|(c, s)| c * s)
                    .sum();
                self.data[old_index]
            })
            .collect();
        Ok(Self {
            shape: new_shape,
            data,
        })
    }

    /// Moves tensor axis. The first `usize` is the axis to move and the second `usize` is the
    /// position to move to.
    pub fn move_axis(&self, from: usize, to: usize) -> Result<Self, TensorError> {
        let rank = self.rank();
        if from >= rank || to >= rank {
            return Err(TensorError::ParameterError(format!(
                "Cannot move axis {from} to {to}, valid range is 0 to {}",
                rank.saturating_sub(1)
            )));
        }
        let mut axes: Vec<usize> = (0..rank).collect();
        let moved = axes.remove(from);
        axes.insert(to, moved);
        self.permute(&axes)
    }

    /// Swaps two axes in the tensor.
    pub fn swap_axes(&self, a: usize, b: usize) -> Result<Self, TensorError> {
        let rank = self.rank();
        if a >= rank || b >= rank {
            return Err(TensorError::ParameterError(format!(
                "Cannot swap axes {a} and {b}, valid range is 0 to {}",
                rank.saturating_sub(1)
            )));
        }
        let mut axes: Vec<usize> = (0..rank).collect();
        axes.swap(a, b);
        self.permute(&axes)
    }
}

impl Tensor<f32> {
    pub fn zeros(shape: Shape) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: Shape, value: f32) -> Self {
        let size = shape.iter().product::<usize>();
        Self {
            shape,
            data: vec![value; size],
        }
    }

    /// Uniform values in `[-1, 1)` drawn from a seeded generator
    pub fn random_seeded(shape: Shape, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::random_with(shape, &mut rng)
    }

    pub fn random_with<R: Rng>(shape: Shape, rng: &mut R) -> Self {
        let size = shape.iter().product::<usize>();
        let data = (0..size).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Self { shape, data }
    }

    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn min_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Largest element-wise absolute difference, infinite when shapes differ
    pub fn max_abs_diff(&self, other: &Self) -> f32 {
        if self.shape != other.shape {
            return f32::INFINITY;
        }
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coords() {
        let shape = vec![2, 4, 3];
        let size = shape.iter().product::<usize>();
        let tensor = Tensor::new(shape.clone(), vec![0.0f32; size]);

        for (i, coords) in get_all_coords(&shape).into_iter().enumerate() {
            assert_eq!(tensor.get_index(&coords).unwrap(), i);
        }
    }

    #[test]
    fn test_move_axis() {
        let a = Tensor::new(vec![2, 3, 2], (1..=12).collect::<Vec<i32>>());
        let expected = Tensor::new(vec![2, 2, 3], vec![1, 3, 5, 2, 4, 6, 7, 9, 11, 8, 10, 12]);
        assert_eq!(a.move_axis(1, 2).unwrap(), expected);
    }

    #[test]
    fn test_swap_axis() {
        let a = Tensor::new(vec![2, 3], vec![1, 2, 3, 4, 5, 6]);
        let expected = Tensor::new(vec![3, 2], vec![1, 4, 2, 5, 3, 6]);
        assert_eq!(a.swap_axes(0, 1).unwrap(), expected);
    }

    #[test]
    fn test_permute_is_invertible() {
        let t = Tensor::random_seeded(vec![3, 3, 4, 5], 7);
        for axes in [[3, 2, 0, 1], [2, 3, 0, 1], [0, 1, 2, 3], [1, 3, 0, 2]] {
            let moved = t.permute(&axes).unwrap();
            let back = moved.permute(&inverse_permutation(&axes)).unwrap();
            assert_eq!(back, t);
        }
    }

    #[test]
    fn test_permute_rejects_bad_axes() {
        let t = Tensor::random_seeded(vec![2, 2], 1);
        assert!(t.permute(&[0, 0]).is_err());
        assert!(t.permute(&[0]).is_err());
    }

    #[test]
    fn test_reshape_checks_size() {
        let t = Tensor::new(vec![2, 3], vec![0.0f32; 6]);
        assert!(t.clone().reshape(vec![3, 2]).is_ok());
        assert!(t.reshape(vec![4, 2]).is_err());
    }
}
