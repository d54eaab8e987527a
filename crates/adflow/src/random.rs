//! Random leaf construction.

use rand::Rng;
use rand::distr::StandardUniform;
use rand_distr::StandardNormal;

use crate::scalar::Scalar;
use crate::strides::numel;
use crate::tensor::Tensor;

/// Element types that can be sampled for random leaves.
pub trait RandomScalar: Scalar {
    /// Sample from the uniform distribution on [0, 1).
    fn sample_uniform<R: Rng>(rng: &mut R) -> Self;

    /// Sample from the standard normal distribution.
    fn sample_normal<R: Rng>(rng: &mut R) -> Self;
}

impl RandomScalar for f64 {
    fn sample_uniform<R: Rng>(rng: &mut R) -> Self {
        rng.sample(StandardUniform)
    }

    fn sample_normal<R: Rng>(rng: &mut R) -> Self {
        rng.sample(StandardNormal)
    }
}

impl RandomScalar for f32 {
    fn sample_uniform<R: Rng>(rng: &mut R) -> Self {
        rng.sample(StandardUniform)
    }

    fn sample_normal<R: Rng>(rng: &mut R) -> Self {
        rng.sample(StandardNormal)
    }
}

impl Tensor {
    /// Create a tensor with uniform random values in [0, 1).
    ///
    /// # Example
    ///
    /// ```
    /// use adflow::Tensor;
    ///
    /// let t = Tensor::random::<f64>(&[2, 3]);
    /// assert_eq!(t.shape(), &[2, 3]);
    /// assert!(t.to_f64_vec().iter().all(|&v| (0.0..1.0).contains(&v)));
    /// ```
    pub fn random<T: RandomScalar>(shape: &[usize]) -> Self {
        Self::random_with_rng::<T, _>(shape, &mut rand::rng())
    }

    /// Create a tensor with uniform random values using a specific RNG.
    ///
    /// # Example
    ///
    /// ```
    /// use adflow::Tensor;
    /// use rand::SeedableRng;
    /// use rand::rngs::StdRng;
    ///
    /// let mut rng = StdRng::seed_from_u64(42);
    /// let t1 = Tensor::random_with_rng::<f64, _>(&[2, 3], &mut rng);
    /// let mut rng = StdRng::seed_from_u64(42);
    /// let t2 = Tensor::random_with_rng::<f64, _>(&[2, 3], &mut rng);
    /// assert!(t1.bit_eq(&t2));
    /// ```
    pub fn random_with_rng<T: RandomScalar, R: Rng>(shape: &[usize], rng: &mut R) -> Self {
        let data: Vec<T> = (0..numel(shape)).map(|_| T::sample_uniform(rng)).collect();
        Self::from_sampled(data, shape)
    }

    /// Create a tensor with standard normal random values.
    pub fn randn<T: RandomScalar>(shape: &[usize]) -> Self {
        Self::randn_with_rng::<T, _>(shape, &mut rand::rng())
    }

    /// Create a tensor with standard normal random values using a specific RNG.
    pub fn randn_with_rng<T: RandomScalar, R: Rng>(shape: &[usize], rng: &mut R) -> Self {
        let data: Vec<T> = (0..numel(shape)).map(|_| T::sample_normal(rng)).collect();
        Self::from_sampled(data, shape)
    }

    fn from_sampled<T: Scalar>(data: Vec<T>, shape: &[usize]) -> Self {
        let mut t = Self::zeros(shape, T::DTYPE);
        if let Ok(dst) = t.as_mut_slice::<T>() {
            dst.copy_from_slice(&data);
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_random_f64_range() {
        let t = Tensor::random::<f64>(&[2, 3]);
        assert_eq!(t.len(), 6);
        for v in t.to_vec::<f64>().unwrap() {
            assert!((0.0..1.0).contains(&v), "value {} not in [0, 1)", v);
        }
    }

    #[test]
    fn test_random_f32_dtype() {
        let t = Tensor::random::<f32>(&[4]);
        assert_eq!(t.dtype(), crate::DType::F32);
    }

    #[test]
    fn test_randn_moments() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = Tensor::randn_with_rng::<f64, _>(&[400], &mut rng);
        let data = t.to_vec::<f64>().unwrap();
        let mean = data.iter().sum::<f64>() / 400.0;
        let var = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 400.0;
        assert!(mean.abs() < 0.3, "mean {} too far from 0", mean);
        assert!(var > 0.5 && var < 1.5, "variance {} too far from 1", var);
    }

    #[test]
    fn test_randn_reproducible() {
        let mut rng1 = StdRng::seed_from_u64(54321);
        let t1 = Tensor::randn_with_rng::<f64, _>(&[3, 4], &mut rng1);
        let mut rng2 = StdRng::seed_from_u64(54321);
        let t2 = Tensor::randn_with_rng::<f64, _>(&[3, 4], &mut rng2);
        assert!(t1.bit_eq(&t2));
    }

    #[test]
    fn test_random_scalar_tensor() {
        let t = Tensor::random::<f64>(&[]);
        assert_eq!(t.len(), 1);
    }
}
