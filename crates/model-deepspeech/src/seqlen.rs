//! Пересчёт длин последовательностей через свёртки без дополнения.
//!
//! Для каждого примера длина `L` после valid-свёртки с ядром `K` и шагом `S`
//! по времени: `L' = floor((L - K) / S) + 1`, либо 0, если `L < K`.
//! Преобразования слоёв композируются.

use candle_core::{Device, Result, Tensor};

use crate::config::ConvDescriptor;

/// Длина после одной valid-свёртки (0, если ядро не помещается).
pub fn conv_output_length(length: usize, kernel: usize, stride: usize) -> usize {
    if length < kernel {
        0
    } else {
        (length - kernel) / stride + 1
    }
}

/// Композиция пересчётов длины по оси времени.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceLengthTransformer {
    /// (kernel_time, stride_time) каждого слоя по порядку.
    stages: Vec<(usize, usize)>,
}

impl SequenceLengthTransformer {
    pub fn new(convs: &[ConvDescriptor]) -> Self {
        Self {
            stages: convs
                .iter()
                .map(|c| (c.kernel_time, c.stride_time))
                .collect(),
        }
    }

    /// Длина одного примера после всех слоёв.
    pub fn output_length(&self, length: usize) -> usize {
        self.stages
            .iter()
            .fold(length, |len, &(k, s)| conv_output_length(len, k, s))
    }

    /// Длины батча после всех слоёв.
    pub fn transform(&self, lengths: &[usize]) -> Vec<usize> {
        lengths.iter().map(|&l| self.output_length(l)).collect()
    }

    /// Длины батча, ограниченные фактической длиной выходного тензора.
    pub fn transform_clamped(&self, lengths: &[usize], time_dim: usize) -> Vec<usize> {
        lengths
            .iter()
            .map(|&l| self.output_length(l).min(time_dim))
            .collect()
    }
}

/// Маска валидных фреймов (time, batch, 1): 1 при `t < lengths[b]`, иначе 0.
pub fn time_major_mask(lengths: &[usize], time: usize, device: &Device) -> Result<Tensor> {
    let batch = lengths.len();
    let mut data = vec![0u8; time * batch];
    for (b, &len) in lengths.iter().enumerate() {
        for t in 0..len.min(time) {
            data[t * batch + b] = 1;
        }
    }
    Tensor::from_vec(data, (time, batch, 1), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k5s2() -> SequenceLengthTransformer {
        SequenceLengthTransformer::new(&[ConvDescriptor::new(5, 5, 2, 2), ConvDescriptor::new(5, 5, 2, 1)])
    }

    #[test]
    fn test_single_stage_bounds() {
        for kernel in 1..8 {
            for stride in 1..4 {
                for len in 0..64 {
                    let out = conv_output_length(len, kernel, stride);
                    if len < kernel {
                        assert_eq!(out, 0, "L={len} K={kernel} S={stride}");
                    } else {
                        assert_eq!(out, (len - kernel) / stride + 1);
                        assert!(out <= len);
                    }
                }
            }
        }
    }

    #[test]
    fn test_composed_length_100() {
        // (100-5)/2+1 = 48, (48-5)/2+1 = 22
        let lt = k5s2();
        assert_eq!(lt.output_length(100), 22);
        assert_eq!(lt.transform(&[100, 100, 100]), vec![22, 22, 22]);
        assert_eq!(lt.transform(&[7, 100]), vec![0, 22]);
    }

    #[test]
    fn test_shorter_than_kernel_is_zero() {
        let lt = k5s2();
        assert_eq!(lt.output_length(4), 0);
        assert_eq!(lt.output_length(0), 0);
    }

    #[test]
    fn test_transform_clamped() {
        let lt = k5s2();
        assert_eq!(lt.transform_clamped(&[100, 50], 10), vec![10, 10]);
    }

    #[test]
    fn test_time_major_mask() {
        let mask = time_major_mask(&[3, 1], 4, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[4, 2, 1]);
        let m: Vec<Vec<u8>> = mask.squeeze(2).unwrap().to_vec2().unwrap();
        assert_eq!(m, vec![vec![1, 1], vec![1, 0], vec![1, 0], vec![0, 0]]);
    }
}
