//! Входной батч: признаки, метки и длины примеров.

use asr_core::{AsrError, AsrResult};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::{DeepSpeechConfig, Precision};

/// Батч признаков.
///
/// - `features`: (batch, time, freq);
/// - `labels`: по метке (без blank) на пример;
/// - `seq_lens`: число валидных фреймов в каждом примере.
#[derive(Debug, Clone)]
pub struct FeatureBatch {
    pub features: Tensor,
    pub labels: Vec<Vec<u32>>,
    pub seq_lens: Vec<usize>,
}

impl FeatureBatch {
    /// Собрать батч с проверкой согласованности размеров.
    pub fn new(features: Tensor, labels: Vec<Vec<u32>>, seq_lens: Vec<usize>) -> AsrResult<Self> {
        let (batch, time, _freq) = features.dims3().map_err(|_| {
            AsrError::Inference(format!(
                "признаки должны быть (batch, time, freq), получено {:?}",
                features.dims()
            ))
        })?;
        if labels.len() != batch || seq_lens.len() != batch {
            return Err(AsrError::Inference(format!(
                "батч {batch}: меток {}, длин {}",
                labels.len(),
                seq_lens.len()
            )));
        }
        if let Some(&len) = seq_lens.iter().find(|&&l| l > time) {
            return Err(AsrError::Inference(format!(
                "длина {len} больше числа фреймов {time}"
            )));
        }
        Ok(Self {
            features,
            labels,
            seq_lens,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.seq_lens.len()
    }

    /// Число фреймов после дополнения.
    pub fn max_time(&self) -> AsrResult<usize> {
        Ok(self.features.dim(1)?)
    }

    /// Привести признаки к нужной точности.
    pub fn to_precision(&self, precision: Precision) -> AsrResult<Self> {
        Ok(Self {
            features: self.features.to_dtype(precision.dtype())?,
            labels: self.labels.clone(),
            seq_lens: self.seq_lens.clone(),
        })
    }

    /// Детерминированный синтетический батч для прогонов без датасета.
    ///
    /// Первый пример занимает все `time` фреймов, остальные короче.
    /// Длина метки не превышает половины фреймов после свёрток.
    pub fn synthetic(
        config: &DeepSpeechConfig,
        batch: usize,
        time: usize,
        seed: u64,
        device: &Device,
    ) -> AsrResult<Self> {
        if batch == 0 || time == 0 {
            return Err(AsrError::Config(format!(
                "синтетический батч {batch}×{time} пуст"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let freq = config.num_freq;
        let data: Vec<f32> = (0..batch * time * freq)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        let features = Tensor::from_vec(data, (batch, time, freq), device)?;

        let lt = config.length_transformer();
        let symbols = config.num_classes.saturating_sub(1).max(1) as u32;
        let mut labels = Vec::with_capacity(batch);
        let mut seq_lens = Vec::with_capacity(batch);
        for b in 0..batch {
            let len = if b == 0 { time } else { rng.gen_range(time / 2..=time) };
            let max_label = (lt.output_length(len) / 2).max(1);
            let label_len = rng.gen_range(1..=max_label);
            labels.push((0..label_len).map(|_| rng.gen_range(0..symbols)).collect());
            seq_lens.push(len);
        }
        debug!("синтетический батч: {batch}×{time}×{freq}, seq_lens={seq_lens:?}");
        Self::new(features, labels, seq_lens)
    }
}
