//! Свёрточный фронтенд: два блока Conv2d → BatchNorm → clipped ReLU.
//!
//! Раскладка NCHW: (batch, channels, time, freq). Обе свёртки valid
//! (без дополнения), поэтому длины примеров пересчитываются отдельно
//! (см. [`crate::seqlen`]).

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Init, VarBuilder};
use tracing::debug;

use crate::config::{ConvDescriptor, DeepSpeechConfig};
use crate::losses::LossCollection;

/// Начальное значение bias свёрток.
const CONV_BIAS_INIT: f64 = -0.05;

/// Clipped ReLU: `min(max(x, 0), cap)`.
pub fn relux(x: &Tensor, cap: f64) -> Result<Tensor> {
    x.clamp(0f64, cap)
}

/// Valid-свёртка с независимыми шагами по времени и частоте.
///
/// Candle поддерживает только одинаковый шаг по обеим осям, поэтому при
/// разных шагах считаем свёртку с шагом 1 и прореживаем результат.
fn valid_conv2d(x: &Tensor, kernel: &Tensor, stride_time: usize, stride_freq: usize) -> Result<Tensor> {
    if stride_time == stride_freq {
        return x.conv2d(kernel, 0, stride_time, 1, 1);
    }
    let out = x.conv2d(kernel, 0, 1, 1, 1)?;
    let out = subsample(&out, 2, stride_time)?;
    subsample(&out, 3, stride_freq)
}

/// Взять каждый `stride`-й элемент по оси `dim`, начиная с нулевого.
fn subsample(x: &Tensor, dim: usize, stride: usize) -> Result<Tensor> {
    if stride == 1 {
        return Ok(x.clone());
    }
    let len = x.dim(dim)?;
    let n = if len == 0 { 0 } else { (len - 1) / stride + 1 };
    let idx: Vec<u32> = (0..n).map(|i| (i * stride) as u32).collect();
    let idx = Tensor::from_vec(idx, n, x.device())?;
    x.index_select(&idx, dim)
}

/// Один свёрточный блок.
pub struct ConvBlock {
    /// (out_channels, in_channels, kernel_time, kernel_freq)
    weight: Tensor,
    bias: Tensor,
    bn: BatchNorm,
    desc: ConvDescriptor,
    cap: f64,
}

impl ConvBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        desc: ConvDescriptor,
        cap: f64,
        bn_cfg: BatchNormConfig,
        wd: Option<f64>,
        losses: &mut LossCollection,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels, desc.kernel_time, desc.kernel_freq),
            "weights",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(out_channels, "biases", Init::Const(CONV_BIAS_INIT))?;
        let bn = candle_nn::batch_norm(out_channels, bn_cfg, vb.pp("bn"))?;
        losses.register(format!("{}.weights", vb.prefix()), &weight, wd);

        Ok(Self {
            weight,
            bias,
            bn,
            desc,
            cap,
        })
    }
}

impl ModuleT for ConvBlock {
    /// (batch, in_ch, time, freq) → (batch, out_ch, time', freq')
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = valid_conv2d(x, &self.weight, self.desc.stride_time, self.desc.stride_freq)?;
        let h = h.broadcast_add(&self.bias.reshape((1, (), 1, 1))?)?;
        let h = self.bn.forward_t(&h, train)?;
        relux(&h, self.cap)
    }
}

/// Два свёрточных блока с одинаковым числом каналов.
pub struct ConvFrontEnd {
    conv1: ConvBlock,
    conv2: ConvBlock,
}

impl ConvFrontEnd {
    pub fn load(config: &DeepSpeechConfig, losses: &mut LossCollection, vb: VarBuilder) -> Result<Self> {
        let bn_cfg = BatchNormConfig {
            eps: config.batch_norm_eps,
            momentum: config.batch_norm_momentum,
            ..Default::default()
        };
        let conv1 = ConvBlock::load(
            1,
            config.num_filters,
            config.conv1,
            config.relu_cap,
            bn_cfg,
            config.weight_decay,
            losses,
            vb.pp("conv1"),
        )?;
        let conv2 = ConvBlock::load(
            config.num_filters,
            config.num_filters,
            config.conv2,
            config.relu_cap,
            bn_cfg,
            config.weight_decay,
            losses,
            vb.pp("conv2"),
        )?;
        debug!(
            "ConvFrontEnd: {} каналов, conv1 {:?}, conv2 {:?}",
            config.num_filters, config.conv1, config.conv2
        );
        Ok(Self { conv1, conv2 })
    }
}

impl ModuleT for ConvFrontEnd {
    /// (batch, time, freq) → (batch, channels, time', freq')
    fn forward_t(&self, feats: &Tensor, train: bool) -> Result<Tensor> {
        let x = feats.unsqueeze(1)?;
        let x = self.conv1.forward_t(&x, train)?;
        asr_core::debug::activation_summary("conv1", &x);
        let x = self.conv2.forward_t(&x, train)?;
        asr_core::debug::activation_summary("conv2", &x);
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> DeepSpeechConfig {
        DeepSpeechConfig {
            num_freq: 40,
            num_classes: 4,
            num_filters: 4,
            num_hidden: 8,
            num_rnn_layers: 1,
            batch_size: 2,
            conv1: ConvDescriptor::new(5, 5, 2, 2),
            conv2: ConvDescriptor::new(5, 5, 2, 1),
            ..DeepSpeechConfig::default()
        }
    }

    #[test]
    fn test_subsample() {
        let x = Tensor::arange(0u32, 7, &Device::Cpu).unwrap();
        let y = subsample(&x, 0, 3).unwrap();
        assert_eq!(y.to_vec1::<u32>().unwrap(), vec![0, 3, 6]);
    }

    #[test]
    fn test_mixed_stride_matches_output_length() {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 1, 23, 11), &dev).unwrap();
        let k = Tensor::randn(0f32, 1.0, (2, 1, 5, 3), &dev).unwrap();
        let y = valid_conv2d(&x, &k, 2, 1).unwrap();
        // (23-5)/2+1 = 10, (11-3)/1+1 = 9
        assert_eq!(y.dims(), &[1, 2, 10, 9]);

        // Совпадает с прямой свёрткой на подвыборке по времени.
        let full = x.conv2d(&k, 0, 1, 1, 1).unwrap();
        let row4 = full.narrow(2, 4, 1).unwrap();
        let got = y.narrow(2, 2, 1).unwrap();
        let diff = (row4 - got).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_front_end_shape_and_bounds() {
        let dev = Device::Cpu;
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut losses = LossCollection::new();
        let fe = ConvFrontEnd::load(&config, &mut losses, vb).unwrap();
        assert!(losses.is_empty());

        // Большие входы, чтобы проверить срез сверху.
        let x = (Tensor::randn(0f32, 1.0, (2, 50, 40), &dev).unwrap() * 100.0).unwrap();
        for train in [true, false] {
            let y = fe.forward_t(&x, train).unwrap();
            // time: 50 → 23 → 10; freq: 40 → 18 → 14
            assert_eq!(y.dims(), &[2, 4, 10, 14]);
            let min = y.min_all().unwrap().to_scalar::<f32>().unwrap();
            let max = y.max_all().unwrap().to_scalar::<f32>().unwrap();
            assert!(min >= 0.0);
            assert!(max <= 20.0);
        }
    }

    #[test]
    fn test_weight_decay_registration() {
        let dev = Device::Cpu;
        let mut config = small_config();
        config.weight_decay = Some(1e-4);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut losses = LossCollection::new();
        let _fe = ConvFrontEnd::load(&config, &mut losses, vb).unwrap();
        let names: Vec<&str> = losses.names().collect();
        assert_eq!(names, vec!["conv1.weights", "conv2.weights"]);
    }
}
