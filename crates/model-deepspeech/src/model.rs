//! Сборка модели DeepSpeech: свёртки → двунаправленный RNN-стек →
//! линейная голова → логиты (time, batch, num_classes).

use asr_core::{AsrError, AsrResult, ExecutionContext};
use candle_core::{DType, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use crate::brnn::BidirectionalStack;
use crate::config::{DeepSpeechConfig, Engine};
use crate::conv::ConvFrontEnd;
use crate::ctc::{greedy_decode, CtcLoss};
use crate::head::ProjectionHead;
use crate::losses::LossCollection;

/// Акустическая модель DeepSpeech2.
pub struct DeepSpeech {
    front_end: ConvFrontEnd,
    rnn: BidirectionalStack,
    head: ProjectionHead,
    ctc: CtcLoss,
    config: DeepSpeechConfig,
}

impl DeepSpeech {
    /// Построить модель поверх реестра весов.
    ///
    /// Возвращает модель и накопитель штрафов weight decay, в котором
    /// зарегистрированы веса свёрток и головы.
    ///
    /// Раскладка весов:
    /// - `conv1.*`, `conv2.*`: свёрточные блоки;
    /// - `rnn.brnn-{i}.{fw,bw}.*`: ячейки RNN;
    /// - `softmax_linear.*`: проекция на классы.
    pub fn build(
        config: &DeepSpeechConfig,
        ctx: &ExecutionContext,
        vb: VarBuilder,
    ) -> AsrResult<(Self, LossCollection)> {
        config.validate()?;
        let mut losses = LossCollection::new();

        // Свёртки и batch norm считаются в F32 независимо от точности RNN.
        let front_end = ConvFrontEnd::load(config, &mut losses, vb.clone().set_dtype(DType::F32))
            .map_err(|e| model_error("свёртки", e))?;
        let rnn = BidirectionalStack::load(config, ctx, vb.pp("rnn")).map_err(|e| model_error("rnn", e))?;
        if rnn.output_size() != config.rnn_output_size() {
            return Err(AsrError::Model(format!(
                "выход RNN {} ≠ 2 × num_hidden = {}",
                rnn.output_size(),
                config.rnn_output_size()
            )));
        }
        let head = ProjectionHead::load(
            rnn.output_size(),
            config.num_classes,
            config.weight_decay,
            &mut losses,
            vb.pp("softmax_linear").set_dtype(DType::F32),
        )
        .map_err(|e| model_error("softmax_linear", e))?;

        info!(
            "DeepSpeech '{}': {} фильтров, RNN {}×{} ({}), {} классов, {:?}, weight decay: {}",
            config.model_name,
            config.num_filters,
            config.num_rnn_layers,
            config.num_hidden,
            rnn.engine(),
            config.num_classes,
            config.precision(),
            losses.len()
        );

        Ok((
            Self {
                front_end,
                rnn,
                head,
                ctc: CtcLoss::new(config.blank_id()),
                config: config.clone(),
            },
            losses,
        ))
    }

    /// Модель со свежими весами в новом [`VarMap`].
    pub fn with_varmap(
        config: &DeepSpeechConfig,
        ctx: &ExecutionContext,
    ) -> AsrResult<(Self, LossCollection, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, ctx.device());
        let (model, losses) = Self::build(config, ctx, vb)?;
        Ok((model, losses, varmap))
    }

    pub fn config(&self) -> &DeepSpeechConfig {
        &self.config
    }

    /// Фактически используемая реализация RNN-ячеек.
    pub fn engine(&self) -> Engine {
        self.rnn.engine()
    }

    /// Длины после свёрток, ограниченные числом выходных фреймов.
    pub fn rnn_seq_lens(&self, seq_lens: &[usize], time_out: usize) -> Vec<usize> {
        self.config
            .length_transformer()
            .transform_clamped(seq_lens, time_out)
    }

    /// Прямой проход.
    ///
    /// `feats`: (batch, time, num_freq), `seq_lens`: исходные длины.
    /// `train` выбирает статистики batch norm: текущего батча (с обновлением
    /// бегущих) или бегущие.
    pub fn forward_t(&self, feats: &Tensor, seq_lens: &[usize], train: bool) -> AsrResult<Tensor> {
        let (batch, time, freq) = feats.dims3()?;
        if freq != self.config.num_freq {
            return Err(AsrError::Inference(format!(
                "ширина признаков {freq} ≠ num_freq {}",
                self.config.num_freq
            )));
        }
        if seq_lens.len() != batch {
            return Err(AsrError::Inference(format!(
                "длин {} на батч из {batch} примеров",
                seq_lens.len()
            )));
        }
        if let Some(&len) = seq_lens.iter().find(|&&l| l > time) {
            return Err(AsrError::Inference(format!(
                "длина {len} больше числа фреймов {time}"
            )));
        }
        let min_frames = self.config.min_input_frames();
        if time < min_frames {
            return Err(AsrError::Inference(format!(
                "батч из {time} фреймов короче минимума {min_frames} для свёрток"
            )));
        }

        // (batch, channels, time', freq')
        let conv = self
            .front_end
            .forward_t(&feats.to_dtype(DType::F32)?, train)?;
        let (_b, channels, time_out, freq_out) = conv.dims4()?;

        // (time', batch, channels × freq')
        let xs = conv
            .permute((2, 0, 1, 3))?
            .contiguous()?
            .reshape((time_out, batch, channels * freq_out))?;
        if channels * freq_out != self.config.rnn_input_size() {
            return Err(AsrError::Config(format!(
                "ширина после свёрток {} ≠ rnn_input_size {}",
                channels * freq_out,
                self.config.rnn_input_size()
            )));
        }

        let lens = self.rnn_seq_lens(seq_lens, time_out);
        debug!("DeepSpeech: {time} → {time_out} фреймов, длины {seq_lens:?} → {lens:?}");

        let hidden = self.rnn.forward(&xs, &lens)?;
        let logits = self.head.forward(&hidden)?;
        asr_core::debug::activation_summary("softmax_linear", &logits);
        Ok(logits)
    }

    /// Полная потеря: среднее CTC по батчу плюс все штрафы weight decay.
    ///
    /// `seq_lens` содержит исходные длины; длины после свёрток пересчитываются.
    pub fn loss(
        &self,
        logits: &Tensor,
        labels: &[Vec<u32>],
        seq_lens: &[usize],
        losses: &LossCollection,
    ) -> AsrResult<Tensor> {
        let lens = self.rnn_seq_lens(seq_lens, logits.dim(0)?);
        let ctc = self.ctc.forward(logits, labels, &lens)?;
        Ok(losses.total(&ctc)?)
    }

    /// Greedy-декодирование логитов в последовательности классов.
    pub fn decode(&self, logits: &Tensor, seq_lens: &[usize]) -> AsrResult<Vec<Vec<u32>>> {
        let lens = self.rnn_seq_lens(seq_lens, logits.dim(0)?);
        Ok(greedy_decode(logits, &lens, self.config.blank_id())?)
    }
}

/// Ошибка загрузки весов блока. Ошибки конфигурации проходят как есть.
fn model_error(block: &str, err: impl Into<AsrError>) -> AsrError {
    match err.into() {
        AsrError::Candle(e) => AsrError::Model(format!("{block}: {e}")),
        other => other,
    }
}

/// Построить модель на `ctx` и получить логиты для батча.
pub fn inference(
    ctx: &ExecutionContext,
    vb: VarBuilder,
    feats: &Tensor,
    seq_lens: &[usize],
    config: &DeepSpeechConfig,
    train: bool,
) -> AsrResult<(Tensor, DeepSpeech, LossCollection)> {
    let (model, losses) = DeepSpeech::build(config, ctx, vb)?;
    let logits = model.forward_t(feats, seq_lens, train)?;
    Ok((logits, model, losses))
}

/// Полная потеря по логитам, меткам и исходным длинам.
pub fn loss(
    config: &DeepSpeechConfig,
    logits: &Tensor,
    labels: &[Vec<u32>],
    seq_lens: &[usize],
    losses: &LossCollection,
) -> AsrResult<Tensor> {
    let lens = config
        .length_transformer()
        .transform_clamped(seq_lens, logits.dim(0)?);
    let ctc = CtcLoss::new(config.blank_id()).forward(logits, labels, &lens)?;
    Ok(losses.total(&ctc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvDescriptor;
    use candle_core::Device;
    use std::collections::HashMap;

    fn tiny() -> DeepSpeechConfig {
        DeepSpeechConfig {
            num_freq: 11,
            num_classes: 4,
            num_filters: 2,
            num_hidden: 3,
            num_rnn_layers: 1,
            batch_size: 2,
            conv1: ConvDescriptor::new(3, 5, 2, 2),
            conv2: ConvDescriptor::new(3, 3, 2, 1),
            ..DeepSpeechConfig::default()
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = DeepSpeechConfig {
            num_rnn_layers: 0,
            ..tiny()
        };
        let res = DeepSpeech::with_varmap(&config, &ExecutionContext::cpu());
        assert!(matches!(res, Err(AsrError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let ctx = ExecutionContext::cpu();
        let (model, _losses, _vm) = DeepSpeech::with_varmap(&tiny(), &ctx).unwrap();
        let dev = ctx.device();

        let wrong_freq = Tensor::zeros((2, 20, 10), DType::F32, dev).unwrap();
        assert!(matches!(model.forward_t(&wrong_freq, &[20, 20], false), Err(AsrError::Inference(_))));

        // min_input_frames = 3 + 2 * 2 = 7
        let short = Tensor::zeros((2, 6, 11), DType::F32, dev).unwrap();
        assert!(matches!(model.forward_t(&short, &[6, 6], false), Err(AsrError::Inference(_))));

        let ok = Tensor::zeros((2, 7, 11), DType::F32, dev).unwrap();
        let logits = model.forward_t(&ok, &[7, 3], false).unwrap();
        assert_eq!(logits.dims(), &[1, 2, 4]);
        assert_eq!(model.rnn_seq_lens(&[7, 3], 1), vec![1, 0]);
    }

    #[test]
    fn test_weight_layout() {
        let ctx = ExecutionContext::cpu();
        let config = DeepSpeechConfig {
            weight_decay: Some(1e-4),
            ..tiny()
        };
        let (_model, losses, varmap) = DeepSpeech::with_varmap(&config, &ctx).unwrap();
        assert_eq!(
            losses.names().collect::<Vec<_>>(),
            vec!["conv1.weights", "conv2.weights", "softmax_linear.weights"]
        );
        let data = varmap.data().lock().unwrap();
        for name in [
            "conv1.weights",
            "conv1.biases",
            "conv2.bn.running_mean",
            "rnn.brnn-0.fw.W",
            "rnn.brnn-0.bw.U",
            "softmax_linear.weights",
            "softmax_linear.biases",
        ] {
            assert!(data.contains_key(name), "нет веса {name}");
        }
    }

    #[test]
    fn test_missing_weights_is_model_error() {
        let ctx = ExecutionContext::cpu();
        let vb = VarBuilder::from_tensors(HashMap::new(), DType::F32, &Device::Cpu);
        match DeepSpeech::build(&tiny(), &ctx, vb) {
            Err(AsrError::Model(msg)) => assert!(msg.starts_with("свёртки"), "{msg}"),
            Err(e) => panic!("ожидалась AsrError::Model, получено {e}"),
            Ok(_) => panic!("модель построена без весов"),
        }
    }

    #[test]
    fn test_half_precision_keeps_front_end_in_f32() {
        let ctx = ExecutionContext::cpu();
        let config = DeepSpeechConfig {
            use_fp16: true,
            ..tiny()
        };
        let (_model, _losses, varmap) = DeepSpeech::with_varmap(&config, &ctx).unwrap();
        let data = varmap.data().lock().unwrap();
        let dtype = |name: &str| data.get(name).unwrap().as_tensor().dtype();
        assert_eq!(dtype("conv1.weights"), DType::F32);
        assert_eq!(dtype("conv2.bn.running_var"), DType::F32);
        assert_eq!(dtype("softmax_linear.weights"), DType::F32);
        assert_eq!(dtype("rnn.brnn-0.fw.W"), DType::F16);
    }
}
