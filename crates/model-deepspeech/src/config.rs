//! Конфигурация модели DeepSpeech.

use std::path::Path;

use asr_core::{AsrError, AsrResult};
use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::seqlen::SequenceLengthTransformer;

/// Режим дополнения свёртки.
///
/// Поддерживается только `valid` (без неявного дополнения): именно поэтому
/// длины последовательностей пересчитываются явно после каждой свёртки.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
}

/// Описание одного свёрточного слоя по осям (время, частота).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvDescriptor {
    /// Размер ядра по времени.
    pub kernel_time: usize,
    /// Размер ядра по частоте.
    pub kernel_freq: usize,
    /// Шаг по времени.
    pub stride_time: usize,
    /// Шаг по частоте.
    pub stride_freq: usize,
    #[serde(default)]
    pub padding: Padding,
}

impl ConvDescriptor {
    pub const fn new(
        kernel_time: usize,
        kernel_freq: usize,
        stride_time: usize,
        stride_freq: usize,
    ) -> Self {
        Self {
            kernel_time,
            kernel_freq,
            stride_time,
            stride_freq,
            padding: Padding::Valid,
        }
    }

    /// Первый блок: большое ядро по времени, шаг 2 по обеим осям.
    pub const fn conv1_default() -> Self {
        Self::new(20, 5, 2, 2)
    }

    /// Второй блок: ядро меньше, шаг 2 только по времени.
    pub const fn conv2_default() -> Self {
        Self::new(10, 5, 2, 1)
    }

    /// Выходной размер по частоте для входной ширины `freq` (0, если ядро не помещается).
    pub fn freq_out(&self, freq: usize) -> usize {
        crate::seqlen::conv_output_length(freq, self.kernel_freq, self.stride_freq)
    }

    fn validate(&self, name: &str) -> AsrResult<()> {
        if self.kernel_time == 0 || self.kernel_freq == 0 {
            return Err(AsrError::Config(format!("{name}: размер ядра должен быть > 0")));
        }
        if self.stride_time == 0 || self.stride_freq == 0 {
            return Err(AsrError::Config(format!("{name}: шаг должен быть > 0")));
        }
        Ok(())
    }
}

/// Реализация рекуррентной ячейки для всего стека.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// Лёгкая ячейка `relux(W·x + U·h + b)`, доступна всегда.
    #[default]
    Custom,
    /// Fused-ячейка со склеенным ядром; требует feature `fused-rnn`.
    #[serde(alias = "mkldnn_rnn", alias = "cudnn_rnn")]
    Fused,
}

impl Engine {
    /// Строковый идентификатор.
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Custom => "custom",
            Engine::Fused => "fused",
        }
    }

    /// Парсинг из строки (принимает и исторические имена движков).
    pub fn from_str_loose(s: &str) -> Option<Engine> {
        match s.to_lowercase().as_str() {
            "custom" | "default" | "custom_rnn" => Some(Engine::Custom),
            "fused" | "mkldnn_rnn" | "cudnn_rnn" => Some(Engine::Fused),
            _ => None,
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Численная точность весов и активаций.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    /// F32.
    Full,
    /// F16.
    Half,
}

impl Precision {
    pub fn from_fp16_flag(use_fp16: bool) -> Self {
        if use_fp16 {
            Precision::Half
        } else {
            Precision::Full
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Precision::Full => DType::F32,
            Precision::Half => DType::F16,
        }
    }
}

/// Конфигурация модели DeepSpeech.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepSpeechConfig {
    /// Название модели.
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Ширина входных признаков (число частотных бинов, 161).
    pub num_freq: usize,

    /// Количество классов включая blank (29, blank последний).
    pub num_classes: usize,

    /// Число каналов обоих свёрточных блоков (32).
    pub num_filters: usize,

    /// Размер скрытого состояния RNN (1760).
    pub num_hidden: usize,

    /// Количество двунаправленных RNN-слоёв (7).
    pub num_rnn_layers: usize,

    /// Размер мини-батча.
    pub batch_size: usize,

    /// F16 вместо F32 для весов и вычислений RNN-ячеек.
    ///
    /// Свёртки и batch norm всегда считаются в F32. Веса головы хранятся
    /// в F32, проекция выполняется в точности выхода RNN.
    #[serde(default)]
    pub use_fp16: bool,

    /// Реализация RNN-ячейки.
    #[serde(default)]
    pub engine: Engine,

    /// Первый свёрточный блок.
    #[serde(default = "ConvDescriptor::conv1_default")]
    pub conv1: ConvDescriptor,

    /// Второй свёрточный блок.
    #[serde(default = "ConvDescriptor::conv2_default")]
    pub conv2: ConvDescriptor,

    /// Верхняя граница clipped ReLU.
    #[serde(default = "default_relu_cap")]
    pub relu_cap: f64,

    /// Коэффициент L2-регуляризации весов; `None` выключает.
    #[serde(default)]
    pub weight_decay: Option<f64>,

    /// Epsilon batch-нормализации.
    #[serde(default = "default_bn_eps")]
    pub batch_norm_eps: f64,

    /// Momentum обновления бегущих статистик batch-нормализации.
    #[serde(default = "default_bn_momentum")]
    pub batch_norm_momentum: f64,
}

fn default_model_name() -> String {
    "deepspeech2".to_string()
}

fn default_relu_cap() -> f64 {
    20.0
}

fn default_bn_eps() -> f64 {
    1e-3
}

fn default_bn_momentum() -> f64 {
    0.1
}

impl Default for DeepSpeechConfig {
    fn default() -> Self {
        Self::librispeech()
    }
}

impl DeepSpeechConfig {
    /// Конфигурация для LibriSpeech (161 частотный бин, 29 классов).
    pub fn librispeech() -> Self {
        Self {
            model_name: default_model_name(),
            num_freq: 161,
            num_classes: 29,
            num_filters: 32,
            num_hidden: 1760,
            num_rnn_layers: 7,
            batch_size: 32,
            use_fp16: false,
            engine: Engine::Custom,
            conv1: ConvDescriptor::conv1_default(),
            conv2: ConvDescriptor::conv2_default(),
            relu_cap: default_relu_cap(),
            weight_decay: None,
            batch_norm_eps: default_bn_eps(),
            batch_norm_momentum: default_bn_momentum(),
        }
    }

    /// Загрузить конфигурацию из JSON и проверить её.
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Точность весов и активаций.
    pub fn precision(&self) -> Precision {
        Precision::from_fp16_flag(self.use_fp16)
    }

    /// Ширина по частоте после обоих свёрточных блоков.
    pub fn freq_out(&self) -> usize {
        self.conv2.freq_out(self.conv1.freq_out(self.num_freq))
    }

    /// Размер входа первого RNN-слоя: channels × freq.
    pub fn rnn_input_size(&self) -> usize {
        self.num_filters * self.freq_out()
    }

    /// Размер выхода RNN-стека (конкатенация прямого и обратного проходов).
    pub fn rnn_output_size(&self) -> usize {
        2 * self.num_hidden
    }

    /// Пересчёт длин для обоих свёрточных блоков.
    pub fn length_transformer(&self) -> SequenceLengthTransformer {
        SequenceLengthTransformer::new(&[self.conv1, self.conv2])
    }

    /// Минимальная длина батча по времени, дающая хотя бы один выходной фрейм.
    pub fn min_input_frames(&self) -> usize {
        self.conv1.kernel_time + (self.conv2.kernel_time - 1) * self.conv1.stride_time
    }

    /// Индекс blank-класса (последний класс).
    pub fn blank_id(&self) -> u32 {
        (self.num_classes - 1) as u32
    }

    /// Проверить все размерностные контракты.
    pub fn validate(&self) -> AsrResult<()> {
        self.conv1.validate("conv1")?;
        self.conv2.validate("conv2")?;
        if self.num_filters == 0 {
            return Err(AsrError::Config("num_filters должен быть > 0".into()));
        }
        if self.num_hidden == 0 {
            return Err(AsrError::Config("num_hidden должен быть > 0".into()));
        }
        if self.num_rnn_layers == 0 {
            return Err(AsrError::Config("num_rnn_layers должен быть > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(AsrError::Config("batch_size должен быть > 0".into()));
        }
        if self.num_classes < 2 {
            return Err(AsrError::Config(format!(
                "num_classes={}: нужен хотя бы один символ и blank",
                self.num_classes
            )));
        }
        if self.freq_out() == 0 {
            return Err(AsrError::Config(format!(
                "num_freq={} слишком мал для ядер по частоте {} и {}",
                self.num_freq, self.conv1.kernel_freq, self.conv2.kernel_freq
            )));
        }
        if !(self.relu_cap > 0.0) {
            return Err(AsrError::Config(format!("relu_cap={} должен быть > 0", self.relu_cap)));
        }
        if let Some(wd) = self.weight_decay {
            if wd < 0.0 {
                return Err(AsrError::Config(format!("weight_decay={wd} < 0")));
            }
        }
        Ok(())
    }
}
