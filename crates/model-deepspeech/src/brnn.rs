//! Стек двунаправленных RNN-слоёв с маскированием по длинам.
//!
//! Каждый слой держит две независимые ячейки (прямую и обратную) одного
//! размера и точности; выходы направлений конкатенируются по признакам.
//! Для каждого примера:
//!
//! - прямая ячейка перестаёт обновлять состояние после его длины;
//! - обратная ячейка начинает с нулевого состояния в его последнем
//!   валидном фрейме и не видит дополнение;
//! - выходы на дополненных шагах равны нулю.

use asr_core::{AsrError, AsrResult, ExecutionContext};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use tracing::{debug, info};

use crate::cell::{create_cell, resolve_engine, RnnCell};
use crate::config::{DeepSpeechConfig, Engine};
use crate::seqlen::time_major_mask;

/// Направление прохода.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Маскированный проход одной ячейки.
///
/// `xs`: (time, batch, input), `mask`: (time, batch, 1) u8.
/// Возвращает (time, batch, hidden) в точности ячейки.
fn masked_scan(cell: &dyn RnnCell, xs: &Tensor, mask: &Tensor, direction: Direction) -> Result<Tensor> {
    let prepared = cell.prepare(xs)?;
    let time = prepared.time()?;
    let mut state = prepared.zero_state()?;
    let zeros = state.zeros_like()?;
    let mut outputs: Vec<Option<Tensor>> = vec![None; time];

    let order: Box<dyn Iterator<Item = usize>> = match direction {
        Direction::Forward => Box::new(0..time),
        Direction::Backward => Box::new((0..time).rev()),
    };
    for t in order {
        let valid = mask.get(t)?.broadcast_as(state.shape())?;
        let h = prepared.step(t, &state)?;
        // where_cond, а не умножение на маску: NaN/inf из дополнения не протекают.
        state = valid.where_cond(&h, &state)?;
        outputs[t] = Some(valid.where_cond(&h, &zeros)?);
    }

    let outputs: Vec<Tensor> = outputs.into_iter().flatten().collect();
    Tensor::stack(&outputs, 0)?.to_dtype(cell.precision().dtype())
}

/// Один двунаправленный слой.
pub struct BidirectionalLayer {
    fw: Box<dyn RnnCell>,
    bw: Box<dyn RnnCell>,
}

impl BidirectionalLayer {
    /// (time, batch, input) → (time, batch, 2·hidden)
    pub fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let fw = masked_scan(self.fw.as_ref(), xs, mask, Direction::Forward)?;
        let bw = masked_scan(self.bw.as_ref(), xs, mask, Direction::Backward)?;
        Tensor::cat(&[&fw, &bw], 2)
    }

    pub fn input_size(&self) -> usize {
        self.fw.input_size()
    }

    pub fn output_size(&self) -> usize {
        self.fw.hidden_size() + self.bw.hidden_size()
    }
}

/// Стек из `num_rnn_layers` двунаправленных слоёв.
pub struct BidirectionalStack {
    layers: Vec<BidirectionalLayer>,
    engine: Engine,
}

impl BidirectionalStack {
    /// Построить стек. Каждый слой получает собственные веса
    /// (`brnn-{i}.fw.*`, `brnn-{i}.bw.*`).
    pub fn load(config: &DeepSpeechConfig, ctx: &ExecutionContext, vb: VarBuilder) -> AsrResult<Self> {
        let engine = resolve_engine(config.engine, ctx);
        let precision = config.precision();
        let hidden = config.num_hidden;

        let mut layers = Vec::with_capacity(config.num_rnn_layers);
        let mut input_size = config.rnn_input_size();
        for i in 0..config.num_rnn_layers {
            let layer_vb = vb.pp(format!("brnn-{i}"));
            let fw = create_cell(engine, ctx, hidden, input_size, precision, config.relu_cap, layer_vb.pp("fw"))?;
            let bw = create_cell(engine, ctx, hidden, input_size, precision, config.relu_cap, layer_vb.pp("bw"))?;
            let layer = BidirectionalLayer { fw, bw };
            debug!("brnn-{i}: {} → {}", layer.input_size(), layer.output_size());
            input_size = layer.output_size();
            layers.push(layer);
        }

        info!(
            "RNN: {} двунаправленных слоёв, hidden={}, engine={}, {:?}",
            layers.len(),
            hidden,
            engine,
            precision
        );
        Ok(Self { layers, engine })
    }

    /// Фактически используемая реализация ячеек (после возможного отката).
    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Размер входа первого слоя.
    pub fn input_size(&self) -> usize {
        self.layers.first().map(|l| l.input_size()).unwrap_or(0)
    }

    /// Размер выхода последнего слоя.
    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.output_size()).unwrap_or(0)
    }

    /// Прямой проход.
    ///
    /// `xs`: (time, batch, input), `lengths`: длины после свёрток.
    pub fn forward(&self, xs: &Tensor, lengths: &[usize]) -> AsrResult<Tensor> {
        let (time, batch, width) = xs.dims3()?;
        if width != self.input_size() {
            return Err(AsrError::Inference(format!(
                "ширина входа RNN {width} ≠ input_size первого слоя {}",
                self.input_size()
            )));
        }
        if lengths.len() != batch {
            return Err(AsrError::Inference(format!(
                "длин {} на батч из {batch} примеров",
                lengths.len()
            )));
        }
        if let Some(&len) = lengths.iter().find(|&&l| l > time) {
            return Err(AsrError::Inference(format!(
                "длина {len} больше числа фреймов {time}"
            )));
        }

        let mask = time_major_mask(lengths, time, xs.device())?;
        let mut h = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h, &mask)?;
            asr_core::debug::activation_summary(&format!("brnn-{i}"), &h);
        }
        Ok(h)
    }
}
