//! # model-deepspeech
//!
//! Акустическая модель в стиле DeepSpeech2 на Candle.
//!
//! Признаки (batch, time, freq) проходят два свёрточных блока
//! Conv2d → BatchNorm → clipped ReLU, затем стек двунаправленных RNN с
//! маскированием по длинам и линейную голову. На выходе логиты
//! (time, batch, num_classes), к которым применяется CTC-потеря.
//!
//! Длины примеров пересчитываются через каждую свёртку
//! ([`SequenceLengthTransformer`]), чтобы дополнение не влияло ни на
//! RNN, ни на потерю.
//!
//! ## Пример
//!
//! ```rust,ignore
//! use asr_core::ExecutionContext;
//! use model_deepspeech::{DeepSpeech, DeepSpeechConfig, FeatureBatch};
//!
//! let ctx = ExecutionContext::cpu();
//! let config = DeepSpeechConfig::librispeech();
//! let (model, losses, _varmap) = DeepSpeech::with_varmap(&config, &ctx)?;
//! let batch = FeatureBatch::synthetic(&config, 2, 200, 0, ctx.device())?;
//! let logits = model.forward_t(&batch.features, &batch.seq_lens, true)?;
//! let loss = model.loss(&logits, &batch.labels, &batch.seq_lens, &losses)?;
//! loss.backward()?;
//! ```

pub mod brnn;
pub mod cell;
pub mod config;
pub mod conv;
pub mod ctc;
pub mod head;
pub mod input;
pub mod losses;
pub mod model;
pub mod seqlen;

pub use brnn::BidirectionalStack;
pub use cell::{create_cell, resolve_engine, CustomRnnCell, RnnCell};
#[cfg(feature = "fused-rnn")]
pub use cell::FusedRnnCell;
pub use config::{ConvDescriptor, DeepSpeechConfig, Engine, Padding, Precision};
pub use ctc::{collapse_repeated, greedy_decode, CtcLoss};
pub use input::FeatureBatch;
pub use losses::LossCollection;
pub use model::{inference, loss, DeepSpeech};
pub use seqlen::{conv_output_length, SequenceLengthTransformer};
