//! # asr-core
//!
//! Базовые типы для workspace DeepSpeech:
//!
//! - Унифицированная обработка ошибок через [`AsrError`]
//! - Контекст исполнения [`ExecutionContext`] (устройство + проверка возможностей)
//! - Переключатель подробного отладочного вывода ([`debug::enabled`])

pub mod context;
pub mod debug;
pub mod error;

pub use context::ExecutionContext;
pub use error::{AsrError, AsrResult};
