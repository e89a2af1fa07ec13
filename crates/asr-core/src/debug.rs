//! Вспомогательные функции для отладочного вывода.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use tracing::debug;

/// Возвращает `true`, если включен подробный отладочный вывод.
///
/// Управляется переменной окружения `RUSTASR_DEBUG` (любое непустое значение).
pub fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("RUSTASR_DEBUG").is_some())
}

/// Сводка по активациям: форма, min, max.
///
/// Пишется в `debug!` только при включённом [`enabled`], чтобы не тратить
/// время на редукции в обычном режиме.
pub fn activation_summary(name: &str, x: &Tensor) {
    if !enabled() {
        return;
    }
    let stats = x
        .to_dtype(DType::F32)
        .and_then(|x| x.flatten_all())
        .and_then(|flat| {
            let min = flat.min(0)?.to_scalar::<f32>()?;
            let max = flat.max(0)?.to_scalar::<f32>()?;
            Ok((min, max))
        });
    match stats {
        Ok((min, max)) => debug!("{name}: {:?}, [{min:.4}, {max:.4}]", x.shape()),
        Err(e) => debug!("{name}: {:?}, статистика недоступна: {e}", x.shape()),
    }
}
