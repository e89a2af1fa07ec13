//! Контекст исполнения: устройство candle и проверка его возможностей.
//!
//! Контекст нужен только fused-реализации рекуррентной ячейки, которая
//! размещает склеенные веса на устройстве и должна заранее убедиться,
//! что устройство умеет выполнять нужные GEMM. Обычная ячейка его
//! игнорирует.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::{AsrError, AsrResult};

/// Активная вычислительная сессия (устройство + кэш результатов проб).
#[derive(Debug)]
pub struct ExecutionContext {
    device: Device,
    probe: OnceLock<bool>,
}

impl Clone for ExecutionContext {
    fn clone(&self) -> Self {
        let probe = OnceLock::new();
        if let Some(&ok) = self.probe.get() {
            let _ = probe.set(ok);
        }
        Self {
            device: self.device.clone(),
            probe,
        }
    }
}

impl ExecutionContext {
    /// Контекст поверх уже созданного устройства.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            probe: OnceLock::new(),
        }
    }

    /// Контекст для CPU.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    /// Создать контекст по имени устройства (`cpu`, `cuda`, `metal`).
    pub fn from_name(name: &str) -> AsrResult<Self> {
        let device = match name {
            "cpu" => Device::Cpu,
            "cuda" => Device::new_cuda(0)
                .map_err(|e| AsrError::Device(format!("CUDA недоступна: {e}")))?,
            "metal" => {
                // candle может panic при инициализации Metal.
                let prev_hook = std::panic::take_hook();
                std::panic::set_hook(Box::new(|_| {}));
                let res = std::panic::catch_unwind(|| Device::new_metal(0));
                std::panic::set_hook(prev_hook);
                match res {
                    Ok(Ok(dev)) => dev,
                    Ok(Err(e)) => {
                        return Err(AsrError::Device(format!("Metal недоступен: {e}")));
                    }
                    Err(_) => {
                        return Err(AsrError::Device(
                            "Panic при инициализации Metal. Используйте cpu.".into(),
                        ));
                    }
                }
            }
            other => {
                return Err(AsrError::Device(format!(
                    "Неизвестное устройство '{other}' (ожидается cpu, cuda или metal)"
                )));
            }
        };
        info!("ExecutionContext: устройство {:?}", device);
        Ok(Self::new(device))
    }

    /// Устройство, на котором создаются веса и тензоры.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Барьер: дождаться завершения всех pending-операций устройства.
    ///
    /// На CPU ничего не делает.
    pub fn synchronize(&self) -> AsrResult<()> {
        if !self.device.is_cpu() {
            self.device
                .synchronize()
                .map_err(|e| AsrError::Device(format!("synchronize failed: {e}")))?;
        }
        Ok(())
    }

    /// Пробное вычисление: GEMM в F32 и F16, заполнение нулями, readback.
    pub fn probe(&self) -> AsrResult<()> {
        let device = &self.device;
        for dtype in [DType::F32, DType::F16] {
            let a = Tensor::ones((8, 16), dtype, device)?;
            let b = Tensor::ones((16, 8), dtype, device)?;
            let c = a.matmul(&b).map_err(|e| {
                AsrError::Device(format!("probe: matmul {dtype:?} failed: {e}"))
            })?;
            self.synchronize()?;
            let c: Vec<Vec<f32>> = c.to_dtype(DType::F32)?.to_vec2()?;
            if (c[0][0] - 16.0).abs() > 1e-3 {
                return Err(AsrError::Device(format!(
                    "probe: неверный результат matmul {dtype:?}: {}",
                    c[0][0]
                )));
            }
        }
        let z = Tensor::zeros((8, 8), DType::F32, device)?;
        self.synchronize()?;
        let _z: Vec<Vec<f32>> = z.to_vec2()?;
        debug!("ExecutionContext: проба {:?} успешна", device);
        Ok(())
    }

    /// Доступна ли fused-реализация RNN-ячейки.
    ///
    /// Требует feature `fused-rnn` и успешной пробы устройства.
    /// Результат пробы кэшируется.
    pub fn fused_rnn_available(&self) -> bool {
        if !cfg!(feature = "fused-rnn") {
            return false;
        }
        *self.probe.get_or_init(|| match self.probe() {
            Ok(()) => true,
            Err(e) => {
                warn!("ExecutionContext: проба устройства провалилась: {e}");
                false
            }
        })
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_probe() {
        let ctx = ExecutionContext::cpu();
        assert!(ctx.device().is_cpu());
        ctx.probe().unwrap();
        ctx.synchronize().unwrap();
    }

    #[test]
    fn test_fused_availability_follows_feature() {
        let ctx = ExecutionContext::cpu();
        assert_eq!(ctx.fused_rnn_available(), cfg!(feature = "fused-rnn"));
    }

    #[test]
    fn test_unknown_device_name() {
        let err = ExecutionContext::from_name("tpu").unwrap_err();
        assert!(matches!(err, AsrError::Device(_)));
    }
}
