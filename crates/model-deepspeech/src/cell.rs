//! Рекуррентные ячейки.
//!
//! Обе реализации выполняют один и тот же контракт
//! `h' = relux(W·x + U·h + b, cap)` для заданных `(hidden_size, input_size,
//! precision)` и взаимозаменяемы в стеке:
//!
//! - [`CustomRnnCell`]: веса `W`, `U`, `B` в точности слоя, доступна всегда;
//! - [`FusedRnnCell`]: склеенное ядро `[W | U]`, накопление в F32; требует
//!   feature `fused-rnn` и [`ExecutionContext`] с поддержкой устройства.

use asr_core::{AsrError, AsrResult, ExecutionContext};
use candle_core::{DType, Result, Tensor};
use candle_nn::{Init, VarBuilder};
use tracing::warn;

use crate::config::{Engine, Precision};
use crate::conv::relux;

/// Равномерная инициализация `U(-1/√H, 1/√H)`.
fn rnn_init(hidden_size: usize) -> Init {
    let bound = 1.0 / (hidden_size as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Подготовленная к сканированию последовательность.
///
/// Входной вклад `W·x + b` посчитан для всех шагов одним GEMM;
/// на шаге остаётся только рекуррентная часть.
pub struct PreparedInputs {
    /// (time, batch, hidden)
    projected: Tensor,
    /// Uᵀ: (hidden, hidden)
    recurrent: Tensor,
    cap: f64,
}

impl PreparedInputs {
    pub fn time(&self) -> Result<usize> {
        self.projected.dim(0)
    }

    /// Тип накопления состояния.
    pub fn dtype(&self) -> DType {
        self.projected.dtype()
    }

    /// Нулевое начальное состояние (batch, hidden).
    pub fn zero_state(&self) -> Result<Tensor> {
        let (_t, b, h) = self.projected.dims3()?;
        Tensor::zeros((b, h), self.projected.dtype(), self.projected.device())
    }

    /// Шаг `t`: новое состояние по предыдущему.
    pub fn step(&self, t: usize, state: &Tensor) -> Result<Tensor> {
        let pre = self.projected.get(t)?.add(&state.matmul(&self.recurrent)?)?;
        relux(&pre, self.cap)
    }
}

/// Контракт рекуррентной ячейки.
pub trait RnnCell: Send + Sync {
    fn hidden_size(&self) -> usize;

    fn input_size(&self) -> usize;

    fn precision(&self) -> Precision;

    /// Подготовить последовательность (time, batch, input_size).
    fn prepare(&self, xs: &Tensor) -> Result<PreparedInputs>;

    /// Один шаг: (state, input) → (state, output).
    ///
    /// `input`: (batch, input_size), `state`: (batch, hidden_size).
    fn step(&self, state: &Tensor, input: &Tensor) -> Result<(Tensor, Tensor)> {
        let prepared = self.prepare(&input.unsqueeze(0)?)?;
        let state = state.to_dtype(prepared.dtype())?;
        let h = prepared.step(0, &state)?;
        Ok((h.clone(), h))
    }
}

/// Проекция (time, batch, in) × (out, in)ᵀ + b → (time, batch, out).
fn project(xs: &Tensor, weight_t: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let (t, b, d) = xs.dims3()?;
    let out = weight_t.dim(1)?;
    xs.reshape((t * b, d))?
        .matmul(weight_t)?
        .broadcast_add(bias)?
        .reshape((t, b, out))
}

// -----------------------------------------------------------------------
// Custom cell
// -----------------------------------------------------------------------

/// Лёгкая ячейка: `h' = relux(x·Wᵀ + h·Uᵀ + B)`.
pub struct CustomRnnCell {
    /// (hidden, input)
    w: Tensor,
    /// (hidden, hidden)
    u: Tensor,
    /// (hidden)
    b: Tensor,
    hidden_size: usize,
    input_size: usize,
    precision: Precision,
    cap: f64,
}

impl CustomRnnCell {
    pub fn load(
        hidden_size: usize,
        input_size: usize,
        precision: Precision,
        cap: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.set_dtype(precision.dtype());
        let init = rnn_init(hidden_size);
        let w = vb.get_with_hints((hidden_size, input_size), "W", init)?;
        let u = vb.get_with_hints((hidden_size, hidden_size), "U", init)?;
        let b = vb.get_with_hints(hidden_size, "B", Init::Const(0.0))?;
        Ok(Self {
            w,
            u,
            b,
            hidden_size,
            input_size,
            precision,
            cap,
        })
    }
}

impl RnnCell for CustomRnnCell {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn prepare(&self, xs: &Tensor) -> Result<PreparedInputs> {
        let xs = xs.to_dtype(self.precision.dtype())?;
        let projected = project(&xs, &self.w.t()?, &self.b)?;
        Ok(PreparedInputs {
            projected,
            recurrent: self.u.t()?,
            cap: self.cap,
        })
    }
}

// -----------------------------------------------------------------------
// Fused cell
// -----------------------------------------------------------------------

/// Fused-ячейка: одно ядро `[W | U]` формы (hidden, input + hidden).
///
/// Веса хранятся в точности слоя, вычисления идут в F32; выход
/// приводится к точности слоя стеком.
#[cfg(feature = "fused-rnn")]
pub struct FusedRnnCell {
    /// (hidden, input + hidden)
    kernel: Tensor,
    /// (hidden)
    bias: Tensor,
    hidden_size: usize,
    input_size: usize,
    precision: Precision,
    cap: f64,
}

#[cfg(feature = "fused-rnn")]
impl FusedRnnCell {
    pub fn load(
        ctx: &ExecutionContext,
        hidden_size: usize,
        input_size: usize,
        precision: Precision,
        cap: f64,
        vb: VarBuilder,
    ) -> AsrResult<Self> {
        if !ctx.fused_rnn_available() {
            return Err(AsrError::Unsupported(format!(
                "fused RNN недоступна на {:?}",
                ctx.device()
            )));
        }
        if !ctx.device().same_device(vb.device()) {
            return Err(AsrError::Device(format!(
                "веса на {:?}, а контекст на {:?}",
                vb.device(),
                ctx.device()
            )));
        }
        let vb = vb.set_dtype(precision.dtype());
        let kernel = vb.get_with_hints(
            (hidden_size, input_size + hidden_size),
            "kernel",
            rnn_init(hidden_size),
        )?;
        let bias = vb.get_with_hints(hidden_size, "bias", Init::Const(0.0))?;
        Ok(Self {
            kernel,
            bias,
            hidden_size,
            input_size,
            precision,
            cap,
        })
    }
}

#[cfg(feature = "fused-rnn")]
impl RnnCell for FusedRnnCell {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn prepare(&self, xs: &Tensor) -> Result<PreparedInputs> {
        let kernel = self.kernel.to_dtype(DType::F32)?;
        let w = kernel.narrow(1, 0, self.input_size)?.contiguous()?;
        let u = kernel
            .narrow(1, self.input_size, self.hidden_size)?
            .contiguous()?;
        let bias = self.bias.to_dtype(DType::F32)?;
        let projected = project(&xs.to_dtype(DType::F32)?, &w.t()?, &bias)?;
        Ok(PreparedInputs {
            projected,
            recurrent: u.t()?,
            cap: self.cap,
        })
    }
}

// -----------------------------------------------------------------------
// Factory
// -----------------------------------------------------------------------

/// Выбрать реализацию для всего стека.
///
/// Если fused-ячейка запрошена, но недоступна, пишется предупреждение и идёт
/// откат на [`Engine::Custom`].
pub fn resolve_engine(requested: Engine, ctx: &ExecutionContext) -> Engine {
    match requested {
        Engine::Custom => Engine::Custom,
        Engine::Fused if cfg!(feature = "fused-rnn") && ctx.fused_rnn_available() => Engine::Fused,
        Engine::Fused => {
            warn!(
                "RNN: движок 'fused' недоступен в этой сборке или на {:?}, используется 'custom'",
                ctx.device()
            );
            Engine::Custom
        }
    }
}

/// Создать одну ячейку выбранной реализации.
///
/// Контекст используется только fused-ячейкой.
pub fn create_cell(
    engine: Engine,
    ctx: &ExecutionContext,
    hidden_size: usize,
    input_size: usize,
    precision: Precision,
    cap: f64,
    vb: VarBuilder,
) -> AsrResult<Box<dyn RnnCell>> {
    match engine {
        Engine::Custom => Ok(Box::new(CustomRnnCell::load(
            hidden_size,
            input_size,
            precision,
            cap,
            vb,
        )?)),
        #[cfg(feature = "fused-rnn")]
        Engine::Fused => {
            let cell = FusedRnnCell::load(ctx, hidden_size, input_size, precision, cap, vb)?;
            tracing::info!("RNN: fused-ячейка {input_size}→{hidden_size} ({precision:?})");
            Ok(Box::new(cell))
        }
        #[cfg(not(feature = "fused-rnn"))]
        Engine::Fused => {
            let _ = ctx;
            Err(AsrError::Unsupported(
                "fused RNN не скомпилирована. Включите feature 'fused-rnn'.".into(),
            ))
        }
    }
}
