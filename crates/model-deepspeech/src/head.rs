//! Линейная голова: проекция выхода RNN на логиты классов.
//!
//! Без активации; нормализация по классам выполняется в CTC-потере.

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::losses::LossCollection;

/// Affine-проекция, одинаковая на всех шагах.
pub struct ProjectionHead {
    /// (num_classes, input_size)
    weight: Tensor,
    /// (num_classes)
    bias: Tensor,
    num_classes: usize,
}

impl ProjectionHead {
    pub fn load(
        input_size: usize,
        num_classes: usize,
        wd: Option<f64>,
        losses: &mut LossCollection,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bound = 1.0 / (input_size as f64).sqrt();
        let weight = vb.get_with_hints(
            (num_classes, input_size),
            "weights",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.get_with_hints(num_classes, "biases", Init::Const(0.0))?;
        losses.register(format!("{}.weights", vb.prefix()), &weight, wd);
        Ok(Self {
            weight,
            bias,
            num_classes,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// (time, batch, hidden) → (time, batch, num_classes)
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (t, b, d) = xs.dims3()?;
        let weight = self.weight.to_dtype(xs.dtype())?;
        let bias = self.bias.to_dtype(xs.dtype())?;
        xs.reshape((t * b, d))?
            .matmul(&weight.t()?)?
            .broadcast_add(&bias)?
            .reshape((t, b, self.num_classes))
    }
}
