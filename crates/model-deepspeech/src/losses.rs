//! Накопитель слагаемых полной функции потерь.
//!
//! Слои с регуляризуемыми весами регистрируют здесь свои веса при
//! построении модели. Штраф вычисляется лениво при каждом вызове
//! [`LossCollection::penalty`], поэтому отражает текущие значения весов
//! после шагов оптимизатора.

use candle_core::{DType, Result, Tensor};
use tracing::debug;

/// Слагаемое weight decay: `wd · Σw² / 2`.
#[derive(Debug, Clone)]
struct DecayTerm {
    name: String,
    weight: Tensor,
    wd: f64,
}

/// Явный аккумулятор штрафов, возвращаемый вместе с моделью.
#[derive(Debug, Clone, Default)]
pub struct LossCollection {
    terms: Vec<DecayTerm>,
}

impl LossCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Зарегистрировать вес. При `wd = None` ничего не добавляется.
    pub fn register(&mut self, name: impl Into<String>, weight: &Tensor, wd: Option<f64>) {
        if let Some(wd) = wd {
            let name = name.into();
            debug!("weight decay: {name} (wd={wd})");
            self.terms.push(DecayTerm {
                name,
                weight: weight.clone(),
                wd,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Имена зарегистрированных весов.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|t| t.name.as_str())
    }

    /// Сумма всех штрафов (скаляр F32); `None`, если штрафов нет.
    pub fn penalty(&self) -> Result<Option<Tensor>> {
        let mut total: Option<Tensor> = None;
        for term in &self.terms {
            let l2 = term.weight.to_dtype(DType::F32)?.sqr()?.sum_all()?;
            let value = (l2 * (term.wd * 0.5))?;
            total = Some(match total {
                Some(acc) => (acc + value)?,
                None => value,
            });
        }
        Ok(total)
    }

    /// Полная потеря: `data_loss` плюс все штрафы.
    pub fn total(&self, data_loss: &Tensor) -> Result<Tensor> {
        match self.penalty()? {
            Some(p) => data_loss.to_dtype(DType::F32)? + p,
            None => data_loss.to_dtype(DType::F32),
        }
    }
}
