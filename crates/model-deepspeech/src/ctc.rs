//! CTC-потеря и greedy-декодирование.
//!
//! Потеря считается в лог-пространстве прямой (alpha) рекурсией по
//! расширенной метке `blank, l1, blank, l2, ..., blank` целиком на операциях
//! candle, поэтому `backward()` даёт градиенты по логитам.
//!
//! - Blank является последним классом.
//! - Примеры с длиной 0 дают 0 и в потерю, и в градиент.
//! - Примеры, метку которых нельзя уложить в доступные фреймы, тоже дают 0
//!   (с предупреждением).

use asr_core::{AsrError, AsrResult};
use candle_core::{DType, Device, Result, Tensor, D};
use tracing::{debug, warn};

/// Конечная замена `-inf`: не даёт NaN в `exp(x - max)` и градиентах.
const NEG_INF: f32 = -1e30;

/// Склеить соседние повторы: `[1, 1, 2, 2, 1]` → `[1, 2, 1]`.
pub fn collapse_repeated(labels: &[u32]) -> Vec<u32> {
    let mut out = labels.to_vec();
    out.dedup();
    out
}

/// Минимальное число фреймов для метки: по фрейму на символ плюс
/// обязательный blank между одинаковыми соседями.
fn required_frames(labels: &[u32]) -> usize {
    let repeats = labels.windows(2).filter(|w| w[0] == w[1]).count();
    labels.len() + repeats
}

/// logsumexp по оси 0 для (k, S) → (S). Максимум отсоединён от графа.
fn log_sum_exp(stacked: &Tensor) -> Result<Tensor> {
    let max = stacked.max_keepdim(0)?.detach();
    let sum = stacked.broadcast_sub(&max)?.exp()?.sum_keepdim(0)?;
    (sum.log()? + max)?.squeeze(0)
}

/// Сдвиг вправо на `k` позиций с заполнением `NEG_INF`.
fn shift_right(alpha: &Tensor, k: usize, neg: &Tensor) -> Result<Tensor> {
    let s = alpha.dim(0)?;
    if k >= s {
        return Ok(neg.clone());
    }
    Tensor::cat(&[&neg.narrow(0, 0, k)?, &alpha.narrow(0, 0, s - k)?], 0)
}

/// Connectionist Temporal Classification.
#[derive(Debug, Clone, Copy)]
pub struct CtcLoss {
    /// Индекс blank-класса.
    pub blank: u32,
    /// Склеивать соседние повторы в метке перед расширением.
    pub collapse_repeated: bool,
}

impl CtcLoss {
    pub fn new(blank: u32) -> Self {
        Self {
            blank,
            collapse_repeated: true,
        }
    }

    /// Среднее по батчу значение потери (скаляр F32).
    ///
    /// `logits`: (time, batch, num_classes), `labels`: метка на пример,
    /// `lengths`: длины после свёрток.
    pub fn forward(&self, logits: &Tensor, labels: &[Vec<u32>], lengths: &[usize]) -> AsrResult<Tensor> {
        let (time, batch, classes) = logits.dims3()?;
        if labels.len() != batch || lengths.len() != batch {
            return Err(AsrError::Inference(format!(
                "CTC: батч {batch}, меток {}, длин {}",
                labels.len(),
                lengths.len()
            )));
        }
        if self.blank as usize >= classes {
            return Err(AsrError::Inference(format!(
                "CTC: blank={} вне диапазона {classes} классов",
                self.blank
            )));
        }
        for (b, label) in labels.iter().enumerate() {
            if let Some(&bad) = label.iter().find(|&&l| l as usize >= classes || l == self.blank) {
                return Err(AsrError::Inference(format!(
                    "CTC: недопустимый символ {bad} в метке примера {b}"
                )));
            }
        }

        let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
        let mut costs = Vec::with_capacity(batch);
        for b in 0..batch {
            let len = lengths[b].min(time);
            if len == 0 {
                debug!("CTC: пример {b} без фреймов, вклад 0");
                continue;
            }
            let target = if self.collapse_repeated {
                collapse_repeated(&labels[b])
            } else {
                labels[b].clone()
            };
            let need = required_frames(&target);
            if len < need {
                warn!("CTC: пример {b}: метке нужно {need} фреймов, доступно {len}; вклад 0");
                continue;
            }
            // index_select требует непрерывный тензор, а срез по батчу им не является.
            let emissions = log_probs
                .narrow(0, 0, len)?
                .narrow(1, b, 1)?
                .squeeze(1)?
                .contiguous()?;
            costs.push(self.sequence_cost(&emissions, &target)?);
        }

        let device = logits.device();
        if costs.is_empty() {
            return Ok(Tensor::zeros((), DType::F32, device)?);
        }
        let total = Tensor::stack(&costs, 0)?.sum_all()?;
        Ok((total / batch as f64)?)
    }

    /// `-log p(target | emissions)` для одного примера.
    ///
    /// `emissions`: (len, num_classes) лог-вероятности.
    fn sequence_cost(&self, emissions: &Tensor, target: &[u32]) -> Result<Tensor> {
        let device = emissions.device();
        let mut ext = Vec::with_capacity(2 * target.len() + 1);
        ext.push(self.blank);
        for &l in target {
            ext.push(l);
            ext.push(self.blank);
        }
        let s = ext.len();
        let len = emissions.dim(0)?;

        // (len, S): лог-вероятность символа расширенной метки на каждом шаге.
        let ext_idx = Tensor::from_vec(ext.clone(), s, device)?;
        let em = emissions.index_select(&ext_idx, 1)?;

        let neg = Tensor::full(NEG_INF, s, device)?;
        let skip_allowed = skip_mask(&ext, self.blank, device)?;
        let start = start_mask(s, device)?;

        let mut alpha = start.where_cond(&em.get(0)?, &neg)?;
        for t in 1..len {
            let stay = alpha.clone();
            let step = shift_right(&alpha, 1, &neg)?;
            let skip = skip_allowed.where_cond(&shift_right(&alpha, 2, &neg)?, &neg)?;
            let prev = log_sum_exp(&Tensor::stack(&[&stay, &step, &skip], 0)?)?;
            alpha = (prev + em.get(t)?)?;
        }

        let log_likelihood = if s == 1 {
            alpha.squeeze(0)?
        } else {
            log_sum_exp(&alpha.narrow(0, s - 2, 2)?.unsqueeze(1)?)?.squeeze(0)?
        };
        log_likelihood.neg()
    }
}

/// Допустимые стартовые позиции: первый blank и первый символ.
fn start_mask(s: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = (0..s).map(|i| u8::from(i < 2)).collect();
    Tensor::from_vec(data, s, device)
}

/// Переход `s-2 → s` разрешён, если `ext[s]` не blank и не равен `ext[s-2]`.
fn skip_mask(ext: &[u32], blank: u32, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = (0..ext.len())
        .map(|i| u8::from(i >= 2 && ext[i] != blank && ext[i] != ext[i - 2]))
        .collect();
    Tensor::from_vec(data, ext.len(), device)
}

/// Greedy-декодирование: argmax на валидных фреймах, удаление повторов и blank.
///
/// `logits`: (time, batch, num_classes). Возвращает метку на пример.
pub fn greedy_decode(logits: &Tensor, lengths: &[usize], blank: u32) -> Result<Vec<Vec<u32>>> {
    let (time, batch, _c) = logits.dims3()?;
    let predictions: Vec<Vec<u32>> = logits.argmax(D::Minus1)?.to_vec2()?;

    let mut decoded = Vec::with_capacity(batch);
    for b in 0..batch {
        let len = lengths.get(b).copied().unwrap_or(0).min(time);
        let mut ids = Vec::new();
        let mut prev = blank;
        for row in predictions.iter().take(len) {
            let tok = row[b];
            if tok != blank && tok != prev {
                ids.push(tok);
            }
            prev = tok;
        }
        decoded.push(ids);
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    const T: usize = 4;
    const C: usize = 4;
    const BLANK: u32 = 3;

    /// Детерминированные логиты (T, 1, C).
    fn logits_single() -> Tensor {
        let data: Vec<f32> = (0..T * C).map(|i| ((i * 7 % 11) as f32) * 0.3 - 1.0).collect();
        Tensor::from_vec(data, (T, 1, C), &Device::Cpu).unwrap()
    }

    /// Схлопывание пути CTC: склеить повторы, убрать blank.
    fn path_to_label(path: &[u32]) -> Vec<u32> {
        let mut out = collapse_repeated(path);
        out.retain(|&c| c != BLANK);
        out
    }

    /// Полный перебор всех C^T путей.
    fn brute_force_cost(logits: &Tensor, target: &[u32]) -> f64 {
        let lp = candle_nn::ops::log_softmax(logits, D::Minus1)
            .unwrap()
            .squeeze(1)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let mut total = 0f64;
        for code in 0..C.pow(T as u32) {
            let mut rest = code;
            let mut path = Vec::with_capacity(T);
            for _ in 0..T {
                path.push((rest % C) as u32);
                rest /= C;
            }
            if path_to_label(&path) == target {
                let logp: f64 = path
                    .iter()
                    .enumerate()
                    .map(|(t, &c)| lp[t][c as usize] as f64)
                    .sum();
                total += logp.exp();
            }
        }
        -total.ln()
    }

    fn cost(loss: CtcLoss, logits: &Tensor, label: &[u32]) -> f64 {
        loss.forward(logits, &[label.to_vec()], &[T])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap() as f64
    }

    #[test]
    fn test_collapse_repeated() {
        assert_eq!(collapse_repeated(&[1, 1, 2]), vec![1, 2]);
        assert_eq!(collapse_repeated(&[1, 2, 1]), vec![1, 2, 1]);
        assert_eq!(collapse_repeated(&[]), Vec::<u32>::new());
    }

    #[test]
    fn test_matches_brute_force() {
        let logits = logits_single();
        let loss = CtcLoss {
            blank: BLANK,
            collapse_repeated: false,
        };
        for label in [vec![1u32, 2], vec![0], vec![1, 2, 1], vec![1, 1], vec![]] {
            let expected = brute_force_cost(&logits, &label);
            let got = cost(loss, &logits, &label);
            assert!((got - expected).abs() < 1e-4, "{label:?}: {got} vs {expected}");
        }
    }

    #[test]
    fn test_adjacent_repeats_collapse() {
        let logits = logits_single();
        let loss = CtcLoss::new(BLANK);
        let a = cost(loss, &logits, &[1, 1, 2]);
        let b = cost(loss, &logits, &[1, 2]);
        assert!((a - b).abs() < 1e-6);
        assert!((b - brute_force_cost(&logits, &[1, 2])).abs() < 1e-4);
    }

    #[test]
    fn test_separated_repeats_are_kept() {
        let logits = logits_single();
        let collapsed = cost(CtcLoss::new(BLANK), &logits, &[1, 2, 1]);
        let raw = cost(
            CtcLoss {
                blank: BLANK,
                collapse_repeated: false,
            },
            &logits,
            &[1, 2, 1],
        );
        assert!((collapsed - raw).abs() < 1e-6);
        assert!((collapsed - cost(CtcLoss::new(BLANK), &logits, &[1, 2])).abs() > 1e-3);
    }

    #[test]
    fn test_batch_mean() {
        let single = logits_single();
        let batch = Tensor::cat(&[&single, &single], 1).unwrap();
        let loss = CtcLoss::new(BLANK);
        let one = cost(loss, &single, &[1, 2]);
        let both = loss
            .forward(&batch, &[vec![1, 2], vec![1, 2]], &[T, T])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap() as f64;
        assert!((both - one).abs() < 1e-5);

        // Второй пример без фреймов: сумма та же, делитель равен размеру батча.
        let half = loss
            .forward(&batch, &[vec![1, 2], vec![1, 2]], &[T, 0])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap() as f64;
        assert!((half - one / 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_batch_of_distinct_examples() {
        // Разные логиты и метки в каждом примере батча.
        let first = logits_single();
        let second = (logits_single().neg().unwrap() * 0.5).unwrap();
        let batch = Tensor::cat(&[&first, &second], 1).unwrap();
        let loss = CtcLoss::new(BLANK);

        let a = cost(loss, &first, &[1, 2]);
        let b = cost(loss, &second, &[0]);
        assert!((a - brute_force_cost(&first, &[1, 2])).abs() < 1e-4);
        assert!((b - brute_force_cost(&second, &[0])).abs() < 1e-4);

        let mean = loss
            .forward(&batch, &[vec![1, 2], vec![0]], &[T, T])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap() as f64;
        assert!((mean - (a + b) / 2.0).abs() < 1e-5);

        let zeros = Tensor::zeros((T, 2, C), DType::F32, &Device::Cpu).unwrap();
        let uniform = loss
            .forward(&zeros, &[vec![1, 2], vec![0]], &[T, T])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(uniform.is_finite());
        assert!(uniform > 0.0);
    }

    #[test]
    fn test_zero_length_has_zero_gradient() {
        let init = Tensor::cat(&[&logits_single(), &logits_single()], 1).unwrap();
        let var = Var::from_tensor(&init).unwrap();
        let loss = CtcLoss::new(BLANK)
            .forward(var.as_tensor(), &[vec![0, 1], vec![2]], &[T, 0])
            .unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(var.as_tensor()).unwrap();
        assert_eq!(grad.dims(), &[T, 2, C]);

        let g0 = grad.narrow(1, 0, 1).unwrap().abs().unwrap().sum_all().unwrap();
        let g1 = grad.narrow(1, 1, 1).unwrap().abs().unwrap().max_all().unwrap();
        assert!(g0.to_scalar::<f32>().unwrap() > 0.0);
        assert_eq!(g1.to_scalar::<f32>().unwrap(), 0.0);

        let all_empty = CtcLoss::new(BLANK)
            .forward(&init, &[vec![0], vec![2]], &[0, 0])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(all_empty, 0.0);
    }

    #[test]
    fn test_infeasible_alignment_is_absorbed() {
        let logits = logits_single();
        // [1, 1] без схлопывания требует 3 фрейма, а есть 2.
        let loss = CtcLoss {
            blank: BLANK,
            collapse_repeated: false,
        };
        let v = loss
            .forward(&logits, &[vec![1, 1]], &[2])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_rejects_blank_in_label() {
        let logits = logits_single();
        let res = CtcLoss::new(BLANK).forward(&logits, &[vec![1, BLANK]], &[T]);
        assert!(matches!(res, Err(AsrError::Inference(_))));
    }

    #[test]
    fn test_greedy_decode() {
        // argmax по шагам: 1 1 3 1 2 2 | длина 5
        let rows = [1usize, 1, 3, 1, 2, 2];
        let mut data = vec![0f32; rows.len() * C];
        for (t, &c) in rows.iter().enumerate() {
            data[t * C + c] = 5.0;
        }
        let logits = Tensor::from_vec(data, (rows.len(), 1, C), &Device::Cpu).unwrap();
        assert_eq!(greedy_decode(&logits, &[6], BLANK).unwrap(), vec![vec![1, 1, 2]]);
        assert_eq!(greedy_decode(&logits, &[5], BLANK).unwrap(), vec![vec![1, 1, 2]]);
        assert_eq!(greedy_decode(&logits, &[2], BLANK).unwrap(), vec![vec![1]]);
    }
}
