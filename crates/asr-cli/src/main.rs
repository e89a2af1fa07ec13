//! ds2
//!
//! CLI для акустической модели DeepSpeech2: прогон на синтетическом батче
//! и просмотр пересчёта длин через свёртки.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

use asr_core::ExecutionContext;
use model_deepspeech::{DeepSpeech, DeepSpeechConfig, Engine, FeatureBatch};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ds2")]
#[command(author, version, about = "DeepSpeech2 acoustic model on Candle", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Построить модель со случайными весами и прогнать синтетический батч
    Test {
        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// JSON-конфигурация модели (по умолчанию LibriSpeech)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Переопределить реализацию RNN-ячейки (custom, fused, cudnn_rnn, mkldnn_rnn)
        #[arg(long, value_parser = parse_engine)]
        engine: Option<Engine>,

        /// Размер батча (по умолчанию batch_size из конфигурации)
        #[arg(long)]
        batch: Option<usize>,

        /// Число фреймов в батче
        #[arg(long, default_value_t = 200)]
        time: usize,

        /// Seed синтетических данных
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Размер скрытого состояния RNN (для быстрых прогонов)
        #[arg(long)]
        hidden: Option<usize>,

        /// Число RNN-слоёв
        #[arg(long)]
        layers: Option<usize>,

        /// Считать в F16
        #[arg(long, default_value_t = false)]
        fp16: bool,

        /// Режим инференса (бегущие статистики batch norm, без backward)
        #[arg(long, default_value_t = false)]
        eval: bool,
    },

    /// Показать длины последовательностей после свёрток
    Lengths {
        /// Исходные длины (в фреймах)
        #[arg(required = true)]
        lengths: Vec<usize>,

        /// JSON-конфигурация модели
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Вывести конфигурацию в JSON
    Config {
        /// JSON-конфигурация для проверки (по умолчанию LibriSpeech)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test {
            device,
            config,
            engine,
            batch,
            time,
            seed,
            hidden,
            layers,
            fp16,
            eval,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(engine) = engine {
                config.engine = engine;
            }
            if let Some(hidden) = hidden {
                config.num_hidden = hidden;
            }
            if let Some(layers) = layers {
                config.num_rnn_layers = layers;
            }
            config.use_fp16 |= fp16;
            let batch = batch.unwrap_or(config.batch_size);
            run_test(&device, &config, batch, time, seed, !eval)
        }

        Commands::Lengths { lengths, config } => {
            let config = load_config(config.as_ref())?;
            config.validate()?;
            let lt = config.length_transformer();
            println!("📏 conv1 {:?}", config.conv1);
            println!("   conv2 {:?}", config.conv2);
            println!("   Минимум фреймов: {}", config.min_input_frames());
            for len in lengths {
                println!("   {len:>6} → {}", lt.output_length(len));
            }
            Ok(())
        }

        Commands::Config { config } => {
            let config = load_config(config.as_ref())?;
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            eprintln!(
                "rnn_input_size={}, rnn_output_size={}, blank_id={}",
                config.rnn_input_size(),
                config.rnn_output_size(),
                config.blank_id()
            );
            Ok(())
        }
    }
}

/// RUST_LOG, а без него уровень info.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn parse_engine(s: &str) -> std::result::Result<Engine, String> {
    Engine::from_str_loose(s).ok_or_else(|| format!("неизвестная реализация RNN-ячейки: {s}"))
}

fn load_config(path: Option<&PathBuf>) -> Result<DeepSpeechConfig> {
    match path {
        Some(path) => {
            info!("Конфигурация: {}", path.display());
            DeepSpeechConfig::from_json_file(path)
                .with_context(|| format!("Не удалось загрузить конфигурацию {}", path.display()))
        }
        None => {
            info!("Конфигурация: LibriSpeech по умолчанию");
            Ok(DeepSpeechConfig::librispeech())
        }
    }
}

fn run_test(
    device: &str,
    config: &DeepSpeechConfig,
    batch: usize,
    time: usize,
    seed: u64,
    train: bool,
) -> Result<()> {
    println!("🧪 DeepSpeech2 - Smoke Test");
    println!("===========================");

    let ctx = ExecutionContext::from_name(device)?;
    println!("Device: {:?}", ctx.device());

    let start = Instant::now();
    let (model, losses, varmap) = DeepSpeech::with_varmap(config, &ctx)?;
    let num_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
    println!(
        "✅ Модель построена за {:.2}с: {} параметров, engine={}",
        start.elapsed().as_secs_f64(),
        num_params,
        model.engine()
    );

    let input = FeatureBatch::synthetic(config, batch, time, seed, ctx.device())?
        .to_precision(config.precision())?;
    println!(
        "📦 Батч: {:?}, seq_lens={:?}",
        input.features.dims(),
        input.seq_lens
    );

    let start = Instant::now();
    let logits = model.forward_t(&input.features, &input.seq_lens, train)?;
    let loss = model.loss(&logits, &input.labels, &input.seq_lens, &losses)?;
    ctx.synchronize()?;
    println!(
        "✅ Логиты {:?} ({:?}) за {:.2}с",
        logits.dims(),
        logits.dtype(),
        start.elapsed().as_secs_f64()
    );
    println!(
        "   Длины после свёрток: {:?}",
        model.rnn_seq_lens(&input.seq_lens, logits.dim(0)?)
    );
    println!("   Потеря: {:.4}", loss.to_scalar::<f32>()?);

    if train {
        let start = Instant::now();
        let grads = loss.backward()?;
        let with_grad = varmap
            .all_vars()
            .iter()
            .filter(|v| grads.get(v.as_tensor()).is_some())
            .count();
        println!(
            "✅ Backward за {:.2}с: градиенты для {with_grad} тензоров",
            start.elapsed().as_secs_f64()
        );
    }

    let decoded = model.decode(&logits, &input.seq_lens)?;
    for (i, ids) in decoded.iter().enumerate() {
        println!("   #{i}: {} символов (метка: {})", ids.len(), input.labels[i].len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(env_filter().to_string(), "info");
        }
    }

    #[test]
    fn test_engine_override() {
        let cli = Cli::try_parse_from(["ds2", "test", "--engine", "cudnn_rnn"]).unwrap();
        match cli.command {
            Commands::Test { engine, .. } => assert_eq!(engine, Some(Engine::Fused)),
            _ => panic!("ожидалась команда test"),
        }
        assert_eq!(parse_engine("Custom"), Ok(Engine::Custom));
        assert_eq!(parse_engine("mkldnn_rnn"), Ok(Engine::Fused));
        assert!(parse_engine("lstm").is_err());
        assert!(Cli::try_parse_from(["ds2", "test", "--engine", "lstm"]).is_err());
    }
}
