use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use squeeze_common::{Config, DatasetConfig, ModelConfig, SystemConfig, TrainConfig};
use squeeze_core::compression_stats;
use squeeze_train::{
    RetrainOutcome, Retrainer, RetrainerConfig, TrainSession, Trainer, LATEST,
};

#[derive(Parser, Debug)]
#[command(name = "squeeze", about = "Overrider-driven compression retraining")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the model, checkpointing every `system.checkpoint.save.interval` epochs.
    Train(ConfigArgs),
    /// Greedy per-layer threshold search with checkpoint rollback.
    Retrain(ConfigArgs),
    /// Evaluate the configured checkpoint on the validation split.
    Eval(ConfigArgs),
    /// Evaluate every checkpoint in `system.checkpoint.directory`.
    EvalAll(ConfigArgs),
    /// Print every overrider and the resulting compression.
    Info(ConfigArgs),
    /// Print the effective configuration (after `--set` overrides) as YAML.
    Export(ConfigArgs),
    /// Recompute overrider state, then save `latest`.
    OverridersUpdate(ConfigArgs),
    /// Write overridden values back into their original cells, then save `latest`.
    OverridersAssign(ConfigArgs),
    /// Restore overrider-internal cells to their initial values, then save `latest`.
    OverridersReset(ConfigArgs),
    /// Save the configured checkpoint as `latest`.
    Save(ConfigArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// YAML configuration file.
    #[arg(long, short)]
    config: PathBuf,
    /// Override a config key, e.g. `--set retrain.tolerance=0.05`. Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

impl ConfigArgs {
    fn load(&self) -> Result<Config> {
        let mut config = Config::load(&self.config)?;
        for assignment in &self.overrides {
            config
                .override_update(assignment)
                .with_context(|| format!("applying --set {assignment}"))?;
        }
        Ok(config)
    }
}

impl Command {
    fn args(&self) -> &ConfigArgs {
        match self {
            Command::Train(a)
            | Command::Retrain(a)
            | Command::Eval(a)
            | Command::EvalAll(a)
            | Command::Info(a)
            | Command::Export(a)
            | Command::OverridersUpdate(a)
            | Command::OverridersAssign(a)
            | Command::OverridersReset(a)
            | Command::Save(a) => a,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.command.args().load()?;
    let system = SystemConfig::from_config(&config)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&system.log_level))
        .context("invalid system.log_level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Train(_) => cmd_train(&config, &system),
        Command::Retrain(_) => cmd_retrain(&config, &system),
        Command::Eval(_) => cmd_eval(&config, &system),
        Command::EvalAll(_) => cmd_eval_all(&config, &system),
        Command::Info(_) => cmd_info(&config, &system),
        Command::Export(_) => cmd_export(&config),
        Command::OverridersUpdate(_) => cmd_lifecycle(&config, &system, Lifecycle::Update),
        Command::OverridersAssign(_) => cmd_lifecycle(&config, &system, Lifecycle::Assign),
        Command::OverridersReset(_) => cmd_lifecycle(&config, &system, Lifecycle::Reset),
        Command::Save(_) => cmd_lifecycle(&config, &system, Lifecycle::Save),
    }
}

// ── Session setup ──────────────────────────────────────────────────────────────

fn device(system: &SystemConfig) -> Result<Device> {
    if system.use_cuda {
        Ok(Device::cuda_if_available(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Build a trainer and restore `system.checkpoint.load`, if set.
fn session(config: &Config, system: &SystemConfig, action: &str) -> Result<Trainer> {
    config.validate(&ModelConfig::REQUIRED_KEYS, action)?;
    let mut trainer = Trainer::new(config, device(system)?)?;
    trainer.restore_configured()?;
    Ok(trainer)
}

/// Raise `flag` on every Ctrl-C, from a background thread running a small
/// tokio runtime.
fn install_interrupt(flag: Arc<AtomicBool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            rt.block_on(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received");
                    flag.store(true, Ordering::SeqCst);
                }
            })
        })?;
    Ok(())
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(config: &Config, system: &SystemConfig) -> Result<()> {
    let mut trainer = session(config, system, "train")?;
    let interrupt = Arc::new(AtomicBool::new(false));
    install_interrupt(Arc::clone(&interrupt))?;
    trainer.train(&interrupt)?;
    Ok(())
}

fn cmd_retrain(config: &Config, system: &SystemConfig) -> Result<()> {
    let retrain_config = RetrainerConfig::from_config(config)?;
    let trainer = session(config, system, "retrain")?;
    let mut retrainer = Retrainer::new(trainer, retrain_config).with_progress()?;
    install_interrupt(retrainer.interrupt_handle())?;

    match retrainer.retrain()? {
        RetrainOutcome::Finished { best_checkpoint } => {
            println!("\n=== Retraining Complete ===");
            println!("Best checkpoint: {best_checkpoint}");
            let (loss_base, acc_base) = retrainer.baselines();
            println!("Baselines: loss {loss_base:.4}, accuracy {acc_base:.4}");
            for (layer, record) in retrainer.log() {
                println!(
                    "  {layer}: threshold {:.4} (loss {:.4}, accuracy {:.4})",
                    record.threshold, record.loss, record.accuracy
                );
            }
        }
        RetrainOutcome::Interrupted => println!("Retraining interrupted"),
    }
    Ok(())
}

fn cmd_eval(config: &Config, system: &SystemConfig) -> Result<()> {
    let mut trainer = session(config, system, "eval")?;
    let (loss, accuracy) = trainer.evaluate()?;
    println!("loss {loss:.4}  accuracy {accuracy:.4}");
    Ok(())
}

fn cmd_eval_all(config: &Config, system: &SystemConfig) -> Result<()> {
    let mut trainer = session(config, system, "eval-all")?;
    let results = trainer.eval_all()?;
    if results.is_empty() {
        println!(
            "No checkpoints in {}",
            trainer.checkpoints().directory().display()
        );
    }
    for (tag, loss, accuracy) in results {
        println!("{tag:<24} loss {loss:.4}  accuracy {accuracy:.4}");
    }
    Ok(())
}

fn cmd_info(config: &Config, system: &SystemConfig) -> Result<()> {
    let trainer = session(config, system, "info")?;
    let net = trainer.net();
    println!("Model {} ({} → {})", net.name(), net.input_size(), net.output_size());
    for info in trainer.info() {
        println!("{info}");
    }
    let stats = compression_stats(trainer.overriders())?;
    for (layer, zeroed, total) in &stats.layers {
        println!("  {layer}: {zeroed}/{total} zeroed");
    }
    println!(
        "Density: {:.4} ({} of {} masked elements kept)",
        stats.density(),
        stats.total - stats.zeroed,
        stats.total
    );
    Ok(())
}

fn cmd_export(config: &Config) -> Result<()> {
    // Resolve every section so a broken config fails here rather than later.
    TrainConfig::from_config(config)?;
    DatasetConfig::from_config(config)?;
    ModelConfig::from_config(config)?;
    print!("{}", config.to_yaml()?);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Update,
    Assign,
    Reset,
    Save,
}

fn cmd_lifecycle(config: &Config, system: &SystemConfig, op: Lifecycle) -> Result<()> {
    let action = match op {
        Lifecycle::Update => "overriders-update",
        Lifecycle::Assign => "overriders-assign",
        Lifecycle::Reset => "overriders-reset",
        Lifecycle::Save => "save",
    };
    let mut trainer = session(config, system, action)?;
    match op {
        Lifecycle::Update => trainer.overriders_update()?,
        Lifecycle::Assign => trainer.overriders_assign()?,
        Lifecycle::Reset => trainer.overriders_reset()?,
        Lifecycle::Save => {}
    }
    trainer.save_checkpoint(LATEST)?;
    tracing::info!(action, tag = LATEST, "Saved checkpoint");
    Ok(())
}
