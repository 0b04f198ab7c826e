use std::fs::File;
use std::result::Result;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use dnd_lstm::prelude::*;

/// Everything one training run needs, loadable from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    agent: AgentConfig,
    train: TrainConfig,
    task: TaskConfig,
    epochs: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        let task = TaskConfig::default();
        Self {
            agent: AgentConfig::default()
                .with_dims(task.obs_dim, 32, 32, 2)
                .with_seed(0),
            train: TrainConfig::default(),
            task,
            epochs: 20,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("unknown argument: {0}")]
    UnknownArg(String),
    #[error("{0} needs a value")]
    MissingValue(&'static str),
    #[error("bad value for {flag}: {value}")]
    BadValue { flag: &'static str, value: String },
    #[error("task obs_dim {task} does not match agent input_dim {agent}")]
    InputMismatch { task: usize, agent: usize },
    #[error(transparent)]
    Agent(#[from] dnd_lstm::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    epochs: Option<usize>,
    seed: Option<u64>,
    log_json: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let rest = match args.first().map(String::as_str) {
        Some("help") | Some("--help") | Some("-h") => {
            print_help();
            return Ok(());
        }
        Some("train") => &args[1..],
        _ => &args[..],
    };

    let parsed = match parse_args(rest) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            print_help();
            std::process::exit(2);
        }
    };

    run(parsed)?;
    Ok(())
}

fn print_help() {
    println!("dnd-lstm (episodic memory actor-critic on a contextual choice task)");
    println!("usage:");
    println!("  dnd-lstm [train] [--config run.json] [--epochs N] [--seed S] [--log-json out.jsonl]");
    println!("  dnd-lstm help");
}

fn parse_args(args: &[String]) -> Result<Args, CliError> {
    let mut out = Args::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => out.config = Some(value(&mut it, "--config")?.into()),
            "--log-json" => out.log_json = Some(value(&mut it, "--log-json")?.into()),
            "--epochs" => out.epochs = Some(number(&mut it, "--epochs")?),
            "--seed" => out.seed = Some(number(&mut it, "--seed")?),
            other => return Err(CliError::UnknownArg(other.to_string())),
        }
    }
    Ok(out)
}

fn value<'a>(
    it: &mut impl Iterator<Item = &'a String>,
    flag: &'static str,
) -> Result<&'a String, CliError> {
    it.next().ok_or(CliError::MissingValue(flag))
}

fn number<'a, T: std::str::FromStr>(
    it: &mut impl Iterator<Item = &'a String>,
    flag: &'static str,
) -> Result<T, CliError> {
    let v = value(it, flag)?;
    v.parse().map_err(|_| CliError::BadValue {
        flag,
        value: v.clone(),
    })
}

fn run(args: Args) -> Result<(), CliError> {
    let mut cfg = match &args.config {
        Some(path) => serde_json::from_reader(File::open(path)?)?,
        None => RunConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        cfg.epochs = epochs;
    }
    if let Some(seed) = args.seed {
        cfg.agent.seed = Some(seed);
    }
    if cfg.task.obs_dim != cfg.agent.input_dim {
        return Err(CliError::InputMismatch {
            task: cfg.task.obs_dim,
            agent: cfg.agent.input_dim,
        });
    }

    let seed = cfg.agent.seed.unwrap_or(0);
    let mut task = ContextualChoice::new(cfg.task, seed.wrapping_add(1))?;
    let agent = Agent::new(cfg.agent)?;
    let mut trainer = Trainer::new(agent, cfg.train)?;
    trainer.set_gate_telemetry(true);

    let mut sink = match &args.log_json {
        Some(path) => Some(BufWriter::new(File::create(path)?)),
        None => None,
    };

    info!(
        epochs = cfg.epochs,
        trials = 2 * cfg.task.unique_trials,
        params = trainer.agent().params().len(),
        "training"
    );

    let mut last = None;
    for _ in 0..cfg.epochs {
        let trials = task.sample_epoch();
        let start = Instant::now();
        let log = trainer.run_epoch(&trials)?;
        println!(
            "Epoch {:3} | return = {:.2}, ent = {:.2} | loss: val = {:.2}, pol = {:.2} | acc = {:.2} | time = {:.2}",
            log.epoch,
            log.mean_return,
            log.mean_entropy,
            log.value_loss,
            log.policy_loss,
            log.accuracy,
            start.elapsed().as_secs_f32()
        );
        if let Some(w) = sink.as_mut() {
            serde_json::to_writer(&mut *w, &log)?;
            w.write_all(b"\n")?;
        }
        last = Some(log);
    }
    if let Some(w) = sink.as_mut() {
        w.flush()?;
    }

    if let Some(log) = last {
        let m = cfg.task.unique_trials;
        let without = log.correct_rate_by_step(0..m);
        let with = log.correct_rate_by_step(m..2 * m);
        println!();
        println!("correct rate by time step (last epoch, noise off at t={})", cfg.task.noise_off_step);
        println!("  t   w/o memory  w/ memory");
        for (t, (a, b)) in without.iter().zip(with.iter()).enumerate() {
            println!("{t:3}   {a:10.2}  {b:9.2}");
        }

        let snap = AgentAdapter::new(trainer.agent()).snapshot();
        println!(
            "memory: {}/{} entries, kernel = {}",
            snap.store_len, snap.store_capacity, snap.similarity
        );
    }
    Ok(())
}
