use std::{
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    time::Instant,
};

use clap::{ArgAction, Parser, Subcommand};
use lincrf::{
    quark::StringTable, Checkpoint, Crf1dModel, Crf1dTrainer, Dataset, Evaluation, LbfgsTrainer, Model, Result,
    Tagger, TrainingOptions,
};

#[derive(Debug, Parser)]
#[command(version)]
#[command(propagate_version = true)]
struct Argv {
    /// More logging (-v: debug, -vv: trace); RUST_LOG overrides it
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train a model on labelled data; each FILE is one data group
    Train {
        /// write the model to a file (MODEL)
        #[arg(short, long, value_name = "MODEL")]
        model: PathBuf,
        /// read the training options from a JSON file
        #[arg(long, conflicts_with = "resume")]
        config: Option<PathBuf>,
        /// continue the run saved in a checkpoint
        #[arg(long, value_name = "CHECKPOINT")]
        resume: Option<PathBuf>,
        /// maximum number of passes over the data [default: 100, or the
        /// checkpoint's limit when resuming]
        #[arg(long)]
        max_iterations: Option<usize>,
        #[command(flatten)]
        opts: TrainingOptions,
        #[arg(required = true, value_name = "FILE")]
        datasets: Vec<PathBuf>,
    },
    /// Assign labels to the instances in the data sets
    Tag {
        /// read a model from a file (MODEL)
        #[arg(short, long, value_name = "MODEL")]
        model: PathBuf,
        /// report the performance of the model on the data
        #[arg(short = 't', long = "test")]
        evaluate: bool,
        /// output the reference labels in the input data
        #[arg(short, long)]
        reference: bool,
        /// output the probability of the label sequences
        #[arg(short, long)]
        probability: bool,
        /// suppress tagging results (useful for test mode)
        #[arg(short, long)]
        quiet: bool,
        #[arg(required = true, value_name = "FILE")]
        datasets: Vec<PathBuf>,
    },
    /// Print a readable listing of a model
    Dump {
        #[arg(short, long, value_name = "MODEL")]
        model: PathBuf,
    },
}

fn trainer(
    config: Option<PathBuf>,
    resume: Option<PathBuf>,
    max_iterations: Option<usize>,
    opts: TrainingOptions,
) -> Result<LbfgsTrainer> {
    let mut trainer = match (resume, config) {
        (Some(path), _) => LbfgsTrainer::resume(Checkpoint::load(path)?)?,
        (None, Some(path)) => LbfgsTrainer::new(TrainingOptions::from_path(path)?)?,
        (None, None) => LbfgsTrainer::new(opts)?,
    };
    if let Some(n) = max_iterations {
        trainer.set_max_iterations(n);
    }
    Ok(trainer)
}

fn train(model: &Path, mut trainer: LbfgsTrainer, datasets: &[PathBuf]) -> Result<()> {
    let mut ds = Dataset::default();
    for (group, path) in datasets.iter().enumerate() {
        ds.read_file(path, group)?;
    }
    let outcome = trainer.train(&ds, model)?;
    log::info!(
        "stopped: {:?}, iterations: {}, loglikelihood: {:.6}",
        outcome.stop,
        outcome.iterations,
        outcome.loglikelihood
    );
    if let Some(est) = outcome.holdout {
        log::info!("holdout item accuracy of the kept weights: {:.4}", est.item_accuracy);
    }
    Ok(())
}

fn tag(model: &Path, evaluate: bool, reference: bool, probability: bool, quiet: bool, datasets: &[PathBuf]) -> Result<()> {
    let model = Crf1dModel::from_path(model)?;
    let mut tagger = model.tagger();
    let mut evaluation = Evaluation::new(model.labels());
    let name = |l: usize| model.labels().to_str(l).unwrap_or("?");
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let begin = Instant::now();
    let mut n = 0;
    for path in datasets {
        let mut ds = Dataset::frozen(model.labels().clone(), model.attrs().clone());
        ds.read_file(path, 0)?;
        for seq in &ds.seqs {
            let (predicted, score) = tagger.viterbi(seq)?;
            n += 1;
            if evaluate {
                evaluation.accumulate(&seq.labels, &predicted)?;
            }
            if quiet {
                continue;
            }
            if probability {
                let p = (score - tagger.lognorm(seq)?).exp();
                writeln!(out, "@probability\t{p:.6}")?;
            }
            for (t, &y) in predicted.iter().enumerate() {
                if reference {
                    writeln!(out, "{}\t{}", name(seq.labels[t]), name(y))?;
                } else {
                    writeln!(out, "{}", name(y))?;
                }
            }
            writeln!(out)?;
        }
    }
    if evaluate {
        evaluation.evaluate();
        writeln!(out, "{evaluation}")?;
        let sec = begin.elapsed().as_secs_f64();
        writeln!(out, "Elapsed time: {sec:.6} [sec] ({:.1} [instance/sec])", n as f64 / sec)?;
    }
    out.flush()?;
    Ok(())
}

fn dump(model: &Path) -> Result<()> {
    let model = Crf1dModel::from_path(model)?;
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    model.dump(&mut out)?;
    out.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    let argv = Argv::parse();
    let level = match argv.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    log::debug!("{:?}", argv);

    let r = match argv.command {
        Command::Train {
            model,
            config,
            resume,
            max_iterations,
            opts,
            datasets,
        } => trainer(config, resume, max_iterations, opts).and_then(|t| train(&model, t, &datasets)),
        Command::Tag {
            model,
            evaluate,
            reference,
            probability,
            quiet,
            datasets,
        } => tag(&model, evaluate, reference, probability, quiet, &datasets),
        Command::Dump { model } => dump(&model),
    };
    match r {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lincrf::TransitionState;

    fn parse(args: &[&str]) -> Command {
        Argv::try_parse_from(args).unwrap().command
    }

    #[test]
    fn resume_keeps_iteration_limit() {
        let path = std::env::temp_dir().join(format!("lincrf-main-{}.bson", std::process::id()));
        let options = TrainingOptions {
            max_iterations: 7,
            ..Default::default()
        };
        let state = TransitionState::new(4, 2, options.memory).unwrap();
        Checkpoint {
            options,
            state: state.as_blob().to_vec(),
        }
        .save(&path)
        .unwrap();

        let resume = path.to_str().unwrap();
        for (args, expected) in [
            (vec!["lincrf", "train", "-m", "out.json", "--resume", resume, "data.txt"], 7),
            (
                vec!["lincrf", "train", "-m", "out.json", "--resume", resume, "--max-iterations", "9", "data.txt"],
                9,
            ),
        ] {
            let Command::Train {
                config,
                resume,
                max_iterations,
                opts,
                ..
            } = parse(&args)
            else {
                panic!("not a train command");
            };
            let t = trainer(config, resume, max_iterations, opts).unwrap();
            assert_eq!(t.options().max_iterations, expected);
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn iteration_limit_on_new_runs() {
        let Command::Train {
            config,
            resume,
            max_iterations,
            opts,
            ..
        } = parse(&["lincrf", "train", "-m", "out.json", "data.txt"])
        else {
            panic!("not a train command");
        };
        assert_eq!(max_iterations, None);
        let t = trainer(config, resume, max_iterations, opts).unwrap();
        assert_eq!(t.options().max_iterations, 100);

        let Command::Train {
            max_iterations, opts, ..
        } = parse(&["lincrf", "train", "-m", "out.json", "--max-iterations", "3", "data.txt"])
        else {
            panic!("not a train command");
        };
        let t = trainer(None, None, max_iterations, opts).unwrap();
        assert_eq!(t.options().max_iterations, 3);
    }
}
