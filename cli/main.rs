#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use arbo::config::RunConfig;
use arbo::data::{ObservedData, load_parameter_draws, load_weekly_counts};
use arbo::discrepancy::DiscrepancyFormulation;
use arbo::dynamics::CHANNEL_NAMES;
use arbo::forward::{ForwardModel, Trajectory};
use arbo::likelihood::Likelihood;
use arbo::propagate::{batch_log_likelihood, batch_qoi};
use arbo::qoi::{QoiExtractor, QoiSample};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::fs::File;
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Clone, Copy, ValueEnum)]
pub enum FormulationCli {
    None,
    Linear,
    LinearQuadratic,
    FullQuadraticCrossTerm,
}

impl From<FormulationCli> for DiscrepancyFormulation {
    fn from(value: FormulationCli) -> Self {
        match value {
            FormulationCli::None => DiscrepancyFormulation::None,
            FormulationCli::Linear => DiscrepancyFormulation::Linear,
            FormulationCli::LinearQuadratic => DiscrepancyFormulation::LinearQuadratic,
            FormulationCli::FullQuadraticCrossTerm => {
                DiscrepancyFormulation::FullQuadraticCrossTerm
            }
        }
    }
}

#[derive(Parser)]
#[command(
    name = "arbo",
    version,
    about = "Forward model, likelihood and QoI evaluation for a SEIR-SEI arbovirus model with discrepancy terms"
)]
pub struct Cli {
    /// Run configuration (.toml); the built-in reference setup is used when omitted
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the discrepancy formulation from the configuration
    #[arg(long, global = true, value_enum)]
    formulation: Option<FormulationCli>,

    /// Worker threads for batch evaluation (defaults to the number of CPUs)
    #[arg(long, global = true, value_name = "N")]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write the reference run configuration to a file
    #[command(about = "Write the default configuration (outputs: run.toml)")]
    InitConfig {
        #[arg(default_value = "run.toml")]
        output: PathBuf,
    },

    /// Integrate the model without discrepancy and write the trajectory
    #[command(about = "Simulate a zero-discrepancy trajectory (outputs: trajectory.tsv)")]
    Simulate {
        /// Number of weekly output times
        #[arg(long, default_value = "52")]
        weeks: usize,

        #[arg(long, default_value = "trajectory.tsv")]
        output: PathBuf,
    },

    /// Evaluate the log-likelihood of each parameter draw against weekly case data
    #[command(about = "Evaluate log-likelihoods (outputs: loglik.tsv)")]
    Loglik {
        /// Whitespace separated `week new_cases` rows
        #[arg(long, value_name = "PATH")]
        data: PathBuf,

        /// One parameter draw per row
        #[arg(long, value_name = "PATH")]
        draws: PathBuf,

        #[arg(long, default_value = "loglik.tsv")]
        output: PathBuf,
    },

    /// Propagate parameter draws through the model and write every trajectory
    #[command(about = "Evaluate QoI trajectories (outputs: qoi.tsv)")]
    Propagate {
        /// One parameter draw per row
        #[arg(long, value_name = "PATH")]
        draws: PathBuf,

        /// Number of weekly output times
        #[arg(long, default_value = "52")]
        weeks: usize,

        #[arg(long, default_value = "qoi.tsv")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let Cli {
        config,
        formulation,
        threads,
        command,
    } = cli;

    let result = match command {
        Some(Commands::InitConfig { output }) => init_config(&output),
        Some(Commands::Simulate { weeks, output }) => {
            load_config(config.as_deref(), formulation).and_then(|run| simulate(&run, weeks, &output))
        }
        Some(Commands::Loglik {
            data,
            draws,
            output,
        }) => init_threads(threads).and_then(|()| {
            let run = load_config(config.as_deref(), formulation)?;
            loglik(&run, &data, &draws, &output)
        }),
        Some(Commands::Propagate {
            draws,
            weeks,
            output,
        }) => init_threads(threads).and_then(|()| {
            let run = load_config(config.as_deref(), formulation)?;
            propagate(&run, &draws, weeks, &output)
        }),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_threads(threads: Option<usize>) -> Result<(), Box<dyn Error>> {
    let count = threads.unwrap_or_else(num_cpus::get).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(count)
        .build_global()?;
    log::info!("Using {count} worker threads");
    Ok(())
}

fn load_config(
    path: Option<&Path>,
    formulation: Option<FormulationCli>,
) -> Result<RunConfig, Box<dyn Error>> {
    let mut run = match path {
        Some(path) => {
            log::info!("Loading configuration from '{}'", path.display());
            RunConfig::load(path)?
        }
        None => RunConfig::default(),
    };
    if let Some(formulation) = formulation {
        run.formulation = formulation.into();
    }
    log::info!(
        "Discrepancy formulation: {} ({} parameters)",
        run.formulation.describe(),
        run.formulation.param_count(run.species_count)
    );
    Ok(run)
}

fn build_model(run: &RunConfig, time_step_count: usize) -> Result<ForwardModel, Box<dyn Error>> {
    let model = ForwardModel::new(run.model_config(time_step_count)?)?
        .with_rates(run.rates)
        .with_options(run.integrator.clone())?
        .with_guard(run.guard)?
        .with_start_time(run.observation.start_time);
    Ok(model)
}

fn weekly_times(run: &RunConfig, weeks: usize) -> Vec<f64> {
    (1..=weeks)
        .map(|w| run.observation.start_time + 7.0 * w as f64)
        .collect()
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

fn init_config(output: &Path) -> Result<(), Box<dyn Error>> {
    RunConfig::default().save(output)?;
    println!("Configuration written to: {}", output.display());
    Ok(())
}

fn simulate(run: &RunConfig, weeks: usize, output: &Path) -> Result<(), Box<dyn Error>> {
    let model = build_model(run, weeks)?;
    let initial = run.initial_state();
    let times = weekly_times(run, weeks);
    let trajectory = model.solve(&initial, &times, &model.config().zero_params())?;
    write_trajectory(output, &trajectory)?;
    println!("Trajectory written to: {}", output.display());
    Ok(())
}

fn loglik(run: &RunConfig, data: &Path, draws: &Path, output: &Path) -> Result<(), Box<dyn Error>> {
    let (weeks, counts) = load_weekly_counts(data)?;
    let observed = ObservedData::from_weekly_counts(&weeks, &counts, run.observation.reporting_factor)?;
    let observed = shift_times(observed, run.observation.start_time)?;
    let model = build_model(run, observed.len())?;
    let draws = load_parameter_draws(draws, model.config().param_count())?;
    let likelihood = Likelihood::new(model, run.initial_state(), observed, run.observation.variance)?;

    let pb = create_progress_bar(draws.len() as u64, "Evaluating log-likelihood");
    let values = batch_log_likelihood(&likelihood, &draws, || pb.inc(1))?;
    pb.finish_and_clear();

    let mut writer = BufWriter::new(File::create(output)?);
    let mut buffer = ryu::Buffer::new();
    writeln!(writer, "draw\tloglik")?;
    for (index, value) in values.iter().enumerate() {
        writeln!(writer, "{index}\t{}", buffer.format(*value))?;
    }
    writer.flush()?;
    println!("Log-likelihoods written to: {}", output.display());
    Ok(())
}

fn propagate(run: &RunConfig, draws: &Path, weeks: usize, output: &Path) -> Result<(), Box<dyn Error>> {
    let model = build_model(run, weeks)?;
    let draws = load_parameter_draws(draws, model.config().param_count())?;
    let extractor = QoiExtractor::new(model, run.initial_state(), weekly_times(run, weeks))?;

    let pb = create_progress_bar(draws.len() as u64, "Propagating draws");
    let samples = batch_qoi(&extractor, &draws, || pb.inc(1))?;
    pb.finish_and_clear();

    write_samples(output, &samples, extractor.times())?;
    println!("QoI samples written to: {}", output.display());
    Ok(())
}

/// Observation weeks count from the configured start time.
fn shift_times(observed: ObservedData, start_time: f64) -> Result<ObservedData, Box<dyn Error>> {
    if start_time == 0.0 {
        return Ok(observed);
    }
    let times = observed.times().iter().map(|t| t + start_time).collect();
    Ok(ObservedData::new(times, observed.cumulative_cases().to_vec())?)
}

fn write_trajectory(path: &Path, trajectory: &Trajectory) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "time\t{}", CHANNEL_NAMES.join("\t"))?;
    let mut buffer = ryu::Buffer::new();
    for (time, row) in trajectory.times().iter().zip(trajectory.states().rows()) {
        write!(writer, "{}", buffer.format(*time))?;
        for value in row {
            write!(writer, "\t{}", buffer.format(*value))?;
        }
        writeln!(writer)?;
    }
    writer.flush()
}

/// One row per draw; columns are `channel@time`. Unreached entries are `NaN`.
fn write_samples(path: &Path, samples: &[QoiSample], times: &[f64]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut buffer = ryu::Buffer::new();
    write!(writer, "draw\tcompleted_rows")?;
    for time in times {
        let label = buffer.format(*time).to_string();
        for name in CHANNEL_NAMES {
            write!(writer, "\t{name}@{label}")?;
        }
    }
    writeln!(writer)?;
    for (index, sample) in samples.iter().enumerate() {
        write!(writer, "{index}\t{}", sample.completed_rows)?;
        for value in &sample.values {
            write!(writer, "\t{}", buffer.format(*value))?;
        }
        writeln!(writer)?;
    }
    writer.flush()
}
