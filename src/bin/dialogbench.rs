use std::{path::PathBuf, process::ExitCode, sync::Arc};

use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialogbench::{
    build_client_agent, AgentVersion, BenchmarkReport, BenchmarkRunner, ConfigError,
    DialogueEngine, EvaluationResult, Evaluator, EventRecorder, HarnessConfig, HarnessError,
    HttpManagerAgent, HttpManagerFactory, JsonlRecorder, NullRecorder, Persona, PersonaCatalog,
    RejectedScenario, ReportGenerator, Scenario, ScenarioSet,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dialogbench")]
#[command(about = "Run scripted customer conversations against tool-calling manager agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scenario against the configured manager agent
    Run {
        /// Scenario document (YAML or JSON)
        #[arg(short, long)]
        scenario: PathBuf,

        /// Directory with persona documents
        #[arg(short, long, default_value = "personas")]
        personas: PathBuf,

        /// Harness configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Report output directory (overrides the config)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Run every scenario in a directory against every configured version
    Sweep {
        /// Directory with scenario documents
        #[arg(short, long)]
        scenarios: PathBuf,

        /// Directory with persona documents
        #[arg(short, long, default_value = "personas")]
        personas: PathBuf,

        /// Harness configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Report output directory (overrides the config)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Maximum number of conversations in flight
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Print the JSON Schema of scenario and persona documents
    Schema,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,dialogbench=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run {
            scenario,
            personas,
            config,
            out,
        } => run(scenario, personas, config, out).await,
        Command::Sweep {
            scenarios,
            personas,
            config,
            out,
            concurrency,
        } => sweep(scenarios, personas, config, out, concurrency).await,
        Command::Schema => schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{} {error}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<HarnessConfig, HarnessError> {
    let mut config = match path {
        Some(path) => HarnessConfig::from_file(path)?,
        None => HarnessConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

struct Recording {
    recorder: Arc<dyn EventRecorder>,
    jsonl: Option<Arc<JsonlRecorder>>,
}

impl Recording {
    fn from_config(config: &HarnessConfig) -> Self {
        match &config.events_dir {
            Some(dir) => {
                let jsonl = Arc::new(JsonlRecorder::spawn(dir, config.engine.retry.clone()));
                Self {
                    recorder: jsonl.clone(),
                    jsonl: Some(jsonl),
                }
            }
            None => Self {
                recorder: Arc::new(NullRecorder),
                jsonl: None,
            },
        }
    }

    async fn flush(&self) {
        if let Some(jsonl) = &self.jsonl {
            jsonl.flush().await;
        }
    }
}

async fn run(
    scenario_path: PathBuf,
    personas: PathBuf,
    config_path: Option<PathBuf>,
    out: Option<PathBuf>,
) -> Result<(), HarnessError> {
    let config = load_config(config_path.as_ref())?;
    let scenario = Scenario::from_path(&scenario_path)?;
    let catalog = PersonaCatalog::load_dir(&personas)?;
    let case = catalog.resolve(scenario)?;

    let version = manager_version(&config)?;
    let manager = HttpManagerAgent::from_version(&version)?;
    let client = build_client_agent(&config.client)?;
    let recording = Recording::from_config(&config);

    let engine = DialogueEngine::new(config.engine.clone(), recording.recorder.clone())
        .with_version(version.label.clone())
        .with_pricing(version.pricing.clone());
    let record = engine
        .run(&case.scenario, &case.persona, &manager, client.as_ref())
        .await;
    recording.flush().await;

    let evaluation = Evaluator::new(config.evaluator.clone()).evaluate(&case.scenario, &record)?;
    let generator = ReportGenerator::new()?;
    let out = out.unwrap_or(config.output_dir);
    let written = generator.write_run_reports(&out, &record, &evaluation, Utc::now())?;

    print_evaluation(&case.scenario, &case.persona, &evaluation);
    for path in written {
        println!("  report: {}", path.display());
    }
    Ok(())
}

fn manager_version(config: &HarnessConfig) -> Result<AgentVersion, ConfigError> {
    config
        .manager
        .clone()
        .or_else(|| config.benchmark.versions.first().cloned())
        .ok_or_else(|| {
            ConfigError::Invalid(
                "no manager endpoint configured (set `manager` or DIALOGBENCH_MANAGER_URL)".to_string(),
            )
        })
}

async fn sweep(
    scenarios_dir: PathBuf,
    personas: PathBuf,
    config_path: PathBuf,
    out: Option<PathBuf>,
    concurrency: Option<usize>,
) -> Result<(), HarnessError> {
    let mut config = load_config(Some(&config_path))?;
    if let Some(concurrency) = concurrency {
        config.benchmark.concurrency = concurrency;
        config.validate()?;
    }

    let set = ScenarioSet::load_dir(&scenarios_dir)?;
    let mut rejected = Vec::with_capacity(set.rejected.len());
    for (path, error) in &set.rejected {
        tracing::warn!(path = %path.display(), %error, "skipping scenario");
        rejected.push(RejectedScenario::new(path.display().to_string(), error));
    }
    let catalog = PersonaCatalog::load_dir(&personas)?;
    let mut cases = Vec::with_capacity(set.scenarios.len());
    for scenario in set.scenarios {
        let id = scenario.id.clone();
        match catalog.resolve(scenario) {
            Ok(case) => cases.push(case),
            Err(error) => {
                tracing::warn!(scenario = %id, %error, "skipping scenario");
                rejected.push(RejectedScenario::new(id, error));
            }
        }
    }

    let mut versions = config.benchmark.versions.clone();
    if versions.is_empty() {
        versions.push(manager_version(&config)?);
    }

    let client = build_client_agent(&config.client)?;
    let recording = Recording::from_config(&config);
    let runner = BenchmarkRunner::new(
        &config.benchmark,
        config.engine.clone(),
        Arc::new(Evaluator::new(config.evaluator.clone())),
    )
    .with_recorder(recording.recorder.clone());

    let interrupted = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let report = runner
        .run_until(&cases, &versions, &HttpManagerFactory, client, interrupted)
        .await?
        .with_rejected(rejected);
    recording.flush().await;

    let generator = ReportGenerator::new()?;
    let out = out.unwrap_or(config.output_dir);
    generator.write_benchmark_reports(&out, &report, Utc::now())?;

    print_benchmark(&report);
    println!("  reports: {}", out.display());
    Ok(())
}

fn schema() -> Result<(), HarnessError> {
    let documents = serde_json::json!({
        "scenario": schemars::schema_for!(Scenario),
        "persona": schemars::schema_for!(Persona),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&documents).map_err(dialogbench::ReportError::from)?
    );
    Ok(())
}

fn print_evaluation(scenario: &Scenario, persona: &Persona, evaluation: &EvaluationResult) {
    let verdict = if evaluation.passed {
        "PASS".green().bold()
    } else {
        "FAIL".red().bold()
    };
    println!(
        "{verdict} {} ({}) with {} -> {}",
        scenario.id,
        scenario.name,
        persona.name,
        evaluation.terminal_state
    );
    for criterion in &evaluation.criteria {
        let mark = if criterion.satisfied {
            "ok".green()
        } else if criterion.advisory {
            "--".yellow()
        } else {
            "!!".red()
        };
        println!("  {mark} {}: {}", criterion.name, criterion.rationale);
    }
}

fn print_benchmark(report: &BenchmarkReport) {
    if report.aborted {
        println!("{}", "Benchmark aborted, partial results".yellow().bold());
    }
    for rejected in &report.rejected {
        println!("{} {}: {}", "skipped".yellow(), rejected.source, rejected.reason);
    }
    for summary in &report.summaries {
        let rate = format!("{:.1}%", summary.success_rate * 100.0);
        let rate = if summary.passed == summary.runs && summary.runs > 0 {
            rate.green()
        } else {
            rate.yellow()
        };
        println!(
            "{} {}/{} passed ({rate}), errors {}, tool errors {}, cost ${:.4}",
            summary.label.bold(),
            summary.passed,
            summary.runs,
            summary.total_errors,
            summary.total_tool_errors,
            summary.total_cost_usd
        );
    }
    for row in &report.rows {
        let cells: Vec<String> = row
            .cells
            .iter()
            .map(|cell| match cell {
                Some(cell) if cell.passed => "pass".green().to_string(),
                Some(cell) => format!("fail:{}", cell.terminal_state).red().to_string(),
                None => "-".dimmed().to_string(),
            })
            .collect();
        println!("  {:<32} {}", row.scenario_id, cells.join("  "));
    }
}
