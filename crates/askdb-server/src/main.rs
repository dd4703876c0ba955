//! askdb command-line entry point
//!
//! Answers one natural-language question about a DuckDB database: loads the
//! schema, has OpenAI write and review the SQL, runs it read-only and prints
//! the answer.

use anyhow::Context;
use askdb_duck::{DuckQueryExecutor, DuckSchemaService};
use askdb_pipeline::{Collaborators, FanoutSink, Orchestrator, TracingSink};
use askdb_state::{Outcome, PipelineState};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod config;
mod llm;
mod logging;
mod metrics;

use config::Config;
use llm::{ChatModel, OpenAiInterpreter, OpenAiTranslator, OpenAiValidator};
use metrics::MetricsSink;

#[derive(Parser, Debug)]
#[command(name = "askdb", version, about = "Answer questions about a DuckDB database")]
struct Cli {
    /// Path to config.yaml (defaults apply when the file is absent)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Database file, overriding the configuration
    #[arg(long)]
    database: Option<PathBuf>,

    /// Session id attached to progress events
    #[arg(long)]
    session: Option<String>,

    /// Print the full pipeline state as JSON instead of the answer
    #[arg(long)]
    json: bool,

    /// Print Prometheus metrics to stderr after the run
    #[arg(long)]
    metrics: bool,

    /// The question to answer
    #[arg(required = true, trailing_var_arg = true)]
    question: Vec<String>,
}

fn build_collaborators(config: &Config, api_key: String) -> Collaborators {
    let model = ChatModel::new(api_key, config.llm.model.clone());
    let validator = Arc::new(OpenAiValidator::new(model.clone()));

    Collaborators {
        schema: Arc::new(
            DuckSchemaService::new(&config.database.path)
                .with_sample_rows(config.database.sample_rows),
        ),
        translator: Arc::new(OpenAiTranslator::new(model.clone())),
        validator: validator.clone(),
        alternatives: validator,
        executor: Arc::new(
            DuckQueryExecutor::new(&config.database.path)
                .with_max_rows(config.execution.max_rows)
                .with_timeout(config.execution.timeout()),
        ),
        interpreter: Arc::new(OpenAiInterpreter::new(model)),
    }
}

fn print_answer(state: &PipelineState) {
    let Outcome::Answered(response) = state.outcome() else {
        return;
    };

    println!("{}", response.summary);
    if let Some(sql) = &state.sql_query {
        println!("\n{}", sql);
    }
    if let Some(table) = &response.table {
        println!("\n{}", table.columns.join("\t"));
        for row in &table.rows {
            let cells: Vec<String> = row
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            println!("{}", cells.join("\t"));
        }
    }
    if state.execution_result.as_ref().is_some_and(|r| r.truncated) {
        println!("(result truncated)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(database) = &cli.database {
        config.database.path = database.display().to_string();
    }

    logging::init(&config.logging);

    let api_key = Config::get_openai_api_key()?;
    info!(
        database = %config.database.path,
        model = %config.llm.model,
        max_rows = config.execution.max_rows,
        timeout_ms = config.execution.timeout_ms,
        "Starting askdb"
    );

    let metrics = Arc::new(MetricsSink::new().context("registering metrics")?);
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(metrics.clone());

    let orchestrator = Orchestrator::new(build_collaborators(&config, api_key))?
        .with_progress_sink(Arc::new(sink));

    let question = cli.question.join(" ");
    let session = cli
        .session
        .unwrap_or_else(|| format!("cli-{}", std::process::id()));

    let (state, delivery) = orchestrator.run_tracked(&question, Some(&session)).await;
    // Every progress event (log lines, metrics) is in before anything is printed
    delivery.flushed().await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_answer(&state);
    }

    if cli.metrics {
        eprintln!("{}", metrics.render());
    }

    if let Outcome::Failed(error) = state.outcome() {
        anyhow::bail!("{}", error);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_question_words_are_joined() {
        let cli = Cli::parse_from(["askdb", "--session", "s-1", "how", "many", "orders?"]);
        assert_eq!(cli.question.join(" "), "how many orders?");
        assert_eq!(cli.session.as_deref(), Some("s-1"));
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
        assert!(!cli.json);
    }
}
