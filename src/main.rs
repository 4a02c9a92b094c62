use anyhow::{Context, Result};
use clap::Parser;
use nl_to_sql_bigquery::{
    AppConfig, BigQueryWarehouse, NlToSqlPipeline, OpenAiClient, PipelineOptions, SchemaCatalog,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXAMPLE_QUESTIONS: [&str; 3] = [
    "What are the top 10 most frequent words in all of Shakespeare's works?",
    "Show me the total word count for each corpus, ordered by date",
    "Find all works that contain the word 'love' more than 100 times",
];

#[derive(Parser)]
#[command(name = "nl-to-sql-bigquery")]
#[command(about = "Translate natural-language questions into validated BigQuery SQL and run them")]
struct Args {
    /// Questions to answer; the built-in examples run when none are given
    questions: Vec<String>,

    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Characters of result JSON to print per question
    #[arg(long, default_value_t = 1000)]
    preview_chars: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let warehouse = Arc::new(BigQueryWarehouse::from_config(&config.bigquery)?);
    let catalog = SchemaCatalog::load(
        &config.table_metadata,
        &config.bigquery.table_name,
        &config.bigquery.project_id,
        &config.bigquery.dataset_id,
        warehouse.as_ref(),
    )
    .await?;
    let llm = Arc::new(OpenAiClient::from_config(&config.openai)?);
    let pipeline = NlToSqlPipeline::new(catalog, llm, warehouse, PipelineOptions::from_config(&config))?;

    let questions: Vec<String> = if args.questions.is_empty() {
        EXAMPLE_QUESTIONS.iter().map(|q| q.to_string()).collect()
    } else {
        args.questions
    };

    for question in &questions {
        println!("\nProcessing query: {}", question);
        match pipeline.process_natural_language_query(question).await {
            Ok(response) => {
                println!("\nGenerated SQL:");
                println!("{}", response.sql_query);
                println!("\nResults:");
                let rendered = serde_json::to_string_pretty(&response.results)?;
                let preview: String = rendered.chars().take(args.preview_chars).collect();
                println!("{}", preview);
                if response.truncated {
                    println!("(result truncated at {} rows)", response.row_count);
                }
            }
            Err(e) => {
                let report = e.report();
                error!("Query failed: {}", e);
                println!("Error processing query: {}: {}", report.kind, report.message);
            }
        }
    }

    pipeline.shutdown();
    info!("Processed {} question(s)", questions.len());
    Ok(())
}
