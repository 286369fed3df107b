use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use web_collect_core::{
    generate_extraction_schema, generate_search_queries, normalize_variables, BrightDataConfig,
    BrightDataSearch, CharacterNgramReranker, CountryAssignment, DataExtractor, DateRange,
    ExtractedRecord, ExtractionConfig, ExtractionSchema, HttpFetcher, JinaConfig, JinaReranker,
    LlmConfig, MistralOcr, MistralOcrConfig, OpenAiCompletion, PageRetriever, Pipeline,
    PipelineRequest, QualityController, QueryTemplate, Reranker, RetrievalConfig, SourceCatalog,
    Variables,
};

#[derive(Parser)]
#[command(name = "web-collect", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Chat model, optionally prefixed with its provider.
    #[arg(long, env = "LLM_MODEL", global = true)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate search queries or query templates for a dataset.
    Queries {
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "3")]
        num_queries: usize,
        /// Variable placeholder every template must contain (repeatable).
        #[arg(long = "variable")]
        variables: Vec<String>,
    },
    /// Design an extraction schema from field names.
    Schema {
        #[arg(long)]
        description: String,
        /// Field to include (repeatable).
        #[arg(long = "field", required = true)]
        fields: Vec<String>,
    },
    /// Search with query templates and fetch the resulting pages.
    Retrieve {
        /// Query template, `{name}` marks a variable (repeatable).
        #[arg(long = "query", required = true)]
        queries: Vec<String>,
        #[command(flatten)]
        variables: VariableArgs,
        #[command(flatten)]
        retrieval: RetrievalArgs,
        /// Print search results without fetching pages.
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Extract schema records from urls.
    Extract {
        /// Page to extract from (repeatable).
        #[arg(long = "url", required = true)]
        urls: Vec<String>,
        /// JSON file holding the extraction schema.
        #[arg(long)]
        schema: PathBuf,
        #[command(flatten)]
        extraction: ExtractionArgs,
    },
    /// Flag likely errors in extracted records.
    Quality {
        /// JSON file holding extracted records.
        #[arg(long)]
        records: PathBuf,
        #[arg(long)]
        description: String,
        /// JSON file holding the extraction schema, for type checks.
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Run every stage: queries, retrieval, extraction and quality control.
    Run {
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "3")]
        num_queries: usize,
        /// JSON file holding the extraction schema.
        #[arg(long, conflicts_with = "fields")]
        schema: Option<PathBuf>,
        /// Field for a model-designed schema (repeatable).
        #[arg(long = "field")]
        fields: Vec<String>,
        #[command(flatten)]
        variables: VariableArgs,
        #[command(flatten)]
        retrieval: RetrievalArgs,
        #[command(flatten)]
        extraction: ExtractionArgs,
        /// Skip the quality control stage.
        #[arg(long, default_value_t = false)]
        skip_quality: bool,
    },
}

#[derive(Args)]
struct VariableArgs {
    /// Variable value as `name=value` (repeatable; values accumulate).
    #[arg(long = "var", value_parser = parse_variable)]
    values: Vec<(String, String)>,
}

impl VariableArgs {
    fn to_variables(&self) -> Variables {
        let mut variables = Variables::new();
        for (name, value) in &self.values {
            variables.entry(name.clone()).or_default().push(value.clone());
        }
        normalize_variables(variables)
    }
}

#[derive(Args)]
struct RetrievalArgs {
    /// Earliest publication date, YYYY-MM-DD.
    #[arg(long)]
    start_date: Option<String>,
    /// Latest publication date, YYYY-MM-DD.
    #[arg(long)]
    end_date: Option<String>,
    /// Split the date range into chunks of at most a year.
    #[arg(long, default_value_t = false)]
    time_chunking: bool,
    /// Country to geolocate searches in.
    #[arg(long)]
    country: Option<String>,
    #[arg(long, default_value_t = false)]
    news_only: bool,
    /// Site to restrict results to (repeatable).
    #[arg(long = "site")]
    sites: Vec<String>,
    /// JSON file mapping countries to source sites.
    #[arg(long, requires = "sources_country")]
    sources_file: Option<PathBuf>,
    /// Country whose sources are read from `--sources-file`.
    #[arg(long)]
    sources_country: Option<String>,
    /// JSON file assigning countries or sources per variable value.
    #[arg(long)]
    per_value_countries: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    rerank: bool,
    /// Rerank with the offline lexical scorer instead of the hosted model.
    #[arg(long, default_value_t = false)]
    local_rerank: bool,
    #[arg(long, default_value = "10")]
    rerank_top_n: usize,
    #[arg(long, default_value = "1")]
    pages_per_query: u32,
    /// Seconds before a page fetch is abandoned.
    #[arg(long, default_value = "30")]
    fetch_timeout: u64,
    /// Fill missing publication dates from page markup.
    #[arg(long, default_value_t = false)]
    lookup_dates: bool,
}

impl RetrievalArgs {
    fn to_config(&self) -> anyhow::Result<RetrievalConfig> {
        let mut source_allow_list = self.sites.clone();
        if let (Some(path), Some(country)) = (&self.sources_file, &self.sources_country) {
            let catalog = SourceCatalog::from_json_file(path)?;
            source_allow_list.extend(catalog.sources_for(country)?.iter().cloned());
        }

        let per_value_countries = match &self.per_value_countries {
            Some(path) => Some(
                serde_json::from_str::<CountryAssignment>(&std::fs::read_to_string(path)?)
                    .with_context(|| format!("reading {}", path.display()))?,
            ),
            None => None,
        };

        Ok(RetrievalConfig {
            date_range: DateRange::parse(self.start_date.as_deref(), self.end_date.as_deref())?,
            time_chunking: self.time_chunking,
            geolocation_country: self.country.clone(),
            news_only: self.news_only,
            source_allow_list,
            per_value_countries,
            rerank: self.rerank || self.local_rerank,
            rerank_top_n: self.rerank_top_n,
            results_pages_per_query: self.pages_per_query,
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            lookup_publication_dates: self.lookup_dates,
            ..RetrievalConfig::default()
        })
    }
}

#[derive(Args)]
struct ExtractionArgs {
    /// Appended to the extraction instruction.
    #[arg(long)]
    instruction: Option<String>,
    /// OCR PDFs through Mistral instead of skipping them.
    #[arg(long, default_value_t = false)]
    handle_pdfs: bool,
    #[arg(long, default_value = "4")]
    extraction_concurrency: usize,
}

impl ExtractionArgs {
    fn to_config(&self) -> ExtractionConfig {
        ExtractionConfig {
            extra_instruction: self.instruction.clone(),
            handle_pdfs: self.handle_pdfs,
            concurrency: self.extraction_concurrency,
            ..ExtractionConfig::default()
        }
    }

    fn ocr(&self) -> anyhow::Result<Option<Arc<MistralOcr>>> {
        if !self.handle_pdfs {
            return Ok(None);
        }
        Ok(Some(Arc::new(MistralOcr::new(MistralOcrConfig::from_env()?)?)))
    }
}

fn parse_variable(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    if name.trim().is_empty() || value.trim().is_empty() {
        return Err(format!("empty name or value in '{raw}'"));
    }
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn completion_model(model: Option<&str>) -> anyhow::Result<Arc<OpenAiCompletion>> {
    let mut config = LlmConfig::from_env()?;
    if let Some(model) = model {
        config.model = model.to_string();
    }
    Ok(Arc::new(OpenAiCompletion::new(config)?))
}

fn retriever(args: &RetrievalArgs) -> anyhow::Result<PageRetriever<BrightDataSearch, HttpFetcher>> {
    let search = BrightDataSearch::new(BrightDataConfig::from_env()?)?;
    let fetcher = HttpFetcher::new(Duration::from_secs(args.fetch_timeout))?;
    let retriever = PageRetriever::new(search, fetcher);

    let reranker: Option<Arc<dyn Reranker>> = if args.local_rerank {
        Some(Arc::new(CharacterNgramReranker::default()))
    } else if args.rerank {
        Some(Arc::new(JinaReranker::new(JinaConfig::from_env()?)?))
    } else {
        None
    };

    Ok(match reranker {
        Some(reranker) => retriever.with_reranker(reranker),
        None => retriever,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            return Err(error.into());
        }
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "web-collect boot"
    );

    match cli.command {
        Command::Queries {
            description,
            num_queries,
            variables,
        } => {
            let model = completion_model(cli.model.as_deref())?;
            let templates =
                generate_search_queries(model.as_ref(), &description, num_queries, &variables)
                    .await?;
            print_json(&templates)?;
        }
        Command::Schema {
            description,
            fields,
        } => {
            let model = completion_model(cli.model.as_deref())?;
            let schema = generate_extraction_schema(model.as_ref(), &description, &fields).await?;
            print_json(&schema)?;
        }
        Command::Retrieve {
            queries,
            variables,
            retrieval,
            stream,
        } => {
            let templates = queries
                .into_iter()
                .map(QueryTemplate::new)
                .collect::<Result<Vec<_>, _>>()?;
            let variables = variables.to_variables();
            let config = retrieval.to_config()?;
            let retriever = retriever(&retrieval)?;

            if stream {
                let mut results = retriever.search_stream(&templates, &variables, &config);
                while let Some(result) = results.next().await {
                    println!("{}", serde_json::to_string(&result?)?);
                }
            } else {
                let report = retriever.retrieve(&templates, &variables, &config).await?;
                for skipped in &report.skipped {
                    warn!(url = %skipped.url, reason = %skipped.reason, "skipped page");
                }
                print_json(&report)?;
            }
        }
        Command::Extract {
            urls,
            schema,
            extraction,
        } => {
            let schema: ExtractionSchema = read_json(&schema).await?;
            let model = completion_model(cli.model.as_deref())?;
            let mut extractor = DataExtractor::new(model);
            if let Some(ocr) = extraction.ocr()? {
                extractor = extractor.with_ocr(ocr);
            }
            let fetcher = HttpFetcher::new(Duration::from_secs(30))?;

            let report = extractor
                .extract_urls(&fetcher, &urls, &schema, &extraction.to_config())
                .await?;
            print_json(&report)?;
        }
        Command::Quality {
            records,
            description,
            schema,
        } => {
            let records: Vec<ExtractedRecord> = read_json(&records).await?;
            let schema: Option<ExtractionSchema> = match schema {
                Some(path) => Some(read_json(&path).await?),
                None => None,
            };
            let model = completion_model(cli.model.as_deref())?;

            let records = QualityController::new(model)
                .control(records, &description, schema.as_ref())
                .await?;
            print_json(&records)?;
        }
        Command::Run {
            description,
            num_queries,
            schema,
            fields,
            variables,
            retrieval,
            extraction,
            skip_quality,
        } => {
            let schema: Option<ExtractionSchema> = match schema {
                Some(path) => Some(read_json(&path).await?),
                None => None,
            };
            if schema.is_none() && fields.is_empty() {
                anyhow::bail!("either --schema or at least one --field is required");
            }

            let model = completion_model(cli.model.as_deref())?;
            let mut pipeline = Pipeline::new(model, retriever(&retrieval)?);
            if let Some(ocr) = extraction.ocr()? {
                pipeline = pipeline.with_ocr(ocr);
            }

            let request = PipelineRequest {
                dataset_description: description,
                num_queries,
                variables: variables.to_variables(),
                schema,
                schema_fields: fields,
                retrieval: retrieval.to_config()?,
                extraction: extraction.to_config(),
                quality_control: !skip_quality,
            };

            let output = pipeline.run(&request).await?;
            info!(
                run_id = %output.run_id,
                records = output.records.len(),
                finished_at = %Utc::now().to_rfc3339(),
                "run complete"
            );
            print_json(&json!({
                "run_id": output.run_id,
                "templates": output.templates,
                "schema": output.schema,
                "records": output.records,
                "flags": output.flags,
                "skipped": output.skipped,
            }))?;
        }
    }

    Ok(())
}
