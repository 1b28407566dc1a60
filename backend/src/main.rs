//! Curator CLI - curate UK Biobank CSV exports
//!
//! # Main Commands
//!
//! ```bash
//! curator serve                     # Start HTTP server (port 3000)
//! curator curate ukb.csv            # Curate a CSV into NDJSON records
//! ```
//!
//! # Inspection Commands
//!
//! ```bash
//! curator headers ukb.csv           # Show how each header column resolves
//! curator dictionary --field 31     # Show dictionary sizes or one field
//! ```
//!
//! Dictionary paths, output directory and run options default to the
//! `CURATOR_*` environment variables; flags override them.

use clap::{Args, Parser, Subcommand};
use curator::{
    cancellation, file_chunks, CuratorConfig, CurationJob, CurationPipeline, Dictionaries,
    FileDictionarySource, HeaderResolver, JobStore, MemoryJobStore, NdjsonSink, RecordLayout,
    ResolvedColumn, RowStream, DEFAULT_CHUNK_SIZE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "curator")]
#[command(about = "Curate UK Biobank CSV exports into structured records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Dictionary file overrides shared by every command.
#[derive(Args, Clone, Default)]
struct DictionaryArgs {
    /// Field dictionary (showcase CSV or JSON)
    #[arg(long)]
    fields: Option<PathBuf>,

    /// Coding tables (showcase CSV or JSON)
    #[arg(long)]
    codings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Curate a CSV export and write one NDJSON record per participant
    Curate {
        /// Input CSV file
        input: PathBuf,

        /// Output NDJSON file (default: <output dir>/<job id>.ndjson)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Records per bulk insert
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Record nesting: field-major or instance-major
        #[arg(short, long)]
        layout: Option<RecordLayout>,

        /// Study the records belong to
        #[arg(short, long)]
        study: Option<String>,

        /// Seconds before the run is abandoned
        #[arg(long)]
        timeout: Option<u64>,

        /// Extra cell values treated as missing (repeatable)
        #[arg(long = "null-marker")]
        null_markers: Vec<String>,

        #[command(flatten)]
        dictionaries: DictionaryArgs,
    },

    /// Resolve the header row of a CSV file against the dictionary
    Headers {
        /// Input CSV file
        input: PathBuf,

        #[command(flatten)]
        dictionaries: DictionaryArgs,
    },

    /// Show dictionary sizes, or the entry of one field
    Dictionary {
        /// Field ID to look up
        #[arg(short, long)]
        field: Option<u32>,

        #[command(flatten)]
        dictionaries: DictionaryArgs,
    },

    /// Start HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory receiving one NDJSON file per job
        #[arg(long)]
        output_dir: Option<PathBuf>,

        #[command(flatten)]
        dictionaries: DictionaryArgs,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (if present)
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let result = match CuratorConfig::from_env() {
        Ok(config) => run(cli.command, config).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        eprintln!("❌ Error: {}", e);
        std::process::exit(1);
    }
}

/// Logs go to stderr so stdout stays clean for command output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

async fn run(command: Commands, mut config: CuratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Curate {
            input,
            output,
            batch_size,
            layout,
            study,
            timeout,
            null_markers,
            dictionaries,
        } => {
            dictionaries.apply(&mut config);
            if let Some(size) = batch_size {
                if size == 0 {
                    return Err("--batch-size must be at least 1".into());
                }
                config.options.batch_size = size;
            }
            if let Some(layout) = layout {
                config.options.layout = layout;
            }
            if let Some(study) = study {
                config.options.study_id = study;
            }
            if let Some(secs) = timeout {
                config.options.timeout_secs = secs;
            }
            if !null_markers.is_empty() {
                config.options.null_markers = null_markers;
            }
            cmd_curate(&input, output, config).await
        }

        Commands::Headers { input, dictionaries } => {
            dictionaries.apply(&mut config);
            cmd_headers(&input, &config).await
        }

        Commands::Dictionary { field, dictionaries } => {
            dictionaries.apply(&mut config);
            cmd_dictionary(field, &config).await
        }

        Commands::Serve {
            port,
            output_dir,
            dictionaries,
        } => {
            dictionaries.apply(&mut config);
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            curator::server::start_server(config).await
        }
    }
}

impl DictionaryArgs {
    fn apply(self, config: &mut CuratorConfig) {
        if let Some(fields) = self.fields {
            config.fields_path = fields;
        }
        if let Some(codings) = self.codings {
            config.codings_path = codings;
        }
    }
}

async fn load_dictionaries(config: &CuratorConfig) -> Result<Arc<Dictionaries>, Box<dyn std::error::Error>> {
    eprintln!("📚 Loading dictionaries");
    eprintln!("   Fields: {}", config.fields_path.display());
    eprintln!("   Codings: {}", config.codings_path.display());

    let source = FileDictionarySource::new(&config.fields_path, &config.codings_path);
    let dictionaries = Dictionaries::new();
    let (fields, codings) = dictionaries.load(&source).await?;
    eprintln!("   {} fields, {} codings", fields, codings);

    Ok(Arc::new(dictionaries))
}

async fn cmd_curate(
    input: &Path,
    output: Option<PathBuf>,
    config: CuratorConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let dictionaries = load_dictionaries(&config).await?;

    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let jobs = Arc::new(MemoryJobStore::new());
    let job = CurationJob::new(&config.options.study_id, vec![file_name]);
    let job_id = job.id.clone();
    jobs.insert(job).await?;

    let output = output.unwrap_or_else(|| config.output_dir.join(format!("{}.ndjson", job_id)));
    let sink = NdjsonSink::create(&output).await?;

    eprintln!("\n📄 Curating: {}", input.display());
    eprintln!("   Job: {}", job_id);
    eprintln!("   Study: {}", config.options.study_id);
    eprintln!("   Layout: {}", config.options.layout);
    eprintln!("   Batch size: {}", config.options.batch_size);

    let file = tokio::fs::File::open(input).await?;
    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⚠️  Interrupted, cancelling run");
            handle.cancel();
        }
    });

    let mut pipeline = CurationPipeline::new(
        &job_id,
        dictionaries,
        Arc::new(sink),
        jobs.clone(),
        config.options.clone(),
    );
    let report = pipeline.run(file_chunks(file, DEFAULT_CHUNK_SIZE), signal).await;

    eprintln!("\n⚙️  Rows: {}", report.rows_processed);
    eprintln!("   Records written: {}", report.records_written);
    eprintln!("   Batches: {}", report.batches_flushed);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_success() {
        let reason = report
            .error
            .clone()
            .unwrap_or_else(|| format!("run ended in state {}", report.state));
        return Err(reason.into());
    }

    eprintln!("💾 Output written to: {}", output.display());
    eprintln!("\n✨ Done!");
    Ok(())
}

async fn cmd_headers(input: &Path, config: &CuratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dictionaries = load_dictionaries(config).await?;
    let resolver = HeaderResolver::new(dictionaries.snapshot()?);

    let file = tokio::fs::File::open(input).await?;
    let mut rows = RowStream::new(file_chunks(file, DEFAULT_CHUNK_SIZE));
    let header = rows.next_row().await?.unwrap_or_default();
    let resolved = resolver.resolve(&header)?;

    eprintln!("\n📋 Header of {}", input.display());
    println!("  0  {}  (subject identifier)", resolved.subject_header);
    for column in &resolved.columns {
        match column {
            ResolvedColumn::Resolved(spec) => {
                let coding = if spec.coding.is_some() { ", coded" } else { "" };
                println!(
                    "  {}  {}  {} (instance {}, array {}/{}{})",
                    spec.position,
                    spec.header,
                    spec.value_type,
                    spec.descriptor.instance,
                    spec.descriptor.array_index,
                    spec.total_array_count,
                    coding
                );
            }
            ResolvedColumn::Invalid(err) => println!("  ❌ {}", err),
        }
    }

    let specs = resolved.into_specs()?;
    eprintln!("\n✅ All {} field columns valid", specs.len());
    Ok(())
}

async fn cmd_dictionary(field: Option<u32>, config: &CuratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dictionaries = load_dictionaries(config).await?;

    let Some(field_id) = field else {
        return Ok(());
    };

    let snapshot = dictionaries.snapshot()?;
    let entry = snapshot
        .get(field_id)
        .ok_or_else(|| format!("Field not found: {}", field_id))?;
    println!("{}", serde_json::to_string_pretty(entry)?);

    if let Some(coding_id) = entry.coding_id {
        match snapshot.get_coding(coding_id) {
            Some(table) => eprintln!("   Coding {}: {} values", coding_id, table.len()),
            None => eprintln!("   ⚠️  Coding {} is not loaded", coding_id),
        }
    }
    Ok(())
}
