use std::path::PathBuf;

use clap::{Args, Parser as ClapParser, Subcommand};
use docstage::cli::{self, CheckResult, CliError, RunOptions, TranslateOptions};
use docstage::output::{to_json, to_json_pretty};
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "docstage")]
#[command(about = "docstage - translate LINQ-style queries into aggregation pipelines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the pipeline stages a query translates to
    Translate {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Translate a query and run it over JSON documents
    Run {
        #[command(flatten)]
        query: QueryArgs,

        /// JSON data file (`-` for stdin)
        #[arg(short, long)]
        data: PathBuf,

        /// Pretty-print the output
        #[arg(short, long)]
        pretty: bool,
    },

    /// Only validate query syntax
    Check {
        /// The query text
        query: String,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// The query text
    query: String,

    /// Registry configuration (class maps and discriminators)
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Target server version, e.g. 4.2
    #[arg(long)]
    server_version: Option<String>,

    /// Evaluate untranslatable operators on the client
    #[arg(long)]
    client_fallback: bool,

    /// Captured variable as name=json
    #[arg(long = "capture")]
    captures: Vec<String>,

    /// Query source as name=collection:Type
    #[arg(long = "source")]
    sources: Vec<String>,
}

impl From<QueryArgs> for TranslateOptions {
    fn from(args: QueryArgs) -> Self {
        TranslateOptions {
            query: args.query,
            schema: args.schema,
            server_version: args.server_version,
            client_fallback: args.client_fallback,
            captures: args.captures,
            sources: args.sources,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Translate { query } => run_translate(query.into()),
        Commands::Run { query, data, pretty } => run_query(
            RunOptions {
                translate: query.into(),
                data,
            },
            pretty,
        ),
        Commands::Check { query } => match cli::execute_check(&query) {
            Ok(CheckResult::Valid(expr)) => {
                println!("{}", expr);
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run_translate(options: TranslateOptions) -> Result<(), CliError> {
    for line in cli::execute_translate(&options)? {
        println!("{}", line);
    }
    Ok(())
}

fn run_query(options: RunOptions, pretty: bool) -> Result<(), CliError> {
    if options.data.as_os_str() == "-" && atty::is(atty::Stream::Stdin) {
        return Err(CliError::InvalidArgument("no data piped to stdin".to_string()));
    }
    let result = cli::execute_run(&options)?;
    let value = match result {
        docstage::QueryResult::Sequence(values) => docstage::Value::Array(values),
        docstage::QueryResult::Scalar(value) => value,
    };
    let json = if pretty { to_json_pretty(&value) } else { to_json(&value) };
    println!("{}", json);
    Ok(())
}
