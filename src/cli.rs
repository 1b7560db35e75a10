/*!
dataset-explorer Command Line Interface

Inspect configured data sets, print the SQL of a query, compute counts and
distributions, and export query results as CSV.
*/

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dataset_explorer::export::{csv_file_name, export_csv, CancellationToken, CsvOptions};
use dataset_explorer::query::QueryStore;
use dataset_explorer::{Config, DataSetRegistry, Query, QueryDict, VERSION};

#[derive(Parser)]
#[command(name = "dsx")]
#[command(about = "Explore data sets without writing SQL")]
#[command(version = VERSION)]
pub struct Cli {
    /// Configuration file describing connections and data sets
    #[arg(long, global = true, default_value = "data_sets.toml")]
    config: PathBuf,

    /// Show personal data instead of redacting it
    #[arg(long, global = true)]
    include_personal_data: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Which query to work with
#[derive(Args)]
struct QueryArgs {
    /// Data set id
    data_set: String,

    /// JSON file with a query in its wire form
    #[arg(long, conflicts_with = "saved")]
    query: Option<PathBuf>,

    /// Id of a saved query
    #[arg(long)]
    saved: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List all configured data sets
    DataSets,

    /// Show the columns of a data set
    Columns {
        /// Data set id
        data_set: String,
    },

    /// Print the SQL of a query
    Sql {
        #[command(flatten)]
        query: QueryArgs,

        #[arg(long)]
        limit: Option<u64>,

        #[arg(long)]
        offset: Option<u64>,
    },

    /// Run a query and print its rows, tab separated
    Preview {
        #[command(flatten)]
        query: QueryArgs,

        #[arg(long, default_value_t = 20)]
        limit: u64,

        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Count rows, in total and per filter
    Count {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Print the distribution of a column as JSON
    Distribution {
        #[command(flatten)]
        query: QueryArgs,

        /// Column name
        #[arg(long)]
        column: String,
    },

    /// Suggest values of a text column
    Autocomplete {
        /// Data set id
        data_set: String,

        /// Column name
        column: String,

        /// Text the values must contain
        term: String,
    },

    /// Export the rows of a query as CSV
    Export {
        #[command(flatten)]
        query: QueryArgs,

        /// Output file; defaults to `<data set>[-<query>]-<date>.csv`
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long, default_value_t = ',')]
        delimiter: char,

        /// `.` or `,`
        #[arg(long, default_value_t = '.')]
        decimal_mark: char,
    },

    /// List the saved queries of a data set
    Queries {
        /// Data set id
        data_set: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    let registry = config.build_registry()?;
    let redact = !cli.include_personal_data;

    match cli.command {
        Commands::DataSets => {
            for data_set in registry.iter() {
                println!("{}\t{}", data_set.id, data_set.name);
            }
        }

        Commands::Columns { data_set } => {
            let data_set = registry.get(&data_set)?;
            for column in data_set.columns()? {
                let marker = if data_set.is_personal_data(&column.name) {
                    "\tpersonal"
                } else {
                    ""
                };
                println!("{}\t{}{}", column.name, column.semantic_type, marker);
            }
        }

        Commands::Sql {
            query,
            limit,
            offset,
        } => {
            let query = load_query(&config, &registry, &query)?;
            match query.compile_select(limit, offset, '.', redact)? {
                Some(sql) => println!("{}", sql),
                None => eprintln!("No columns selected"),
            }
        }

        Commands::Preview {
            query,
            limit,
            offset,
        } => {
            let query = load_query(&config, &registry, &query)?;
            let result = query.run(Some(limit), Some(offset), redact)?;
            let data_set = query.data_set();
            println!("{}", result.column_names.join("\t"));
            for row in &result.rows {
                let cells: Vec<String> = row
                    .iter()
                    .zip(&result.column_names)
                    .map(|(value, column)| match data_set.renderer(column) {
                        Some(renderer) if !value.is_null() => renderer.render(value),
                        _ => value.to_string(),
                    })
                    .collect();
                println!("{}", cells.join("\t"));
            }
        }

        Commands::Count { query } => {
            let query = load_query(&config, &registry, &query)?;
            println!("total\t{}", query.row_count()?);
            for (pos, filter) in query.filters().iter().enumerate() {
                println!(
                    "{} {} {:?}\t{}",
                    filter.column_name,
                    filter.operator,
                    filter.value,
                    query.filter_row_count(pos)?
                );
            }
        }

        Commands::Distribution { query, column } => {
            let query = load_query(&config, &registry, &query)?;
            let distribution = query.distribution(&column, redact)?;
            println!("{}", serde_json::to_string_pretty(&distribution)?);
        }

        Commands::Autocomplete {
            data_set,
            column,
            term,
        } => {
            for value in registry
                .get(&data_set)?
                .autocomplete_text_column(&column, &term, redact)?
            {
                println!("{}", value);
            }
        }

        Commands::Export {
            query,
            output,
            delimiter,
            decimal_mark,
        } => {
            let query = load_query(&config, &registry, &query)?;
            let delimiter = u8::try_from(delimiter)
                .context("The delimiter must be a single ASCII character")?;
            let path = output.unwrap_or_else(|| {
                PathBuf::from(csv_file_name(
                    &query.data_set().id,
                    query.query_id(),
                    chrono::Local::now().date_naive(),
                ))
            });
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let options = CsvOptions {
                delimiter,
                decimal_mark,
                redact_personal_data: redact,
            };
            let mut writer = std::io::BufWriter::new(file);
            let rows = export_csv(&query, &mut writer, options, &CancellationToken::never())?;
            writer.flush()?;
            eprintln!("Wrote {} rows to {}", rows, path.display());
        }

        Commands::Queries { data_set } => {
            let store = config
                .open_query_store()?
                .context("No [query_store] configured")?;
            for summary in store.list(&data_set)? {
                println!(
                    "{}\t{}\t{}",
                    summary.query_id, summary.updated_at, summary.updated_by
                );
            }
        }
    }

    Ok(())
}

fn load_query(
    config: &Config,
    registry: &DataSetRegistry,
    args: &QueryArgs,
) -> anyhow::Result<Query> {
    if let Some(query_id) = &args.saved {
        let store = config
            .open_query_store()?
            .context("No [query_store] configured")?;
        return Ok(store.load(registry, &args.data_set, query_id)?);
    }

    let dict = match &args.query {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let mut dict: QueryDict = serde_json::from_str(&content)
                .with_context(|| format!("Invalid query in {}", path.display()))?;
            dict.data_set_id = args.data_set.clone();
            dict
        }
        None => QueryDict::new(args.data_set.as_str()),
    };
    Ok(Query::from_dict(registry, dict)?)
}
