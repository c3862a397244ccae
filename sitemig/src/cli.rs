use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "sitemig")]
#[command(about = "Import site content, mirror it to Google Drive and bulk publish it")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Number of work items processed in parallel
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Pause between dispatch waves, in milliseconds
    #[arg(long, global = true)]
    pub wave_delay_ms: Option<u64>,

    /// Retries for throttled or failing remote calls
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Directory the CSV report is written to
    #[arg(long, global = true)]
    pub report_dir: Option<PathBuf>,

    /// Report file name without extension
    #[arg(long, global = true)]
    pub report_name: Option<String>,

    /// Write a new numbered report instead of appending to an existing one
    #[arg(long, global = true)]
    pub no_concatenate: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch pages and save converted documents locally
    Import(ImportArgs),
    /// Upload a local folder tree to a Google Drive folder
    Upload(UploadArgs),
    /// Run admin operations for every document in a Drive folder
    Publish(PublishArgs),
    /// Extract page URLs from a sitemap
    Urls(UrlsArgs),
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// JSON array of URLs, or a path or URL to one
    #[arg(short, long)]
    pub urls: String,

    /// Local directory for the converted output
    #[arg(short, long, default_value = "./docs")]
    pub target: PathBuf,

    /// Output types, separated by ',' or '|'
    #[arg(long = "type", default_value = "html")]
    pub output_type: String,

    /// First index of the URL list to import
    #[arg(long)]
    pub start: Option<usize>,

    /// Index after the last URL to import
    #[arg(long)]
    pub end: Option<usize>,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Id of the destination Drive folder
    #[arg(short, long)]
    pub target: String,

    /// Local folder to upload
    #[arg(short, long, default_value = "./docs")]
    pub source: PathBuf,

    /// Access token, or path to a token JSON file
    #[arg(long)]
    pub token: Option<String>,

    /// uploadAll, keepRemote, overwrite, overwriteOlder, convert or scanonly
    #[arg(short, long, default_value = "uploadAll")]
    pub mode: String,

    /// Keep uploaded .docx files instead of converting them
    #[arg(long)]
    pub no_convert: bool,

    /// Print the destination tree when done
    #[arg(short, long)]
    pub print_target: bool,
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Id of the Drive folder to publish documents from
    #[arg(short, long)]
    pub target: String,

    /// Access token, or path to a token JSON file
    #[arg(long)]
    pub token: Option<String>,

    #[arg(long)]
    pub owner: String,

    #[arg(long)]
    pub repo: String,

    #[arg(long, default_value = "main")]
    pub branch: String,

    /// URL context of the target folder; defaults to `/<folder name>`
    #[arg(short, long)]
    pub root_context: Option<String>,

    /// Admin operations to run per document, in order
    #[arg(long, value_enum, value_delimiter = ',', default_value = "preview,live")]
    pub operation: Vec<OperationArg>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationArg {
    Preview,
    Live,
    Index,
    Cache,
    Status,
}

#[derive(Args, Debug)]
pub struct UrlsArgs {
    /// Sitemap or sitemap index URL
    #[arg(short, long)]
    pub source: String,

    /// Output file; a `.json` name writes a JSON array. Prints to stdout when absent
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Keep only URLs modified after this date (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    pub lastmod: Option<String>,
}
