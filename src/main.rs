use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chatlog_share::config::{self, ConfigOverrides, ShareConfig};
use chatlog_share::share::{self, ShareRequest};
use chatlog_share::{AssetPublisher, ChatContext, Notice, parse_range};
use clap::Parser;
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

/// Share a range of a chat as a chatlog archive on a public file host.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Chat file (JSON Lines) to export.
    #[arg(value_name = "CHAT_FILE")]
    chat: PathBuf,

    /// Character card of the chat (.png or .json).
    #[arg(value_name = "CARD")]
    card: PathBuf,

    /// Messages to include, both ends inclusive (e.g. "0-20").
    /// Defaults to the whole chat.
    #[arg(short, long, value_name = "START-END")]
    range: Option<String>,

    /// Upload the character card even if it comes from the catalog.
    #[arg(long)]
    force_upload: bool,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/chatlog-share/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// File host user hash.
    #[arg(long, value_name = "HASH")]
    user_hash: Option<String>,

    /// Upload directly through the CORS proxy.
    #[arg(long, conflicts_with = "direct")]
    proxy: bool,

    /// Upload through the chat server's upload plugin.
    #[arg(long)]
    direct: bool,

    /// CORS proxy template; `{url}` is replaced by the encoded target.
    #[arg(long, value_name = "TEMPLATE")]
    cors_proxy: Option<String>,

    /// Base URL of the chat server that serves avatars and images.
    #[arg(long, value_name = "URL")]
    server: Option<String>,

    /// Extra request header, repeatable (e.g. "X-CSRF-Token: abc").
    #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
    headers: Vec<String>,

    /// Stop on the first failed asset upload instead of skipping it.
    #[arg(long)]
    strict_assets: bool,

    /// Log every upload.
    #[arg(short, long)]
    verbose: bool,

    /// Only print the chatlog URL.
    #[arg(short, long)]
    quiet: bool,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "chatlog_share=debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn make_spinner(quiet: bool, message: String) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let s = ProgressBar::new_spinner();
    s.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("Invalid progress template")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    s.set_message(message);
    s.enable_steady_tick(Duration::from_millis(80));
    Ok(s)
}

fn write_notices(out: &mut impl Write, notices: &[Notice]) -> std::io::Result<()> {
    for notice in notices {
        writeln!(out, "Warning [{}]: {}", notice.asset, notice.message)?;
    }
    Ok(())
}

/// Notices go out through the spinner so they never tear its line.
fn print_notices(spinner: &ProgressBar, notices: &[Notice]) -> Result<()> {
    spinner
        .suspend(|| write_notices(&mut std::io::stderr().lock(), notices))
        .wrap_err("Failed to print warnings")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    // 1. Load config file (CLI path > default path)
    let file_cfg = config::load_file_config(cli.config.as_deref())?;

    // 2. Merge CLI options over it
    let headers = cli
        .headers
        .iter()
        .map(|h| config::parse_header(h))
        .collect::<Result<Vec<_>>>()?;
    let use_proxy = match (cli.proxy, cli.direct) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };
    let config = ShareConfig::resolve(
        file_cfg,
        ConfigOverrides {
            user_hash: cli.user_hash,
            use_proxy,
            cors_proxy: cli.cors_proxy,
            server_url: cli.server,
            headers,
            strict_assets: cli.strict_assets,
        },
    );

    // 3. Validate the range before touching the network
    let range = cli
        .range
        .as_deref()
        .map(parse_range)
        .transpose()
        .wrap_err("Invalid --range")?;

    // 4. Load the chat
    let context = ChatContext::load(&cli.chat, &cli.card)?;
    let character = context.character_display_name();

    // 5. Build and publish
    let mut publisher = AssetPublisher::new(config.transport()?);
    let request = ShareRequest {
        range,
        force_fresh_character_upload: cli.force_upload,
        policy: config.failure_policy(),
    };

    let spinner = make_spinner(cli.quiet, format!("Uploading chatlog with {character}..."))?;
    let result = share::share(&context, &mut publisher, &request);
    let notices = match &result {
        Ok(outcome) => outcome.notices.as_slice(),
        Err(_) => publisher.notices(),
    };
    print_notices(&spinner, notices)?;
    spinner.finish_and_clear();

    match result {
        Ok(outcome) => {
            println!("{}", outcome.chatlog_url);
            if !cli.quiet {
                eprintln!("View on Sprites: {}", outcome.reader_url);
                eprintln!(
                    "Done. {} messages, {} assets.",
                    outcome.records, outcome.assets
                );
            }
            Ok(())
        }
        Err(e) => Err(e.wrap_err("Failed to create or share log")),
    }
}
