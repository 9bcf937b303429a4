use std::io::Write;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use funnels_shell::config::Config;
use funnels_shell::{flags_for_page, open_token_store, serve};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "funnels-shell", about = "Offline-capable delivery shell for the funnels app")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the app shell through the offline worker (default).
    Serve {
        /// Overrides FUNNELS_SHELL_BIND_ADDR.
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Overrides FUNNELS_SHELL_UPSTREAM_URL.
        #[arg(long)]
        upstream: Option<String>,
    },
    /// Print the startup flags a page served from HOST would receive.
    Flags {
        #[arg(long, default_value = "http")]
        scheme: String,
        #[arg(long, default_value = "localhost")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("invalid funnels shell configuration")?;
    init_tracing(&config);

    match cli.command.unwrap_or(Command::Serve {
        bind: None,
        upstream: None,
    }) {
        Command::Serve { bind, upstream } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(upstream) = upstream {
                config.upstream_url = upstream.trim().trim_end_matches('/').to_string();
            }
            serve(config).await
        }
        Command::Flags { scheme, host } => {
            let tokens = open_token_store(&config);
            let flags = flags_for_page(&config, &tokens, &scheme, &host)?;
            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, &flags)?;
            writeln!(stdout)?;
            Ok(())
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}
