use clap::{Parser, Subcommand};
use sense::auth::MfaCode;
use sense::config::CredentialsConfig;
use sense::{Client, Flow, Message};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sense")]
#[command(about = "Sense energy monitor CLI (unofficial API)", long_about = None)]
struct Cli {
    /// Config file path (default: SENSE_CONFIG or ~/.sense/config.yaml)
    #[arg(long, short, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Sense account email (overrides SENSE_EMAIL and the config file)
    #[arg(long, value_name = "EMAIL", global = true)]
    email: Option<String>,

    /// Sense account password (overrides SENSE_PASSWORD and the config file)
    #[arg(long, value_name = "PASSWORD", global = true)]
    password: Option<String>,

    /// MFA code, for accounts that require one
    #[arg(long, value_name = "CODE", global = true)]
    mfa: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Log in to each configured account and list its monitors.
    Monitors,

    /// Print realtime power readings for a monitor.
    Stream {
        /// Monitor id (default: the first monitor of the first account)
        #[arg(long, short, value_name = "ID")]
        monitor: Option<i64>,

        /// Stop after this many readings (0 = until interrupted)
        #[arg(long, short = 'n', default_value_t = 10)]
        count: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let overrides = CredentialsConfig {
        email: cli.email.clone(),
        password: cli.password.clone(),
    };

    match cli.command {
        Some(Commands::Version) => {
            println!("sense {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Monitors) => {
            if let Err(e) = run_monitors(cli.config, overrides, cli.mfa).await {
                log::error!("monitors failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Stream { monitor, count }) => {
            if let Err(e) = run_stream(cli.config, overrides, cli.mfa, monitor, count).await {
                log::error!("stream failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// Authenticate every resolved account.
async fn connect_all(
    config_path: Option<PathBuf>,
    overrides: CredentialsConfig,
    mfa: Option<String>,
) -> anyhow::Result<Vec<Client>> {
    let (config, path) = sense::config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    let accounts = sense::config::resolve_credentials(&config, overrides);
    if accounts.is_empty() {
        anyhow::bail!(
            "no credentials: set --email/--password, SENSE_EMAIL/SENSE_PASSWORD, or accounts in {}",
            path.display()
        );
    }

    let mut clients = Vec::with_capacity(accounts.len());
    for account in &accounts {
        let Some(mut creds) = account.to_credentials() else {
            log::warn!("skipping account without an email");
            continue;
        };
        if let Some(code) = &mfa {
            creds = creds.with_mfa(Arc::new(MfaCode(code.clone())));
        }
        let client = Client::connect(Some(&creds), config.api.client_options())
            .await
            .map_err(|e| anyhow::anyhow!("{}: {}", creds.email, e))?;
        clients.push(client);
    }
    Ok(clients)
}

async fn run_monitors(
    config_path: Option<PathBuf>,
    overrides: CredentialsConfig,
    mfa: Option<String>,
) -> anyhow::Result<()> {
    for client in connect_all(config_path, overrides, mfa).await? {
        println!("account {} (user {})", client.account_id(), client.user_id());
        for m in client.monitors() {
            println!("  monitor {}  serial {}", m.id, m.serial_number);
        }
    }
    Ok(())
}

async fn run_stream(
    config_path: Option<PathBuf>,
    overrides: CredentialsConfig,
    mfa: Option<String>,
    monitor: Option<i64>,
    count: usize,
) -> anyhow::Result<()> {
    let clients = connect_all(config_path, overrides, mfa).await?;
    let (client, monitor_id) = match monitor {
        Some(id) => {
            let client = clients
                .iter()
                .find(|c| c.monitors().iter().any(|m| m.id == id))
                .or_else(|| clients.first())
                .ok_or_else(|| anyhow::anyhow!("no account available"))?;
            (client, id)
        }
        None => clients
            .iter()
            .find_map(|c| c.monitors().first().map(|m| (c, m.id)))
            .ok_or_else(|| anyhow::anyhow!("no monitors on any account"))?,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupted");
                cancel.cancel();
            }
        });
    }

    let mut seen = 0usize;
    client
        .stream(monitor_id, &cancel, |_: &CancellationToken, msg: Message| {
            match msg {
                Message::RealtimeUpdate(rt) => {
                    println!("  W: {:.1}", rt.w);
                    seen += 1;
                    if count > 0 && seen >= count {
                        return Flow::Stop;
                    }
                }
                other => log::debug!("{} message", other.message_type()),
            }
            Flow::Continue
        })
        .await?;
    Ok(())
}
