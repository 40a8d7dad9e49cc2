use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kitty_tunnel::{spawn_tunnel, ClientEvent, Settings, VerifyMode};

/// Fetch one HTTPS page through an HTTPS proxy (TLS inside TLS)
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Settings file, created with defaults if missing
    #[arg(short, long, default_value = "kitty_tunnel.toml")]
    config: PathBuf,

    /// Proxy host
    #[arg(long)]
    proxy_host: Option<String>,

    /// Proxy port
    #[arg(long)]
    proxy_port: Option<u16>,

    #[arg(short = 'u', long)]
    username: Option<String>,

    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Extra root certificate (PEM or DER)
    #[arg(long, value_name = "PATH")]
    ca_cert: Option<String>,

    /// Only warn about an untrusted target certificate
    #[arg(long)]
    insecure_target: bool,

    /// Overall deadline in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save: bool,

    /// Target URL; defaults to the last one used
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let mut settings = Settings::load_or_default(&cli.config)?;
    if let Some(host) = cli.proxy_host {
        settings.proxy.host = host;
    }
    if let Some(port) = cli.proxy_port {
        settings.proxy.port = port;
    }
    if let Some(username) = cli.username {
        settings.proxy.username = username;
    }
    if let Some(password) = cli.password {
        settings.proxy.password = password;
    }
    if let Some(path) = cli.ca_cert {
        settings.tls.certificate_path = path;
    }
    if cli.insecure_target {
        settings.tls.target_verify = VerifyMode::AcceptAny;
    }
    if let Some(secs) = cli.timeout {
        settings.timeout_secs = secs;
    }
    if let Some(url) = cli.url {
        settings.last_url = url;
    }
    if cli.save {
        settings
            .save(&cli.config)
            .with_context(|| format!("saving {}", cli.config.display()))?;
    }

    let (handle, mut events, task) = spawn_tunnel(
        settings.proxy_settings(),
        settings.trust_config(),
        Duration::from_secs(settings.timeout_secs),
    );
    handle.start(&settings.last_url).await?;

    let result = loop {
        match events.recv().await {
            Some(ClientEvent::Started) => println!("Request started"),
            Some(ClientEvent::DebugTrace(line)) => println!("{}", line),
            Some(ClientEvent::SecurityWarning(warning)) => eprintln!("warning: {}", warning),
            Some(ClientEvent::Finished(result)) => break result,
            None => anyhow::bail!("tunnel stopped without a result"),
        }
    };
    drop(handle);
    let _ = task.await;

    match result {
        Ok(report) => {
            println!("\n{}", report.rendered);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
