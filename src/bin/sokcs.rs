use anyhow::Context;
use clap::Parser;
use sokcs::{Authority, LoggingInspector, ProxyConfig, ProxyServer, RootIdentity, StaticCredentials};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Intercepting SOCKS4a/SOCKS5 and HTTP forward proxy
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
  /// IP address both listeners bind to
  #[arg(long, default_value = "0.0.0.0")]
  listen_ip: IpAddr,

  /// SOCKS4a/5 listen port
  #[arg(long, default_value_t = sokcs::DEFAULT_SOCKS_PORT)]
  socks_port: u16,

  /// HTTP proxy listen port
  #[arg(long, default_value_t = sokcs::DEFAULT_HTTP_PORT)]
  http_port: u16,

  /// Require proxy credentials (format: user:pass)
  #[arg(long, value_name = "USER:PASS")]
  auth: Option<String>,

  /// Decrypt CONNECT tunnels and log every request
  #[arg(long)]
  intercept: bool,

  /// Directory holding ca.crt and ca_private.der, created with a default root when missing
  #[arg(long, default_value = ".")]
  ca_dir: PathBuf,

  /// Outbound connect timeout in seconds
  #[arg(long, default_value_t = 15)]
  connect_timeout: u64,

  /// Realm sent with 407 challenges
  #[arg(long, default_value = "sokcs")]
  realm: String,

  /// Worker threads (defaults to available parallelism)
  #[arg(long)]
  workers: Option<usize>,
}

fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(tracing_subscriber::fmt::layer())
    .init();

  let cli = Cli::parse();
  let mut runtime = tokio::runtime::Builder::new_multi_thread();
  if let Some(workers) = cli.workers {
    runtime.worker_threads(workers);
  }
  let runtime = runtime.enable_all().build().context("failed to start runtime")?;
  runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
  let config = ProxyConfig {
    socks_addr: SocketAddr::new(cli.listen_ip, cli.socks_port),
    http_addr: SocketAddr::new(cli.listen_ip, cli.http_port),
    connect_timeout: Duration::from_secs(cli.connect_timeout),
    realm: cli.realm.clone(),
    ..Default::default()
  };
  let mut builder = ProxyServer::builder().config(config);
  if let Some(auth) = &cli.auth {
    let (username, password) = auth
      .split_once(':')
      .context("--auth expects user:pass")?;
    builder = builder.authenticator(StaticCredentials::new(username, password));
  }
  if cli.intercept {
    let root = load_or_create_root(&cli.ca_dir).await?;
    tracing::info!("forging leaves as {}", root.subject());
    builder = builder
      .authority(Authority::new(root))
      .inspector(LoggingInspector);
  }
  let server = builder.build()?;
  tracing::info!(
    "outbound connect timeout {:?}, credentials {}",
    server.config().connect_timeout,
    if cli.auth.is_some() { "required" } else { "off" }
  );
  server.run().await?;
  Ok(())
}

async fn load_or_create_root(dir: &Path) -> anyhow::Result<RootIdentity> {
  if dir.join(sokcs::ca::ROOT_CERT_FILE).exists() {
    return RootIdentity::load_dir(dir)
      .await
      .with_context(|| format!("failed to load root from {}", dir.display()));
  }
  let root = RootIdentity::generate_default()?;
  root.save_dir(dir).await?;
  tracing::info!(
    "generated root {} in {}, install it in the client trust store",
    dir.join(sokcs::ca::ROOT_CERT_FILE).display(),
    dir.display()
  );
  Ok(root)
}
