use std::{
    future::Future,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use acme_dns01::{
    cancellation, AcmeGateway, CancelHandle, Cancellation, Checkpoint, ConsolePrompt, DigResolver,
    DirectoryUrl, HickoryResolver, IssuanceRequest, IssuedCertificate, Orchestrator,
    PropagationPolicy, TxtResolver, Unattended,
};
use clap::{Parser, ValueEnum};
use eyre::WrapErr as _;
use tokio::io::AsyncWriteExt as _;

const CERTIFICATE_FILE: &str = "certificate.pem";
const PRIVATE_KEY_FILE: &str = "private-key.pem";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Environment {
    Staging,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ResolverKind {
    /// Built-in resolver library.
    Hickory,

    /// `dig` from PATH.
    Dig,
}

/// Issue a Let's Encrypt certificate for one domain using a manually published DNS-01 record.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Domain to issue the certificate for.
    #[arg(long, env = "DOMAIN")]
    domain: String,

    /// Contact email for the ACME account.
    #[arg(long, env = "EMAIL")]
    email: Option<String>,

    /// Let's Encrypt environment.
    #[arg(long, env = "ACME_ENVIRONMENT", value_enum, default_value_t = Environment::Staging)]
    environment: Environment,

    /// ACME directory URL, overrides --environment.
    #[arg(long, env = "ACME_DIRECTORY_URL")]
    directory_url: Option<String>,

    /// How to look up the challenge record.
    #[arg(long, env = "DNS_RESOLVER", value_enum, default_value_t = ResolverKind::Hickory)]
    resolver: ResolverKind,

    /// Nameserver to query instead of the system resolver (repeatable).
    #[arg(long, env = "DNS_NAMESERVER", value_delimiter = ',')]
    nameserver: Vec<IpAddr>,

    /// DNS lookups before giving up on propagation.
    #[arg(long, env = "PROPAGATION_MAX_ATTEMPTS", default_value_t = 30)]
    max_attempts: u32,

    /// Seconds between two DNS lookups.
    #[arg(long, env = "PROPAGATION_INTERVAL_SECS", default_value_t = 30)]
    interval_secs: u64,

    /// Directory to write certificate.pem and private-key.pem into.
    #[arg(long, env = "OUT_DIR", default_value = ".")]
    out_dir: PathBuf,

    /// Do not wait for Enter; assume the record is already published.
    #[arg(long)]
    yes: bool,
}

impl Args {
    fn directory_url(&self) -> DirectoryUrl {
        match (&self.directory_url, self.environment) {
            (Some(url), _) => DirectoryUrl::Other(url.clone()),
            (None, Environment::Staging) => DirectoryUrl::LetsEncryptStaging,
            (None, Environment::Production) => DirectoryUrl::LetsEncrypt,
        }
    }

    fn resolver(&self) -> Arc<dyn TxtResolver> {
        match self.resolver {
            ResolverKind::Hickory => Arc::new(HickoryResolver::new(&self.nameserver)),
            ResolverKind::Dig => {
                if self.nameserver.len() > 1 {
                    log::warn!("dig queries only the first nameserver");
                }

                let dig = DigResolver::new();
                match self.nameserver.first() {
                    Some(ns) => Arc::new(dig.with_nameserver(*ns)),
                    None => Arc::new(dig),
                }
            }
        }
    }

    fn checkpoint(&self) -> Arc<dyn Checkpoint> {
        if self.yes {
            Arc::new(Unattended)
        } else {
            Arc::new(ConsolePrompt)
        }
    }

    fn policy(&self) -> PropagationPolicy {
        PropagationPolicy {
            max_attempts: self.max_attempts,
            interval: Duration::from_secs(self.interval_secs),
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // real environment variables take precedence over .env
    dotenvy::dotenv().ok();

    color_eyre::install()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args = Args::parse();

    let (handle, cancel) = cancellation();
    tokio::spawn(async move {
        if handle_interrupts(tokio::signal::ctrl_c, &handle).await {
            std::process::exit(130);
        }
    });

    if let Err(err) = run(args, cancel).await {
        eprintln!("Error: {err:?}");

        // a pending stdin read would keep the runtime from shutting down
        std::process::exit(1);
    }

    Ok(())
}

/// Cancels the run on the first interrupt. Returns true on a second one.
///
/// ACME status polls do not observe cancellation, so a second interrupt is the way out.
async fn handle_interrupts<S, F>(mut next_interrupt: S, handle: &CancelHandle) -> bool
where
    S: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = next_interrupt().await {
        log::warn!("cannot listen for interrupts: {err}");
        return false;
    }

    log::warn!("interrupted, cancelling issuance (interrupt again to exit now)");
    handle.cancel();

    if next_interrupt().await.is_err() {
        return false;
    }

    log::warn!("interrupted again, exiting");
    true
}

async fn run(args: Args, cancel: Cancellation) -> eyre::Result<()> {
    let directory_url = args.directory_url();
    log::info!("using ACME directory {}", directory_url.to_url());

    let resolver = args.resolver();
    let gateway = AcmeGateway::new(directory_url, Arc::clone(&resolver));

    let mut orchestrator = Orchestrator::new(gateway, resolver, args.checkpoint())
        .with_policy(args.policy())
        .with_cancellation(cancel);

    let request = IssuanceRequest::new(args.domain.as_str(), args.email.as_deref());
    let cert = orchestrator.issue_certificate(&request).await?;

    save(&args.out_dir, &cert).await?;

    match cert.valid_days_left() {
        Ok(days) => log::info!("certificate for {} valid for {days} days", args.domain),
        Err(err) => log::warn!("could not read certificate expiry: {err:#}"),
    }

    Ok(())
}

async fn save(out_dir: &Path, cert: &IssuedCertificate) -> eyre::Result<()> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .wrap_err_with(|| format!("creating {}", out_dir.display()))?;

    let cert_path = out_dir.join(CERTIFICATE_FILE);
    tokio::fs::write(&cert_path, cert.certificate())
        .await
        .wrap_err_with(|| format!("writing {}", cert_path.display()))?;

    let key_path = out_dir.join(PRIVATE_KEY_FILE);
    write_private(&key_path, cert.private_key().as_bytes())
        .await
        .wrap_err_with(|| format!("writing {}", key_path.display()))?;

    log::info!("saved {} and {}", cert_path.display(), key_path.display());

    Ok(())
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);

    #[cfg(unix)]
    opts.mode(0o600);

    let mut file = opts.open(path).await?;

    // mode() only applies when the file is created
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;

        file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    }

    file.write_all(contents).await?;
    file.flush().await
}
