use anyhow::{anyhow, Context, Result};
use audit_core::{now_ms, Credential, DAY_MS};
use audit_store::Db;
use clap::{Parser, Subcommand, ValueEnum};
use credentials::{import_json_lines, import_tsv, Imported};
use ssh_auditor::config::{self, Config};
use ssh_auditor::report::{write_hosts_csv, write_text, write_vulnerabilities_tsv};
use ssh_auditor::{Auditor, DiscoverRequest, FileLogSearcher};
use ssh_auth::SshAuthenticator;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ImportFormat { Tsv, Json }

#[derive(Debug, Parser)]
#[command(name = "ssh-auditor", version, about = "Audit SSH servers for weak credentials")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./ssh-auditor.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum CredentialCmd {
    /// Add or update a credential
    Add {
        user: String,
        password: String,
        /// How often to re-test this credential, in days
        #[arg(long, default_value_t = credentials::DEFAULT_SCAN_INTERVAL)]
        scan_interval: i64,
    },
    /// List credentials (JSON lines)
    List,
    /// Load credentials from stdin
    Import {
        #[arg(value_enum)]
        format: ImportFormat,
    },
    /// Delete a credential and its test history
    Delete { user: String, password: String },
}

#[derive(Debug, Subcommand)]
enum HostCmd {
    /// List hosts (CSV)
    List {
        /// List hosts seen at most this many days ago
        #[arg(long, default_value_t = 14)]
        max_age_days: i64,
    },
    /// Delete a host and its test history
    Delete { hostport: String },
    /// Show recorded fingerprint/version changes (JSON lines)
    Changes { hostport: Option<String> },
}

#[derive(Debug, Subcommand)]
enum LogcheckCmd {
    /// Trigger one failed login per recently seen host
    Run {
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Cross-reference active hosts with addresses found in central logs
    Report {
        /// File of addresses seen by the log collector, one per line
        #[arg(long, value_name = "FILE")]
        ips: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Print a sample configuration file
    Config,
    /// Find SSH servers and record their banners and host keys
    Discover {
        /// Addresses or CIDR blocks to sweep
        ranges: Vec<String>,
        /// Read additional ranges from stdin, one per line
        #[arg(long)]
        stdin: bool,
        /// Subnets to exclude from discovery
        #[arg(short = 'x', long, value_delimiter = ',')]
        exclude: Vec<String>,
        /// Ports to check: comma/range list (e.g., 22,2222 or 2200-2210)
        #[arg(short, long)]
        ports: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Test credentials that are due against known hosts
    Scan {
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Re-test previously successful credentials
    Rescan {
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// List vulnerable host/credential pairs
    Vuln {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Show hosts sharing the same host key
    Dupes,
    /// Full audit report
    Report {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Manage credentials
    Credential {
        #[command(subcommand)]
        cmd: CredentialCmd,
    },
    /// Manage hosts
    Host {
        #[command(subcommand)]
        cmd: HostCmd,
    },
    /// Verify that servers ship failed-login logs to a central collector
    Logcheck {
        #[command(subcommand)]
        cmd: LogcheckCmd,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Version => {
            println!("ssh-auditor {} (core {})", env!("CARGO_PKG_VERSION"), audit_core::version());
            return Ok(());
        }
        Commands::Config => {
            print!("{}", config::sample_config());
            return Ok(());
        }
        _ => {}
    }

    let db_path = cfg.db_path(cli.db);
    let mut db = Db::open_or_create(&db_path)?;

    match cli.command {
        Commands::Version | Commands::Config => {}
        Commands::Credential { cmd } => credential_cmd(&mut db, cmd)?,
        Commands::Host { cmd } => host_cmd(&mut db, cmd)?,
        Commands::Dupes => {
            let tx = db.begin()?;
            let dupes = tx.duplicate_keys()?;
            println!("{}", serde_json::to_string_pretty(&dupes)?);
        }
        Commands::Vuln { format } => {
            let tx = db.begin()?;
            let vulns = tx.vulnerabilities()?;
            let mut out = io::stdout().lock();
            match format {
                OutputFormat::Text => write_vulnerabilities_tsv(&mut out, &vulns)?,
                OutputFormat::Json => {
                    for v in &vulns {
                        writeln!(out, "{}", serde_json::to_string(v)?)?;
                    }
                }
            }
        }
        command => audit_cmd(db, &cfg, command)?,
    }
    Ok(())
}

/// Commands that drive the network pipelines.
fn audit_cmd(db: Db, cfg: &Config, command: Commands) -> Result<()> {
    let opts = cfg.audit_options()?;
    let auth = Arc::new(SshAuthenticator::new(opts.auth.clone()));
    let mut auditor = Auditor::new(db, auth, opts);
    let rt = tokio::runtime::Runtime::new()?;

    match command {
        Commands::Discover { mut ranges, stdin, exclude, ports, concurrency } => {
            if stdin {
                for line in io::stdin().lock().lines() {
                    let line = line?;
                    let line = line.trim();
                    if !line.is_empty() && !line.starts_with('#') {
                        ranges.push(line.to_string());
                    }
                }
            }
            if ranges.is_empty() {
                return Err(anyhow!("provide at least one address or CIDR block"));
            }
            let ports = host_discovery::parse_ports(&cfg.ports(ports))?;
            let req = DiscoverRequest {
                include: ranges,
                exclude,
                ports,
                concurrency: cfg.discover_concurrency(concurrency),
            };
            rt.block_on(auditor.discover(&req))?;
        }
        Commands::Scan { concurrency } => {
            rt.block_on(auditor.scan(cfg.scan_concurrency(concurrency)))?;
        }
        Commands::Rescan { concurrency } => {
            rt.block_on(auditor.rescan(cfg.scan_concurrency(concurrency)))?;
        }
        Commands::Report { format } => {
            let report = auditor.report()?;
            let mut out = io::stdout().lock();
            match format {
                OutputFormat::Text => write_text(&mut out, &report)?,
                OutputFormat::Json => writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?,
            }
        }
        Commands::Logcheck { cmd: LogcheckCmd::Run { concurrency } } => {
            rt.block_on(auditor.logcheck_run(cfg.scan_concurrency(concurrency)))?;
        }
        Commands::Logcheck { cmd: LogcheckCmd::Report { ips } } => {
            let entries = auditor.logcheck_report(&FileLogSearcher::new(ips))?;
            let mut out = io::stdout().lock();
            for e in entries {
                writeln!(out, "{} {}", e.hostport, e.in_logs)?;
            }
        }
        other => return Err(anyhow!("unexpected command {other:?}")),
    }
    Ok(())
}

fn credential_cmd(db: &mut Db, cmd: CredentialCmd) -> Result<()> {
    match cmd {
        CredentialCmd::Add { user, password, scan_interval } => {
            let tx = db.begin()?;
            let added = tx.add_credential(&Credential::new(&user, password, scan_interval))?;
            tx.commit()?;
            if added {
                info!(user = %user, interval = scan_interval, "added credential");
            } else {
                info!(user = %user, interval = scan_interval, "updated credential");
            }
        }
        CredentialCmd::List => {
            let tx = db.begin()?;
            let mut out = io::stdout().lock();
            for c in tx.all_credentials()? {
                writeln!(out, "{}", serde_json::to_string(&c)?)?;
            }
        }
        CredentialCmd::Import { format } => {
            let stdin = io::stdin().lock();
            let Imported { credentials, rejected } = match format {
                ImportFormat::Tsv => import_tsv(stdin, credentials::DEFAULT_SCAN_INTERVAL),
                ImportFormat::Json => import_json_lines(stdin, credentials::DEFAULT_SCAN_INTERVAL),
            };
            for r in &rejected {
                warn!(line = r.line, reason = %r.reason, "invalid record");
            }
            let tx = db.begin()?;
            let mut added = 0usize;
            for c in &credentials {
                if tx.add_credential(c).context("import credential")? {
                    added += 1;
                }
            }
            tx.commit()?;
            info!(added, updated = credentials.len() - added, rejected = rejected.len(), "imported credentials");
        }
        CredentialCmd::Delete { user, password } => {
            let tx = db.begin()?;
            let deleted = tx.delete_credential(&user, &password)?;
            tx.commit()?;
            if !deleted {
                return Err(anyhow!("no such credential for user {user}"));
            }
            info!(user = %user, "deleted credential");
        }
    }
    Ok(())
}

fn host_cmd(db: &mut Db, cmd: HostCmd) -> Result<()> {
    match cmd {
        HostCmd::List { max_age_days } => {
            let tx = db.begin()?;
            let hosts = tx.active_hosts(now_ms() - max_age_days * DAY_MS)?;
            write_hosts_csv(io::stdout().lock(), &hosts)?;
        }
        HostCmd::Delete { hostport } => {
            let tx = db.begin()?;
            let deleted = tx.delete_host(&hostport)?;
            tx.commit()?;
            if !deleted {
                return Err(anyhow!("no such host {hostport}"));
            }
            info!(host = %hostport, "deleted host");
        }
        HostCmd::Changes { hostport } => {
            let tx = db.begin()?;
            let mut out = io::stdout().lock();
            for c in tx.host_changes(hostport.as_deref())? {
                writeln!(out, "{}", serde_json::to_string(&c)?)?;
            }
        }
    }
    Ok(())
}
