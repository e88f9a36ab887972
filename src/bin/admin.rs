//! CairnKV Admin Binary
//!
//! Offline inspection and maintenance of a CairnKV data directory.

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cairnkv::persistence::{domain_file_path, read_with_fallback};
use cairnkv::{CairnError, Config, DomainKind, DomainSpec, Result, Store};

/// CairnKV Admin
#[derive(Parser, Debug)]
#[command(name = "cairnkv-admin")]
#[command(about = "Inspect and maintain a CairnKV data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./cairnkv_data")]
    data_dir: String,

    /// Legacy combined file inside the data directory
    #[arg(long, default_value = "store.json")]
    legacy_file: String,

    /// Extra entries domain, as NAME or NAME:PREFIX (repeatable)
    #[arg(long = "domain", value_name = "NAME[:PREFIX]")]
    domains: Vec<String>,

    /// Extra streams domain, as NAME or NAME:PREFIX (repeatable)
    #[arg(long = "stream-domain", value_name = "NAME[:PREFIX]")]
    stream_domains: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Split the legacy combined file into per-domain files
    Migrate,

    /// List domain files with record counts
    Domains,

    /// Pretty-print every record of a domain
    Dump {
        /// The domain to dump
        domain: String,
    },

    /// Get an entry by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a scalar entry and save its domain
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,

        /// Expire after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Delete an entry and save its domain
    Del {
        /// The key to delete
        key: String,
    },

    /// Print the records of a stream
    Xrange {
        /// The stream to read
        stream: String,

        /// First id (inclusive), `-` for the beginning
        #[arg(long, default_value = "-")]
        start: String,

        /// Last id (inclusive), `+` for the end
        #[arg(long, default_value = "+")]
        end: String,

        /// Maximum number of records
        #[arg(short, long)]
        count: Option<usize>,
    },
}

fn main() {
    // Logs go to stderr so command output stays pipeable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cairnkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    tracing::debug!("CairnKV Admin v{}", cairnkv::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;

    // Read-only commands look at the files without loading the store
    match &args.command {
        Commands::Domains => return list_domains(&config),
        Commands::Dump { domain } => return dump_domain(&config, domain),
        _ => {}
    }

    let store = Store::open(config)?;
    let report = store.connect()?;

    match args.command {
        Commands::Migrate => {
            if report.migrated.is_empty() {
                println!("nothing to migrate");
            }
            for domain in &report.migrated {
                println!("migrated {}", domain);
            }
            store.flush_all()?;
        }
        Commands::Get { key } => print_entry(&store, &key)?,
        Commands::Set { key, value, ttl } => {
            match ttl {
                Some(secs) => {
                    store.set_with_ttl(&key, &value, std::time::Duration::from_secs(secs))?
                }
                None => store.set(&key, &value)?,
            }
            store.save_domain_now(store.entry_domain(&key))?;
            println!("OK");
        }
        Commands::Del { key } => {
            let existed = store.delete(&key)?;
            store.save_domain_now(store.entry_domain(&key))?;
            println!("{}", if existed { 1 } else { 0 });
        }
        Commands::Xrange {
            stream,
            start,
            end,
            count,
        } => {
            for record in store.range(&stream, &start, &end, count)? {
                let fields: Vec<String> = record
                    .fields
                    .iter()
                    .map(|(f, v)| format!("{}={}", f, v))
                    .collect();
                println!("{} {}", record.id, fields.join(" "));
            }
        }
        Commands::Domains | Commands::Dump { .. } => {}
    }

    store.quit();
    Ok(())
}

fn build_config(args: &Args) -> Result<Config> {
    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .legacy_file(&args.legacy_file);

    for raw in &args.domains {
        builder = builder.domain(parse_domain(raw, DomainKind::Entries)?);
    }
    for raw in &args.stream_domains {
        builder = builder.domain(parse_domain(raw, DomainKind::Streams)?);
    }

    let config = builder.build();
    config.validate()?;
    Ok(config)
}

fn parse_domain(raw: &str, kind: DomainKind) -> Result<DomainSpec> {
    let (name, prefix) = match raw.split_once(':') {
        Some((name, prefix)) => (name, Some(prefix)),
        None => (raw, None),
    };
    if name.is_empty() {
        return Err(CairnError::Config(format!("invalid domain '{}'", raw)));
    }

    let spec = DomainSpec::new(name, kind);
    Ok(match prefix {
        Some(prefix) if !prefix.is_empty() => spec.with_prefix(prefix),
        _ => spec,
    })
}

fn list_domains(config: &Config) -> Result<()> {
    for spec in &config.domains {
        let path = domain_file_path(&config.data_dir, &spec.name);
        match read_with_fallback(&path, spec)? {
            Some((document, source)) => println!(
                "{:<16} {:<8} {:>8} records  lastSaved={}  ({:?})",
                spec.name,
                format!("{:?}", spec.kind),
                document.records.len(),
                document
                    .last_saved
                    .map_or_else(|| "-".to_string(), |t| t.to_string()),
                source
            ),
            None => println!("{:<16} {:<8} (no file)", spec.name, format!("{:?}", spec.kind)),
        }
    }
    Ok(())
}

fn dump_domain(config: &Config, domain: &str) -> Result<()> {
    let spec = config
        .domains
        .iter()
        .find(|spec| spec.name == domain)
        .ok_or_else(|| CairnError::NotFound(format!("domain '{}'", domain)))?;

    let path = domain_file_path(&config.data_dir, &spec.name);
    let Some((document, _)) = read_with_fallback(&path, spec)? else {
        return Err(CairnError::NotFound(format!("file for domain '{}'", domain)));
    };

    println!("{}", serde_json::to_string_pretty(&document.records)?);
    Ok(())
}

fn print_entry(store: &Store, key: &str) -> Result<()> {
    match store.get(key) {
        Ok(Some(value)) => println!("{}", value),
        Ok(None) => println!("(nil)"),
        Err(CairnError::TypeMismatch { found: "hash", .. }) => {
            let mut fields: Vec<_> = store.hash_get_all(key)?.into_iter().collect();
            fields.sort();
            for (field, value) in fields {
                println!("{}={}", field, value);
            }
        }
        Err(CairnError::TypeMismatch { found: "set", .. }) => {
            let mut members = store.members(key)?;
            members.sort();
            for member in members {
                println!("{}", member);
            }
        }
        Err(e) => return Err(e),
    }

    if let Some(ttl) = store.ttl(key)? {
        println!("(expires in {}s)", ttl.as_secs());
    }
    Ok(())
}
