use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vanish_crypto::IdentityKeyPair;
use vanish_session::{spawn_purge_loop, IdentityService, PurgeJob};
use vanish_store::{KeyFile, SqliteStore, Vault};
use zeroize::Zeroizing;

mod paths;
mod settings;

use crate::settings::CliSettings;

const MIN_PASSPHRASE_LEN: usize = 12;

#[derive(Parser, Debug)]
#[command(author, version, about = "Vanish maintenance and key tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Delete used-up view-once and expired records from the store
    Purge {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Repeat every SECS seconds until Ctrl-C instead of running once
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
        /// Use the interval from settings (default 60 s)
        #[arg(long, conflicts_with = "interval")]
        watch: bool,
    },
    /// Create a passphrase-sealed identity key file
    Keygen {
        #[arg(long)]
        user: String,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = vanish_crypto::identity::DEFAULT_MODULUS_BITS)]
        bits: usize,
    },
    /// Print a key file's user id, fingerprint and public key
    Fingerprint {
        #[arg(long)]
        keyfile: PathBuf,
    },
    /// Unlock a key file and republish its public key to the store's directory
    Publish {
        #[arg(long)]
        keyfile: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("vanish_cli=info,vanish_session=info,vanish_store=info")
            }),
        )
        .init();

    let cli = Cli::parse();
    let settings = CliSettings::load()?;
    match cli.command {
        Commands::Purge { db, interval, watch } => {
            let every = match (interval, watch) {
                (Some(secs), _) => Some(std::time::Duration::from_secs(secs.max(1))),
                (None, true) => Some(settings.purge_interval()),
                (None, false) => None,
            };
            purge_command(db.map_or_else(|| settings.db_path(), Ok)?, every).await
        }
        Commands::Keygen { user, out, bits } => {
            let out = match out {
                Some(p) => p,
                None => settings.key_dir()?.join(format!("{user}.json")),
            };
            keygen_command(user, out, bits).await
        }
        Commands::Fingerprint { keyfile } => fingerprint_command(keyfile),
        Commands::Publish { keyfile, db } => {
            publish_command(keyfile, db.map_or_else(|| settings.db_path(), Ok)?).await
        }
    }
}

async fn open_store(db: &std::path::Path) -> Result<SqliteStore> {
    if let Some(parent) = db.parent() {
        std::fs::create_dir_all(parent)?;
    }
    SqliteStore::open(db)
        .await
        .with_context(|| format!("opening {}", db.display()))
}

async fn purge_command(db: PathBuf, every: Option<std::time::Duration>) -> Result<()> {
    let store = open_store(&db).await?;
    let job = PurgeJob::new(Arc::new(store.clone()));

    let Some(interval) = every else {
        let purged = job.run(Utc::now()).await?;
        println!("{purged}");
        store.close().await;
        return Ok(());
    };

    let (task, handle) = spawn_purge_loop(job, interval, |count| {
        if count > 0 {
            println!("{count}");
        }
    });
    info!(db = %db.display(), "purge loop running; Ctrl-C to stop");
    signal::ctrl_c().await?;
    info!("purge loop stopping");
    let _ = handle.shutdown_tx.send(true);
    task.await?;
    store.close().await;
    Ok(())
}

async fn keygen_command(user: String, out: PathBuf, bits: usize) -> Result<()> {
    if out.exists() {
        return Err(anyhow!("key file already exists at {}", out.display()));
    }
    let passphrase = prompt_passphrase_twice("Create key passphrase")?;
    println!("Generating {bits}-bit identity key...");
    let key_file = tokio::task::spawn_blocking(move || -> Result<KeyFile> {
        let identity = IdentityKeyPair::generate_with_bits(bits)?;
        Ok(KeyFile::seal(&user, &identity, passphrase.as_bytes())?)
    })
    .await??;
    key_file.save(&out)?;
    println!("Key file written: {}", out.display());
    println!("Fingerprint: {}", key_file.fingerprint()?);
    Ok(())
}

fn fingerprint_command(keyfile: PathBuf) -> Result<()> {
    let key_file = KeyFile::load(&keyfile)
        .with_context(|| format!("reading {}", keyfile.display()))?;
    println!("User: {}", key_file.user_id);
    println!("Fingerprint: {}", key_file.fingerprint()?);
    println!("Public key: {}", key_file.public_key);
    Ok(())
}

async fn publish_command(keyfile: PathBuf, db: PathBuf) -> Result<()> {
    let key_file = KeyFile::load(&keyfile)
        .with_context(|| format!("reading {}", keyfile.display()))?;
    let passphrase = prompt_passphrase_once("Key passphrase")?;
    let vault = Vault::with_auto_lock(0);
    vault
        .unlock(&key_file, passphrase.as_bytes())
        .await
        .map_err(|e| anyhow!("unlock failed: {e}"))?;

    let store = open_store(&db).await?;
    let identity = IdentityService::new(&key_file.user_id, vault.clone(), Arc::new(store.clone()));
    identity.repair().await?;
    vault.lock().await;
    store.close().await;
    println!("Published public key for {}", key_file.user_id);
    Ok(())
}

fn prompt_passphrase_once(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("VANISH_PASSPHRASE") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = Zeroizing::new(
        rpassword::prompt_password(format!("{prompt}: "))
            .map_err(|e| anyhow!("passphrase prompt: {e}"))?,
    );
    if pw.len() < MIN_PASSPHRASE_LEN {
        return Err(anyhow!(
            "passphrase too short; minimum {MIN_PASSPHRASE_LEN} characters"
        ));
    }
    Ok(pw)
}

fn prompt_passphrase_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("VANISH_PASSPHRASE") {
        if !pw.is_empty() {
            if let Ok(confirm) = std::env::var("VANISH_PASSPHRASE_CONFIRM") {
                if confirm != pw {
                    return Err(anyhow!("passphrase confirmation mismatch"));
                }
            }
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = prompt_passphrase_once(prompt)?;
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm passphrase: ")
            .map_err(|e| anyhow!("passphrase prompt: {e}"))?,
    );
    if *first != *second {
        return Err(anyhow!("passphrases do not match"));
    }
    Ok(first)
}
