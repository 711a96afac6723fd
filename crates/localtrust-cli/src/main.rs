//! Localtrust CLI - Certificate lifecycle management for local development

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use localtrust_chain::validate;
use localtrust_keygen::Password;
use localtrust_lifecycle::{
    full_setup, install_only, FingerprintReference, InstallConfig, SetupConfig, SetupOutcome,
};
use localtrust_store::{IdentityStore, StoreLocationConfig, StoreMode, StoreName};

const EXIT_FAILURE: i32 = 1;
const EXIT_WARNINGS: i32 = 2;

/// Localtrust - Generate, install and validate local TLS identities
#[derive(Parser, Debug)]
#[command(name = "localtrust")]
#[command(about = "Certificate lifecycle management for local development", long_about = None)]
#[command(version)]
struct Cli {
    /// Base directory for stores and artifacts (default: ~/.localtrust)
    #[arg(long, env = "LOCALTRUST_HOME")]
    home: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a root CA and server certificate, install both and validate
    Setup {
        /// Common name for the server certificate
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// Subject alternative names (repeatable)
        #[arg(long = "san", default_values_t = [
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ])]
        sans: Vec<String>,

        /// Root CA validity in days
        #[arg(long, default_value_t = 730)]
        root_days: u32,

        /// Server certificate validity in days
        #[arg(long, default_value_t = 365)]
        leaf_days: u32,

        /// Bundle password (generated and written to the artifact
        /// directory when omitted)
        #[arg(long, env = "LOCALTRUST_BUNDLE_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Keep existing same-subject roots instead of replacing them
        #[arg(long)]
        no_cleanup: bool,

        /// Regenerate even if a valid identity is already installed
        #[arg(long)]
        force: bool,
    },

    /// Install pre-generated certificates and a key bundle
    Install {
        /// Directory holding root certificates and the bundle
        #[arg(long)]
        source_dir: PathBuf,

        /// Fingerprint of the bundle to install (required when the source
        /// directory holds more than one)
        #[arg(long, env = "LOCALTRUST_FINGERPRINT")]
        fingerprint: Option<String>,

        /// Bundle password
        #[arg(long, env = "LOCALTRUST_BUNDLE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Validate an installed certificate chain against the trust store
    Validate {
        /// Fingerprint of the leaf to validate (default: the recorded
        /// active fingerprint)
        #[arg(long, env = "LOCALTRUST_FINGERPRINT")]
        fingerprint: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(EXIT_FAILURE);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(EXIT_FAILURE);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let location = match cli.home {
        Some(home) => StoreLocationConfig::with_base_dir(home),
        None => StoreLocationConfig::resolve().context("resolving the store location")?,
    };
    let base_dir = location.base_dir().to_path_buf();
    let store = IdentityStore::new(location);

    match cli.command {
        Command::Setup {
            common_name,
            sans,
            root_days,
            leaf_days,
            password,
            no_cleanup,
            force,
        } => {
            let mut config = SetupConfig::new(&base_dir);
            config.leaf_subject = localtrust_keygen::SubjectInfo::new(common_name);
            config.sans = sans;
            config.root_validity_days = root_days;
            config.leaf_validity_days = leaf_days;
            config.password = password
                .map(Password::new)
                .transpose()
                .context("bundle password")?;
            config.cleanup_existing_roots = !no_cleanup;
            config.force = force;
            let output_dir = config.output_dir.clone();

            match full_setup(&store, config)? {
                SetupOutcome::AlreadySatisfied { fingerprint } => {
                    info!("identity {fingerprint} is already installed and valid");
                }
                SetupOutcome::Completed {
                    root_fingerprint,
                    leaf_fingerprint,
                    password_generated,
                } => {
                    info!("root CA installed: {root_fingerprint}");
                    info!("server certificate installed: {leaf_fingerprint}");
                    info!("artifacts written to {}", output_dir.display());
                    if password_generated {
                        warn!(
                            "bundle password was generated, see {}",
                            output_dir.join("bundle-password.txt").display()
                        );
                    }
                }
            }
            Ok(0)
        }

        Command::Install {
            source_dir,
            fingerprint,
            password,
        } => {
            let outcome = install_only(
                &store,
                InstallConfig {
                    source_dir,
                    fingerprint,
                    password: Password::new(password).context("bundle password")?,
                    reference_path: base_dir.join("active-fingerprint"),
                },
            )?;
            info!("installed identity {}", outcome.fingerprint);
            if outcome.warnings.is_empty() {
                Ok(0)
            } else {
                for warning in &outcome.warnings {
                    warn!("{warning}");
                }
                Ok(EXIT_WARNINGS)
            }
        }

        Command::Validate { fingerprint } => {
            let fingerprint = match fingerprint {
                Some(fingerprint) => fingerprint,
                None => FingerprintReference::new(base_dir.join("active-fingerprint"))
                    .read()?
                    .context("no fingerprint given and no active fingerprint recorded")?,
            };

            let personal = store
                .open(StoreName::Personal, StoreMode::ReadOnly)
                .context("opening the personal store")?;
            let leaf_der = personal
                .certificate_bytes(&fingerprint)
                .context("loading the leaf certificate")?;
            let roots = store
                .open(StoreName::RootTrust, StoreMode::ReadOnly)
                .context("opening the root trust store")?;

            let result = validate(&leaf_der, &roots)?;
            for element in &result.elements {
                info!(
                    "{} {} (issued by {})",
                    element.fingerprint, element.subject, element.issuer
                );
            }
            let statuses = result
                .status_codes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");

            if !result.valid {
                tracing::error!("chain is invalid: {statuses}");
                Ok(EXIT_FAILURE)
            } else if result.untrusted_root_only() {
                warn!("chain is complete but its root is not trusted");
                Ok(EXIT_WARNINGS)
            } else {
                info!("chain is valid: {statuses}");
                Ok(0)
            }
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
