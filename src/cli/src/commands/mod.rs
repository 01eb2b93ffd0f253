//! CLI command definitions and dispatch.

mod decrypt;
mod inspect;
mod pull;
mod push;
mod version;

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use imgcrypt_core::config::{CryptConfig, LogLevel};
use imgcrypt_runtime::{Algorithm, CryptoOpts, RegistryAuth, RegistryClient};

/// imgcrypt - end-to-end encrypted container images.
#[derive(Parser)]
#[command(name = "imgcrypt", version, about)]
pub struct Cli {
    /// Configuration file (default: ~/.imgcrypt/config.yaml)
    #[arg(long, global = true, env = "IMGCRYPT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity over the configured level (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Level used when `RUST_LOG` is not set: the more verbose of the
    /// configured level and the one `-v` asks for.
    pub fn log_level(&self, configured: LogLevel) -> tracing::Level {
        let configured = tracing::Level::from(configured);
        let requested = match self.verbose {
            0 => return configured,
            1 => tracing::Level::INFO,
            _ => tracing::Level::DEBUG,
        };
        configured.max(requested)
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Encrypt a local image's private layers and push it to a registry
    Push(push::PushArgs),
    /// Pull an encrypted image and rebuild it as a loadable archive
    Pull(pull::PullArgs),
    /// Decrypt a single downloaded blob
    Decrypt(decrypt::DecryptArgs),
    /// Show the blobs of a remote image and which are encrypted
    Inspect(inspect::InspectArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI command to its handler.
pub async fn dispatch(cli: Cli, config: &CryptConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Push(args) => push::execute(args, config).await,
        Command::Pull(args) => pull::execute(args, config).await,
        Command::Decrypt(args) => decrypt::execute(args).await,
        Command::Inspect(args) => inspect::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

/// Key-wrapping options shared by commands that touch keys.
#[derive(Args, Debug, Clone)]
pub struct CryptoArgs {
    /// Key-wrapping algorithm: PBKDF2-AES256-GCM or NONE
    #[arg(long, default_value = "PBKDF2-AES256-GCM")]
    pub algorithm: Algorithm,

    /// Carry wrapped keys in descriptor URLs (legacy manifest format)
    #[arg(long)]
    pub compat: bool,

    /// Passphrase protecting the data keys
    #[arg(long, env = "IMGCRYPT_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,
}

impl CryptoArgs {
    pub fn to_opts(&self) -> Result<CryptoOpts, Box<dyn std::error::Error>> {
        let mut opts = CryptoOpts::new(self.algorithm, self.compat);
        match (self.algorithm, &self.passphrase) {
            (Algorithm::None, _) => {
                tracing::warn!("Algorithm NONE stores data keys in the clear; the image is not protected");
            }
            (_, Some(passphrase)) if !passphrase.is_empty() => opts.set_passphrase(passphrase.as_str()),
            _ => {
                return Err(format!(
                    "{} needs a passphrase: pass --passphrase or set IMGCRYPT_PASSPHRASE",
                    self.algorithm
                )
                .into())
            }
        }
        Ok(opts)
    }
}

/// Registry client for `config`, with credentials from the environment.
fn registry_client(config: &CryptConfig) -> Result<RegistryClient, Box<dyn std::error::Error>> {
    Ok(RegistryClient::new(
        config.transfer.clone(),
        RegistryAuth::from_env(),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_push() {
        let cli = Cli::try_parse_from([
            "imgcrypt",
            "-vv",
            "push",
            "app:v1",
            "--target",
            "ghcr.io/org/app:v1",
            "--passphrase",
            "pw",
        ])
        .unwrap();
        assert_eq!(cli.log_level(LogLevel::Error), tracing::Level::DEBUG);
        match cli.command {
            Command::Push(args) => {
                assert_eq!(args.image, "app:v1");
                assert_eq!(args.crypto.algorithm, Algorithm::Pbkdf2Aes256Gcm);
            }
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn test_log_level_raises_configured_level() {
        let cli = Cli::try_parse_from(["imgcrypt", "version"]).unwrap();
        assert_eq!(cli.log_level(LogLevel::Warn), tracing::Level::WARN);
        assert_eq!(cli.log_level(LogLevel::Debug), tracing::Level::DEBUG);

        let cli = Cli::try_parse_from(["imgcrypt", "-v", "version"]).unwrap();
        assert_eq!(cli.log_level(LogLevel::Error), tracing::Level::INFO);
        assert_eq!(cli.log_level(LogLevel::Debug), tracing::Level::DEBUG);
    }

    #[test]
    fn test_parse_algorithm_case_insensitive() {
        let cli = Cli::try_parse_from(["imgcrypt", "pull", "org/app:v1", "--algorithm", "none"])
            .unwrap();
        match cli.command {
            Command::Pull(args) => assert_eq!(args.crypto.algorithm, Algorithm::None),
            _ => panic!("expected pull"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_algorithm() {
        assert!(Cli::try_parse_from(["imgcrypt", "pull", "x", "--algorithm", "rot13"]).is_err());
    }

    #[test]
    fn test_crypto_args_require_passphrase() {
        let args = CryptoArgs {
            algorithm: Algorithm::Pbkdf2Aes256Gcm,
            compat: false,
            passphrase: None,
        };
        assert!(args.to_opts().is_err());

        let args = CryptoArgs {
            passphrase: Some("pw".to_string()),
            ..args
        };
        assert!(args.to_opts().is_ok());
    }

    #[test]
    fn test_crypto_args_none_needs_no_passphrase() {
        let args = CryptoArgs {
            algorithm: Algorithm::None,
            compat: true,
            passphrase: None,
        };
        let opts = args.to_opts().unwrap();
        assert!(opts.legacy_compat);
    }
}
