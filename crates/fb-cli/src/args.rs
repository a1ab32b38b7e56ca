use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// fogbox - inspect and exercise attachment storage
#[derive(Parser, Debug)]
#[command(name = "fogbox")]
#[command(version, about = "Remote object storage for file attachments", long_about = None)]
pub struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short = 'c', long = "config", env = "FOGBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Environment used to scope credentials
    #[arg(short = 'e', long = "environment", env = "FOGBOX_ENV")]
    pub environment: Option<String>,

    /// Override the configured directory (bucket)
    #[arg(short = 'd', long = "directory")]
    pub directory: Option<String>,

    /// Emit JSON logs
    #[arg(long = "json-logs")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve the configured credentials and print their keys
    Credentials {
        /// Print values as well (secrets included)
        #[arg(long = "show-values")]
        show_values: bool,
    },

    /// Upload a local file
    Upload {
        /// File to upload
        file: PathBuf,

        /// Storage key; defaults to the file name
        #[arg(short = 'k', long = "key")]
        key: Option<String>,

        /// Store the object as private
        #[arg(long = "private")]
        private: bool,
    },

    /// Delete stored objects
    Delete {
        /// Storage keys
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Print the URL of a stored key
    Url {
        key: String,

        /// Return a time-limited URL valid for this many seconds
        #[arg(long = "expires-in")]
        expires_in: Option<u64>,
    },

    /// Sign a resource URL with the configured CloudFront key pair
    Sign {
        /// Resource URL
        resource: String,

        /// Validity in seconds
        #[arg(long = "expires-in", default_value = "3600")]
        expires_in: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload() {
        let cli = Cli::try_parse_from([
            "fogbox", "-e", "production", "upload", "me.png", "--key", "a/me.png", "--private",
        ])
        .unwrap();

        assert_eq!(cli.environment.as_deref(), Some("production"));
        match cli.command {
            Command::Upload { file, key, private } => {
                assert_eq!(file, PathBuf::from("me.png"));
                assert_eq!(key.as_deref(), Some("a/me.png"));
                assert!(private);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_delete_requires_keys() {
        assert!(Cli::try_parse_from(["fogbox", "delete"]).is_err());
    }

    #[test]
    fn test_sign_default_expiry() {
        let cli = Cli::try_parse_from(["fogbox", "sign", "https://cdn.example.com/a.jpg"]).unwrap();
        assert!(matches!(cli.command, Command::Sign { expires_in: 3600, .. }));
    }
}
