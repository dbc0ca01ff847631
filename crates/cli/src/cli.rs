use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::{Path, PathBuf};

/// hookd: game traffic ingestion daemon
///
/// hookd watches for game client processes, injects the capture agent into
/// each one and decodes the traffic the agent relays.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/hookd/config.toml` and `/etc/hookd/config.d/*.toml`, where the
    /// latter being a glob pattern. If they don't exist, the default
    /// configuration is used.
    #[arg(short, long, value_parser = validate_file)]
    pub conffile: Option<PathBuf>,

    /// Only watch processes whose name contains this string. Overrides
    /// `hook.process_name` from the configuration.
    #[arg(short, long)]
    pub process_name: Option<String>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_overrides() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cli = Cli::try_parse_from([
            "hookd",
            "--conffile",
            file.path().to_str().unwrap(),
            "--process-name",
            "game",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.conffile.as_deref(), Some(file.path()));
        assert_eq!(cli.process_name.as_deref(), Some("game"));
    }

    proptest! {
        #[test]
        fn test_validate_missing_file(name in "[a-z]{1,16}") {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join(&name);
            let err = validate_file(path.to_str().unwrap()).unwrap_err();
            prop_assert_eq!(err, format!("File not found: {:?}", path));
        }
    }
}
