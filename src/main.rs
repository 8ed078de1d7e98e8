//! The `livepack` command line driver.

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use livepack::{CONFIG_FILE, Config, LivepackError, Pipeline};

/// Bundles scripts, compiles stylesheets and keeps browsers up to date.
#[derive(Debug, Parser)]
#[command(name = "livepack", version, about)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, default_value = CONFIG_FILE)]
    config: Utf8PathBuf,

    /// Overrides the output directory.
    #[arg(long)]
    out_dir: Option<Utf8PathBuf>,

    /// Overrides the debounce window, in milliseconds.
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Task to run: clean, scripts, styles, dist, serve, watch or default.
    #[arg(default_value = "default")]
    task: String,
}

impl Cli {
    fn config(&self) -> Result<Config, LivepackError> {
        let mut config = Config::load_or_default(&self.config)?;

        if let Some(out_dir) = &self.out_dir {
            config.out_dir = out_dir.clone();
        }
        if let Some(debounce_ms) = self.debounce_ms {
            config.debounce_ms = debounce_ms;
        }

        Ok(config)
    }
}

fn run(cli: &Cli) -> Result<(), LivepackError> {
    let pipeline = Pipeline::new(cli.config()?)?;
    pipeline.run(&cli.task)?;
    Ok(())
}

fn main() -> ExitCode {
    livepack::init_logging();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_default_task_without_arguments() {
        let cli = Cli::parse_from(["livepack"]);

        assert_eq!(cli.task, "default");
        assert_eq!(cli.config, CONFIG_FILE);
        assert!(cli.out_dir.is_none());
    }

    #[test]
    fn flags_override_the_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let file = Utf8PathBuf::try_from(dir.path().join(CONFIG_FILE)).unwrap();
        std::fs::write(&file, r#"{ "out_dir": "public", "debounce_ms": 10 }"#).unwrap();

        let cli = Cli::parse_from([
            "livepack",
            "--config",
            file.as_str(),
            "--debounce-ms",
            "200",
            "dist",
        ]);
        let config = cli.config().unwrap();

        assert_eq!(cli.task, "dist");
        assert_eq!(config.out_dir, "public");
        assert_eq!(config.debounce_ms, 200);
    }

    #[test]
    fn missing_configuration_file_falls_back_to_defaults() {
        let cli = Cli::parse_from(["livepack", "--config", "/nonexistent/livepack.json"]);

        assert_eq!(cli.config().unwrap(), Config::default());
    }
}
