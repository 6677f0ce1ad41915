//! Kernelkit kernel - main entry point.
//!
//! Started by Jupyter with the path of a connection file:
//! ```text
//! kernelkit /run/user/1000/jupyter/kernel-1234.json
//! ```

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use kernelkit::evaluator::{CalcEvaluator, Evaluator};
use kernelkit::kernel::{Exit, Kernel};
use kernelkit::{ConnectionInfo, KernelConfig};

#[derive(Parser)]
#[command(name = "kernelkit")]
#[command(about = "Jupyter kernel with pluggable language evaluators")]
#[command(version)]
struct Cli {
    /// Connection file written by the Jupyter front-end
    connection_file: PathBuf,

    /// Language back-end to serve
    #[arg(long, value_enum, default_value_t = Language::Calc, env = "KERNELKIT_LANGUAGE")]
    language: Language,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Language {
    /// Arithmetic with variables
    Calc,
}

impl Language {
    fn evaluator(self) -> Arc<dyn Evaluator> {
        match self {
            Language::Calc => Arc::new(CalcEvaluator::new()),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    kernelkit::observability::init_tracing();

    let info = match ConnectionInfo::from_file(&cli.connection_file) {
        Ok(info) => info,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let config = match KernelConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        "kernelkit {} starting: language={:?}, transport={}, ip={}",
        env!("CARGO_PKG_VERSION"),
        cli.language,
        info.transport,
        info.ip,
    );

    match Kernel::serve(&info, &config, cli.language.evaluator()).await {
        Ok(Exit::Shutdown { restart }) => {
            tracing::info!("kernel shut down (restart={})", restart);
            ExitCode::SUCCESS
        }
        Ok(exit) => {
            tracing::info!("kernel stopped: {:?}", exit);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("kernel failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
