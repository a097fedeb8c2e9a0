use clap::Parser;

use polycopy::config::AppConfig;
use polycopy::errors::{RunnerError, EXIT_GATE_NOT_SATISFIED, EXIT_OK};
use polycopy::models::TradeMode;
use polycopy::{metrics, services};

/// Prediction-market copy-trading bot: observes whale activity, mirrors
/// qualified whales into a virtual bankroll, and gates live execution
/// behind a paper-trading validation window.
#[derive(Debug, Parser)]
#[command(name = "polycopy", version, about)]
struct Cli {
    /// Trading mode: paper or live (live requires a passed promotion gate).
    #[arg(long)]
    mode: Option<String>,

    /// Wall-clock run duration in hours (must be > 0).
    #[arg(long)]
    duration_hours: Option<u64>,

    /// Accelerated simulation with a synthetic whale, no external services.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() {
    // Install the rustls crypto provider before any TLS usage.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls CryptoProvider");

    dotenvy::dotenv().ok();
    init_tracing();
    metrics::init_metrics();

    let cli = Cli::parse();
    let exit_code = match build_config(&cli) {
        Ok(config) => {
            let live_requested = config.mode == TradeMode::Live;
            match services::runner::run(config).await {
                Ok(gate) => {
                    if live_requested && !gate.passed {
                        EXIT_GATE_NOT_SATISFIED
                    } else {
                        EXIT_OK
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Runner failed");
                    e.exit_code()
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            e.exit_code()
        }
    };

    std::process::exit(exit_code);
}

fn build_config(cli: &Cli) -> Result<AppConfig, RunnerError> {
    let mut config = AppConfig::from_env()?;

    if let Some(raw) = &cli.mode {
        config.mode = TradeMode::parse(raw)
            .ok_or_else(|| RunnerError::Config(format!("invalid --mode '{raw}'")))?;
    }
    if let Some(hours) = cli.duration_hours {
        config.duration_hours = hours;
    }
    if cli.demo {
        config.demo = true;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();
}
