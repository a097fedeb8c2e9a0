use rust_decimal::Decimal;
use std::env;
use std::time::Duration;

use crate::errors::RunnerError;
use crate::models::TradeMode;

const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
const DEFAULT_DATA_API_URL: &str = "https://data-api.polymarket.com";

/// Qualification thresholds for the detector pipeline.
#[derive(Debug, Clone)]
pub struct QualificationConfig {
    pub min_trades: i64,
    pub min_volume_usd: Decimal,
    pub min_trades_last_3_days: i64,
    pub min_days_active: i64,
    pub max_inactive_days: i64,
}

impl Default for QualificationConfig {
    fn default() -> Self {
        Self {
            min_trades: 10,
            min_volume_usd: Decimal::from(500),
            min_trades_last_3_days: 3,
            min_days_active: 1,
            max_inactive_days: 30,
        }
    }
}

/// Composite-score weights and the top-N cut for ranking.
#[derive(Debug, Clone)]
pub struct RankingConfig {
    pub top_n: usize,
    pub w_volume: Decimal,
    pub w_recency: Decimal,
    pub w_frequency: Decimal,
    pub w_risk: Decimal,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_n: 10,
            w_volume: Decimal::new(5, 1),
            w_recency: Decimal::new(2, 1),
            w_frequency: Decimal::new(2, 1),
            w_risk: Decimal::new(1, 1),
        }
    }
}

/// Risk-manager limits, tuned for the $100 paper bankroll by default.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_daily_loss: Decimal,
    /// Max total open exposure as a fraction of the bankroll.
    pub max_exposure_frac: Decimal,
    pub max_position_per_market: Decimal,
    pub max_gas_gwei: Decimal,
    pub max_consecutive_losses: i64,
    /// Single-trade drawdown fraction that trips the kill switch.
    pub single_trade_drawdown_frac: Decimal,
    pub failed_execution_threshold: usize,
    pub failed_execution_window: Duration,
    pub emergency_unwind: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: Decimal::from(10),
            max_exposure_frac: Decimal::new(80, 2),
            max_position_per_market: Decimal::from(20),
            max_gas_gwei: Decimal::from(50),
            max_consecutive_losses: 3,
            single_trade_drawdown_frac: Decimal::new(5, 2),
            failed_execution_threshold: 3,
            failed_execution_window: Duration::from_secs(600),
            emergency_unwind: false,
        }
    }
}

/// Fractional-Kelly sizing parameters.
#[derive(Debug, Clone)]
pub struct SizingConfig {
    pub kelly_prior: Decimal,
    pub alpha: Decimal,
    pub kelly_fraction_cap: Decimal,
    pub quarter_kelly_multiplier: Decimal,
    pub min_position_frac: Decimal,
    pub max_position_frac: Decimal,
    /// Whether a same-direction signal may add to an open position.
    pub scale_in: bool,
    pub commission_rate: Decimal,
    pub gas_cost_usd: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_prior: Decimal::new(52, 2),
            alpha: Decimal::new(8, 2),
            kelly_fraction_cap: Decimal::new(5, 2),
            quarter_kelly_multiplier: Decimal::new(25, 2),
            min_position_frac: Decimal::new(1, 2),
            max_position_frac: Decimal::new(5, 2),
            scale_in: false,
            commission_rate: Decimal::new(2, 3),
            gas_cost_usd: Decimal::new(1, 2),
        }
    }
}

/// StreamClient heartbeat and reconnect knobs.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub read_idle_timeout: Duration,
    pub connect_retry_forever: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.into(),
            ping_interval: Duration::from_secs(5),
            read_idle_timeout: Duration::from_secs(30),
            connect_retry_forever: true,
        }
    }
}

/// Data-API client policy.
#[derive(Debug, Clone)]
pub struct DataApiConfig {
    pub base_url: String,
    pub rate_per_minute: u32,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for DataApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DATA_API_URL.into(),
            rate_per_minute: 100,
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub mode: TradeMode,
    pub demo: bool,
    pub initial_bankroll: Decimal,
    pub duration_hours: u64,
    pub polling_interval: Duration,
    pub detection_window_hours: i64,
    pub daily_trade_threshold: i64,
    pub min_trade_size_usd: Decimal,
    pub risk_score_max: i16,
    pub report_interval: Duration,
    pub market_top_k: usize,
    pub promotion_min_roi: Decimal,
    pub promotion_max_drawdown: Decimal,
    pub qualification: QualificationConfig,
    pub ranking: RankingConfig,
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub stream: StreamConfig,
    pub data_api: DataApiConfig,
    /// Live-mode Builder credentials; outside the core, consumed only by the
    /// live executor.
    pub builder_endpoint: Option<String>,
    pub builder_api_key: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, RunnerError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| RunnerError::Config("DATABASE_URL must be set".into()))?;

        let mode = match env::var("MODE") {
            Ok(raw) => TradeMode::parse(&raw)
                .ok_or_else(|| RunnerError::Config(format!("invalid MODE '{raw}'")))?,
            Err(_) => TradeMode::Paper,
        };

        let qual = QualificationConfig {
            min_trades: env_parse("QUAL_MIN_TRADES", 10),
            min_volume_usd: env_parse("QUAL_MIN_VOLUME_USD", Decimal::from(500)),
            min_trades_last_3_days: env_parse("QUAL_MIN_TRADES_LAST_3_DAYS", 3),
            min_days_active: env_parse("QUAL_MIN_DAYS_ACTIVE", 1),
            max_inactive_days: env_parse("QUAL_MAX_INACTIVE_DAYS", 30),
        };

        let ranking = RankingConfig {
            top_n: env_parse("RANKING_TOP_N", 10usize),
            ..RankingConfig::default()
        };

        let risk = RiskConfig {
            max_daily_loss: env_parse("RISK_MAX_DAILY_LOSS", Decimal::from(10)),
            max_exposure_frac: env_parse("RISK_MAX_EXPOSURE_FRAC", Decimal::new(80, 2)),
            max_position_per_market: env_parse("RISK_MAX_POSITION_PER_MARKET", Decimal::from(20)),
            max_gas_gwei: env_parse("RISK_MAX_GAS_GWEI", Decimal::from(50)),
            max_consecutive_losses: env_parse("RISK_MAX_CONSECUTIVE_LOSSES", 3),
            emergency_unwind: env_parse("RISK_EMERGENCY_UNWIND", false),
            ..RiskConfig::default()
        };

        let sizing = SizingConfig {
            kelly_prior: env_parse("SIZING_KELLY_PRIOR", Decimal::new(52, 2)),
            alpha: env_parse("SIZING_ALPHA", Decimal::new(8, 2)),
            kelly_fraction_cap: env_parse("SIZING_KELLY_CAP", Decimal::new(5, 2)),
            quarter_kelly_multiplier: env_parse("SIZING_QUARTER_KELLY", Decimal::new(25, 2)),
            min_position_frac: env_parse("SIZING_MIN_POSITION_FRAC", Decimal::new(1, 2)),
            max_position_frac: env_parse("SIZING_MAX_POSITION_FRAC", Decimal::new(5, 2)),
            scale_in: env_parse("SIZING_SCALE_IN", false),
            commission_rate: env_parse("SIZING_COMMISSION_RATE", Decimal::new(2, 3)),
            gas_cost_usd: env_parse("SIZING_GAS_COST_USD", Decimal::new(1, 2)),
        };

        let stream = StreamConfig {
            url: env::var("POLYMARKET_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.into()),
            ping_interval: env_secs("STREAM_PING_INTERVAL_SEC", Duration::from_secs(5)),
            read_idle_timeout: env_secs("STREAM_READ_IDLE_TIMEOUT_SEC", Duration::from_secs(30)),
            connect_retry_forever: env_parse("STREAM_CONNECT_RETRY_FOREVER", true),
        };

        let data_api = DataApiConfig {
            base_url: env::var("POLYMARKET_DATA_API_URL")
                .unwrap_or_else(|_| DEFAULT_DATA_API_URL.into()),
            rate_per_minute: env_parse("DATA_API_RATE_PER_MINUTE", 100),
            timeout: env_secs("DATA_API_TIMEOUT_SEC", Duration::from_secs(30)),
            max_retries: env_parse("DATA_API_MAX_RETRIES", 3),
        };

        let config = Self {
            database_url,
            mode,
            demo: env_parse("DEMO", false),
            initial_bankroll: env_parse("INITIAL_BANKROLL", Decimal::from(100)),
            duration_hours: env_parse("DURATION_HOURS", 168),
            polling_interval: env_secs("POLLING_INTERVAL_SEC", Duration::from_secs(60)),
            detection_window_hours: env_parse("DETECTION_WINDOW_HOURS", 72),
            daily_trade_threshold: env_parse("DAILY_TRADE_THRESHOLD", 5),
            min_trade_size_usd: env_parse("MIN_TRADE_SIZE_USD", Decimal::from(50)),
            risk_score_max: env_parse("RISK_SCORE_MAX", 6),
            report_interval: env_secs("REPORT_INTERVAL_SEC", Duration::from_secs(3600)),
            market_top_k: env_parse("MARKET_TOP_K", 50usize),
            promotion_min_roi: env_parse("PROMOTION_MIN_ROI", Decimal::new(25, 2)),
            promotion_max_drawdown: env_parse("PROMOTION_MAX_DRAWDOWN", Decimal::new(20, 2)),
            qualification: qual,
            ranking,
            risk,
            sizing,
            stream,
            data_api,
            builder_endpoint: env::var("BUILDER_ENDPOINT").ok(),
            builder_api_key: env::var("BUILDER_API_KEY").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on values that would make the runner meaningless.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.duration_hours == 0 {
            return Err(RunnerError::Config("DURATION_HOURS must be > 0".into()));
        }
        if self.initial_bankroll <= Decimal::ZERO {
            return Err(RunnerError::Config("INITIAL_BANKROLL must be > 0".into()));
        }
        if self.stream.url.is_empty() {
            return Err(RunnerError::Config("POLYMARKET_WS_URL must not be empty".into()));
        }
        if self.detection_window_hours != 72 {
            // The 3-day activity counter and the detection window must agree.
            return Err(RunnerError::Config(
                "DETECTION_WINDOW_HOURS is fixed at 72".into(),
            ));
        }
        if self.sizing.min_position_frac > self.sizing.max_position_frac {
            return Err(RunnerError::Config(
                "SIZING_MIN_POSITION_FRAC must not exceed SIZING_MAX_POSITION_FRAC".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            mode: TradeMode::Paper,
            demo: false,
            initial_bankroll: Decimal::from(100),
            duration_hours: 168,
            polling_interval: Duration::from_secs(60),
            detection_window_hours: 72,
            daily_trade_threshold: 5,
            min_trade_size_usd: Decimal::from(50),
            risk_score_max: 6,
            report_interval: Duration::from_secs(3600),
            market_top_k: 50,
            promotion_min_roi: Decimal::new(25, 2),
            promotion_max_drawdown: Decimal::new(20, 2),
            qualification: QualificationConfig::default(),
            ranking: RankingConfig::default(),
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            stream: StreamConfig::default(),
            data_api: DataApiConfig::default(),
            builder_endpoint: None,
            builder_api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut config = AppConfig::default();
        config.database_url = "postgres://localhost/test".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_duration_is_rejected() {
        let mut config = AppConfig::default();
        config.database_url = "postgres://localhost/test".into();
        config.duration_hours = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.exit_code(), crate::errors::EXIT_CONFIG);
    }

    #[test]
    fn detection_window_is_pinned_to_72h() {
        let mut config = AppConfig::default();
        config.database_url = "postgres://localhost/test".into();
        config.detection_window_hours = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_sizing_clamps_are_rejected() {
        let mut config = AppConfig::default();
        config.database_url = "postgres://localhost/test".into();
        config.sizing.min_position_frac = Decimal::new(10, 2);
        config.sizing.max_position_frac = Decimal::new(5, 2);
        assert!(config.validate().is_err());
    }
}
