use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and pre-register the application
/// series so they exist before the first increment.
///
/// Safe to call multiple times (e.g. in tests): subsequent calls return a
/// standalone handle and ignore the global-recorder installation error.
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = match builder.install_recorder() {
        Ok(h) => h,
        Err(_) => PrometheusBuilder::new().build_recorder().handle(),
    };

    counter!("whale_trades_observed").absolute(0);
    counter!("whales_discovered").absolute(0);
    counter!("whales_qualified").absolute(0);
    counter!("whales_ranked").absolute(0);
    counter!("copy_signals_emitted").absolute(0);
    counter!("signals_deduplicated").absolute(0);
    counter!("signals_dropped_non_top").absolute(0);
    counter!("signal_channel_stalls").absolute(0);
    counter!("copy_trades_opened").absolute(0);
    counter!("copy_trades_closed").absolute(0);
    counter!("copy_trades_failed").absolute(0);
    counter!("risk_blocks").absolute(0);
    counter!("kill_switch_activations").absolute(0);
    counter!("stream_events_dropped").absolute(0);
    counter!("stream_state_changes").absolute(0);

    gauge!("whales_tracked").set(0.0);
    gauge!("whales_qualified_current").set(0.0);
    gauge!("paper_total_capital").set(0.0);
    gauge!("paper_realized_pnl").set(0.0);
    gauge!("paper_open_positions").set(0.0);

    handle
}
