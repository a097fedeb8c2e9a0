use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, VecDeque};
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};

use crate::config::StreamConfig;
use crate::models::Side;
use crate::polymarket::types::{parse_flexible_timestamp, WsEvent, WsOperation, WsSubscribe};

const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse failures tolerated inside the rolling window before the connection
/// is recycled.
const PARSE_FAILURE_LIMIT: usize = 10;
const PARSE_FAILURE_WINDOW: Duration = Duration::from_secs(30);

const MIN_BUFFER_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream configuration error: {0}")]
    Config(String),

    #[error("stream authentication rejected: {0}")]
    Auth(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Typed events handed to the single registered consumer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MarketTrade {
        asset_id: String,
        side: Side,
        size: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
        taker_address: Option<String>,
    },
    PriceChange {
        asset_id: String,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        timestamp: DateTime<Utc>,
    },
    OrderbookDelta {
        asset_id: String,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    ConnectionState {
        state: ConnState,
        reason: Option<String>,
    },
}

impl StreamEvent {
    fn is_trade(&self) -> bool {
        matches!(self, StreamEvent::MarketTrade { .. })
    }

    fn is_book_delta(&self) -> bool {
        matches!(self, StreamEvent::OrderbookDelta { .. })
    }

    fn is_price_change(&self) -> bool {
        matches!(self, StreamEvent::PriceChange { .. })
    }
}

// ---------------------------------------------------------------------------
// Delivery buffer with the drop policy
// ---------------------------------------------------------------------------

/// Bounded buffer between the socket reader and the consumer channel. When
/// full, the oldest orderbook delta is evicted first, then price changes,
/// then heartbeats. Trades are never evicted.
pub struct EventBuffer {
    queue: VecDeque<StreamEvent>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(subscribed_assets: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: buffer_capacity(subscribed_assets),
        }
    }

    pub fn resize_for(&mut self, subscribed_assets: usize) {
        self.capacity = buffer_capacity(subscribed_assets);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueue one event, evicting by priority when the buffer is full.
    /// Returns the number of events dropped (incoming included).
    pub fn push(&mut self, event: StreamEvent) -> usize {
        if self.queue.len() < self.capacity {
            self.queue.push_back(event);
            return 0;
        }

        if let Some(idx) = self.queue.iter().position(StreamEvent::is_book_delta) {
            self.queue.remove(idx);
            self.queue.push_back(event);
            return 1;
        }
        if event.is_book_delta() {
            return 1;
        }
        if let Some(idx) = self.queue.iter().position(StreamEvent::is_price_change) {
            self.queue.remove(idx);
            self.queue.push_back(event);
            return 1;
        }
        if event.is_price_change() {
            return 1;
        }
        if let Some(idx) = self
            .queue
            .iter()
            .position(|e| matches!(e, StreamEvent::Heartbeat { .. }))
        {
            self.queue.remove(idx);
            self.queue.push_back(event);
            return 1;
        }
        // Only trades (and connection-state markers) remain; never drop them.
        self.queue.push_back(event);
        0
    }

    /// Jump the queue; used for connection-state notifications.
    pub fn push_front(&mut self, event: StreamEvent) {
        self.queue.push_front(event);
    }

    pub fn pop_front(&mut self) -> Option<StreamEvent> {
        self.queue.pop_front()
    }
}

fn buffer_capacity(subscribed_assets: usize) -> usize {
    MIN_BUFFER_CAPACITY.max(4 * subscribed_assets)
}

// ---------------------------------------------------------------------------
// Parse-failure escalation window
// ---------------------------------------------------------------------------

pub struct ParseFailureWindow {
    failures: VecDeque<Instant>,
    limit: usize,
    window: Duration,
}

impl ParseFailureWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            failures: VecDeque::new(),
            limit,
            window,
        }
    }

    /// Record one failure; true when the limit inside the window is exceeded.
    pub fn record(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        while let Some(&front) = self.failures.front() {
            if now.duration_since(front) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.len() > self.limit
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Exponential backoff doubling from 1s to 60s with ±20% jitter.
/// `jitter` is a uniform sample in [0, 1).
pub fn backoff_delay(attempt: u32, jitter: f64) -> Duration {
    let base = BASE_RECONNECT_DELAY * 2u32.saturating_pow(attempt);
    let base = base.min(MAX_RECONNECT_DELAY);
    let factor = 0.8 + 0.4 * jitter.clamp(0.0, 1.0);
    base.mul_f64(factor)
}

// ---------------------------------------------------------------------------
// Envelope parsing
// ---------------------------------------------------------------------------

/// Parse one inbound text payload. The frame may be a JSON array (fanned out
/// in order) or a single object; the literal `PONG` is the heartbeat reply.
pub fn parse_payload(text: &str) -> Result<Vec<StreamEvent>, String> {
    let trimmed = text.trim();
    if trimmed == "PONG" || trimmed == "PING" {
        return Ok(vec![StreamEvent::Heartbeat {
            timestamp: Utc::now(),
        }]);
    }

    if trimmed.starts_with('[') {
        let raw: Vec<WsEvent> =
            serde_json::from_str(trimmed).map_err(|e| format!("bad array frame: {e}"))?;
        return Ok(raw.iter().filter_map(convert_event).collect());
    }

    let raw: WsEvent = serde_json::from_str(trimmed).map_err(|e| format!("bad frame: {e}"))?;
    Ok(convert_event(&raw).into_iter().collect())
}

fn convert_event(raw: &WsEvent) -> Option<StreamEvent> {
    let timestamp = parse_flexible_timestamp(raw.timestamp.as_ref()).unwrap_or_else(Utc::now);
    let asset_id = raw.asset_id.clone().or_else(|| raw.market.clone())?;

    match raw.event_type.as_deref() {
        Some("trade") | Some("last_trade_price") => {
            let side = Side::from_api_str(raw.side.as_deref()?)?;
            let size = raw.size.as_deref().and_then(|s| Decimal::from_str(s).ok())?;
            let price = raw.price.as_deref().and_then(|s| Decimal::from_str(s).ok())?;
            Some(StreamEvent::MarketTrade {
                asset_id,
                side,
                size,
                price,
                timestamp,
                taker_address: raw.taker.clone(),
            })
        }
        Some("price_change") => Some(StreamEvent::PriceChange {
            asset_id,
            best_bid: raw.best_bid.as_deref().and_then(|s| Decimal::from_str(s).ok()),
            best_ask: raw.best_ask.as_deref().and_then(|s| Decimal::from_str(s).ok()),
            timestamp,
        }),
        Some("book") => {
            let levels = |side: &Option<Vec<crate::polymarket::types::WsBookLevel>>| {
                side.as_deref()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|l| {
                        Some(PriceLevel {
                            price: Decimal::from_str(&l.price).ok()?,
                            size: Decimal::from_str(&l.size).ok()?,
                        })
                    })
                    .collect::<Vec<_>>()
            };
            Some(StreamEvent::OrderbookDelta {
                asset_id,
                bids: levels(&raw.bids),
                asks: levels(&raw.asks),
                timestamp,
            })
        }
        // Subscription acks and unknown event types are skipped silently.
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

enum ConnectionEnd {
    Reconnect { had_traffic: bool, reason: String },
    Shutdown,
}

/// Resilient market WebSocket client. The desired subscription set is the
/// source of truth: the full set is re-sent on every reconnect, incremental
/// frames on a live connection.
pub struct StreamClient {
    config: StreamConfig,
    subs_tx: watch::Sender<BTreeSet<String>>,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamClient {
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        if config.url.trim().is_empty() {
            return Err(StreamError::Config("websocket endpoint missing".into()));
        }
        let (subs_tx, _) = watch::channel(BTreeSet::new());
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            subs_tx,
            shutdown_tx,
        })
    }

    /// Record additions to the desired subscription set.
    pub fn subscribe(&self, asset_ids: &[String]) {
        self.subs_tx.send_modify(|set| {
            for id in asset_ids {
                set.insert(id.clone());
            }
        });
    }

    pub fn unsubscribe(&self, asset_ids: &[String]) {
        self.subs_tx.send_modify(|set| {
            for id in asset_ids {
                set.remove(id);
            }
        });
    }

    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.subs_tx.borrow().clone()
    }

    /// Idempotent; cancels the reconnect loop and drains in-flight reads.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Start the connection task delivering events to `events_tx`.
    pub fn spawn(
        &self,
        events_tx: mpsc::Sender<StreamEvent>,
    ) -> JoinHandle<Result<(), StreamError>> {
        let config = self.config.clone();
        let subs_rx = self.subs_tx.subscribe();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(run_stream(config, subs_rx, shutdown_rx, events_tx))
    }
}

async fn run_stream(
    config: StreamConfig,
    subs_rx: watch::Receiver<BTreeSet<String>>,
    mut shutdown_rx: watch::Receiver<bool>,
    events_tx: mpsc::Sender<StreamEvent>,
) -> Result<(), StreamError> {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        emit_state(&events_tx, ConnState::Connecting, None).await;
        tracing::info!(url = %config.url, attempt, "Connecting to market WebSocket");

        match connect_async(&config.url).await {
            Ok((ws, _response)) => {
                emit_state(&events_tx, ConnState::Connected, None).await;
                let end = drive_connection(
                    ws,
                    &config,
                    subs_rx.clone(),
                    shutdown_rx.clone(),
                    &events_tx,
                )
                .await;

                match end {
                    ConnectionEnd::Shutdown => {
                        tracing::info!("Stream client shut down");
                        return Ok(());
                    }
                    ConnectionEnd::Reconnect { had_traffic, reason } => {
                        emit_state(&events_tx, ConnState::Disconnected, Some(reason.clone())).await;
                        tracing::warn!(reason = %reason, "WebSocket connection ended");
                        if had_traffic {
                            attempt = 0;
                        }
                    }
                }
            }
            Err(e) => {
                if let tungstenite::Error::Http(resp) = &e {
                    let status = resp.status();
                    if status == 401 || status == 403 {
                        return Err(StreamError::Auth(format!(
                            "handshake rejected with {status}"
                        )));
                    }
                }
                emit_state(&events_tx, ConnState::Disconnected, Some(e.to_string())).await;
                tracing::error!(error = %e, "WebSocket connection failed");
            }
        }

        let delay = backoff_delay(attempt, rand::random::<f64>());
        attempt = attempt.saturating_add(1);
        tracing::info!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting");

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn drive_connection(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &StreamConfig,
    mut subs_rx: watch::Receiver<BTreeSet<String>>,
    mut shutdown_rx: watch::Receiver<bool>,
    events_tx: &mpsc::Sender<StreamEvent>,
) -> ConnectionEnd {
    let (mut write, mut read) = ws.split();

    // Re-send the entire current subscription set on every connect.
    let mut current_subs = subs_rx.borrow().clone();
    if !current_subs.is_empty() {
        let ids: Vec<String> = current_subs.iter().cloned().collect();
        let frame = match serde_json::to_string(&WsSubscribe::market(&ids)) {
            Ok(f) => f,
            Err(e) => {
                return ConnectionEnd::Reconnect {
                    had_traffic: false,
                    reason: format!("subscribe frame encode failed: {e}"),
                }
            }
        };
        if let Err(e) = send_text(&mut write, frame).await {
            return ConnectionEnd::Reconnect {
                had_traffic: false,
                reason: format!("initial subscribe failed: {e}"),
            };
        }
        tracing::info!(assets = current_subs.len(), "Subscribed to asset set");
    }

    let mut ping_timer = interval(config.ping_interval);
    ping_timer.tick().await; // consume the immediate tick

    let mut buffer = EventBuffer::new(current_subs.len());
    let mut parse_failures = ParseFailureWindow::new(PARSE_FAILURE_LIMIT, PARSE_FAILURE_WINDOW);
    let mut last_frame = Instant::now();
    let mut had_traffic = false;

    loop {
        let idle_deadline = last_frame + config.read_idle_timeout;

        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_frame = Instant::now();
                        had_traffic = true;
                        if !ingest_payload(text.as_ref(), &mut buffer, &mut parse_failures) {
                            return ConnectionEnd::Reconnect {
                                had_traffic,
                                reason: "repeated parse failures".into(),
                            };
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        last_frame = Instant::now();
                        had_traffic = true;
                        match decompress_brotli(&bytes) {
                            Ok(text) => {
                                if !ingest_payload(&text, &mut buffer, &mut parse_failures) {
                                    return ConnectionEnd::Reconnect {
                                        had_traffic,
                                        reason: "repeated parse failures".into(),
                                    };
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Undecodable binary frame skipped");
                                if parse_failures.record(Instant::now()) {
                                    return ConnectionEnd::Reconnect {
                                        had_traffic,
                                        reason: "repeated parse failures".into(),
                                    };
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_frame = Instant::now();
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return ConnectionEnd::Reconnect {
                                had_traffic,
                                reason: format!("pong failed: {e}"),
                            };
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_frame = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        return ConnectionEnd::Reconnect {
                            had_traffic,
                            reason: "server close frame".into(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return ConnectionEnd::Reconnect {
                            had_traffic,
                            reason: format!("read error: {e}"),
                        };
                    }
                    None => {
                        return ConnectionEnd::Reconnect {
                            had_traffic,
                            reason: "stream ended".into(),
                        };
                    }
                }
            }
            _ = ping_timer.tick() => {
                if let Err(e) = send_text(&mut write, "PING".to_string()).await {
                    return ConnectionEnd::Reconnect {
                        had_traffic,
                        reason: format!("ping failed: {e}"),
                    };
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                return ConnectionEnd::Reconnect {
                    had_traffic,
                    reason: format!(
                        "no inbound frame for {}s",
                        config.read_idle_timeout.as_secs()
                    ),
                };
            }
            changed = subs_rx.changed() => {
                if changed.is_err() {
                    return ConnectionEnd::Shutdown;
                }
                let desired = subs_rx.borrow().clone();
                let added: Vec<String> = desired.difference(&current_subs).cloned().collect();
                let removed: Vec<String> = current_subs.difference(&desired).cloned().collect();

                if !added.is_empty() {
                    let frame = serde_json::to_string(&WsOperation::subscribe(&added))
                        .unwrap_or_default();
                    if let Err(e) = send_text(&mut write, frame).await {
                        return ConnectionEnd::Reconnect {
                            had_traffic,
                            reason: format!("subscribe failed: {e}"),
                        };
                    }
                }
                if !removed.is_empty() {
                    let frame = serde_json::to_string(&WsOperation::unsubscribe(&removed))
                        .unwrap_or_default();
                    if let Err(e) = send_text(&mut write, frame).await {
                        return ConnectionEnd::Reconnect {
                            had_traffic,
                            reason: format!("unsubscribe failed: {e}"),
                        };
                    }
                }

                current_subs = desired;
                buffer.resize_for(current_subs.len());
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
            }
        }

        drain_buffer(&mut buffer, events_tx);
    }
}

/// Parse one payload into the buffer. Returns false when the parse-failure
/// window demands a reconnect.
fn ingest_payload(
    text: &str,
    buffer: &mut EventBuffer,
    parse_failures: &mut ParseFailureWindow,
) -> bool {
    match parse_payload(text) {
        Ok(events) => {
            let mut dropped = 0usize;
            for event in events {
                dropped += buffer.push(event);
            }
            if dropped > 0 {
                metrics::counter!("stream_events_dropped").increment(dropped as u64);
                buffer.push_front(StreamEvent::ConnectionState {
                    state: ConnState::Degraded,
                    reason: Some("backpressure".into()),
                });
            }
            true
        }
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable frame");
            !parse_failures.record(Instant::now())
        }
    }
}

/// Hand buffered events to the consumer without blocking the socket read
/// loop; whatever does not fit stays buffered for the next pass.
fn drain_buffer(buffer: &mut EventBuffer, events_tx: &mpsc::Sender<StreamEvent>) {
    while let Some(event) = buffer.pop_front() {
        if let Err(mpsc::error::TrySendError::Full(event)) = events_tx.try_send(event) {
            buffer.push_front(event);
            break;
        }
    }
}

async fn send_text<S>(write: &mut S, frame: String) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match timeout(SEND_TIMEOUT, write.send(Message::Text(frame.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("send timed out".into()),
    }
}

fn decompress_brotli(bytes: &[u8]) -> Result<String, String> {
    let mut decoder = brotli::Decompressor::new(bytes, 4096);
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| e.to_string())?;
    Ok(out)
}

async fn emit_state(tx: &mpsc::Sender<StreamEvent>, state: ConnState, reason: Option<String>) {
    let _ = tx
        .send(StreamEvent::ConnectionState { state, reason })
        .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(asset: &str) -> StreamEvent {
        StreamEvent::MarketTrade {
            asset_id: asset.into(),
            side: Side::Buy,
            size: dec!(10),
            price: dec!(0.5),
            timestamp: Utc::now(),
            taker_address: None,
        }
    }

    fn delta(asset: &str) -> StreamEvent {
        StreamEvent::OrderbookDelta {
            asset_id: asset.into(),
            bids: vec![],
            asks: vec![],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn parse_single_trade_object() {
        let payload = r#"{"event_type":"last_trade_price","asset_id":"123","side":"BUY","size":"100","price":"0.42","timestamp":"1700000000"}"#;
        let events = parse_payload(payload).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::MarketTrade {
                asset_id,
                side,
                size,
                price,
                ..
            } => {
                assert_eq!(asset_id, "123");
                assert_eq!(*side, Side::Buy);
                assert_eq!(*size, dec!(100));
                assert_eq!(*price, dec!(0.42));
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn parse_array_preserves_order() {
        let payload = r#"[
            {"event_type":"trade","asset_id":"a","side":"SELL","size":"5","price":"0.30"},
            {"event_type":"price_change","asset_id":"a","best_bid":"0.29","best_ask":"0.31"}
        ]"#;
        let events = parse_payload(payload).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_trade());
        assert!(events[1].is_price_change());
    }

    #[test]
    fn parse_pong_is_heartbeat() {
        let events = parse_payload("PONG").unwrap();
        assert!(matches!(events[0], StreamEvent::Heartbeat { .. }));
    }

    #[test]
    fn parse_unknown_event_type_is_skipped() {
        let events = parse_payload(r#"{"event_type":"tick_size_change","asset_id":"1"}"#).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn parse_garbage_is_error() {
        assert!(parse_payload("not json at all").is_err());
    }

    #[test]
    fn buffer_drops_oldest_deltas_before_trades() {
        let mut buffer = EventBuffer::new(0);
        assert_eq!(buffer.capacity, MIN_BUFFER_CAPACITY);

        // Fill with alternating deltas and trades.
        for i in 0..MIN_BUFFER_CAPACITY {
            let dropped = if i % 2 == 0 {
                buffer.push(delta("a"))
            } else {
                buffer.push(trade("a"))
            };
            assert_eq!(dropped, 0);
        }

        // Overflow with a trade: one delta must be evicted, never a trade.
        let dropped = buffer.push(trade("b"));
        assert_eq!(dropped, 1);
        assert_eq!(buffer.len(), MIN_BUFFER_CAPACITY);

        let trades = (0..buffer.len())
            .filter_map(|_| buffer.pop_front())
            .filter(|e| e.is_trade())
            .count();
        assert_eq!(trades, MIN_BUFFER_CAPACITY / 2 + 1);
    }

    #[test]
    fn buffer_full_of_trades_never_drops() {
        let mut buffer = EventBuffer::new(0);
        for _ in 0..MIN_BUFFER_CAPACITY {
            buffer.push(trade("a"));
        }
        // Incoming delta is the drop victim.
        assert_eq!(buffer.push(delta("a")), 1);
        // Incoming trades still get through.
        assert_eq!(buffer.push(trade("b")), 0);
        assert_eq!(buffer.len(), MIN_BUFFER_CAPACITY + 1);
    }

    #[test]
    fn buffer_capacity_scales_with_subscriptions() {
        assert_eq!(buffer_capacity(10), 256);
        assert_eq!(buffer_capacity(64), 256);
        assert_eq!(buffer_capacity(100), 400);
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        for attempt in 0..10u32 {
            let low = backoff_delay(attempt, 0.0);
            let high = backoff_delay(attempt, 1.0);
            let nominal = BASE_RECONNECT_DELAY * 2u32.saturating_pow(attempt);
            let nominal = nominal.min(MAX_RECONNECT_DELAY);
            assert_eq!(low, nominal.mul_f64(0.8));
            assert!(high >= nominal && high <= nominal.mul_f64(1.21));
            assert!(low < high);
        }
        // Ceiling holds under max jitter.
        assert!(backoff_delay(30, 1.0) <= MAX_RECONNECT_DELAY.mul_f64(1.21));
    }

    #[test]
    fn parse_failures_escalate_only_inside_window() {
        let mut window = ParseFailureWindow::new(3, Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(!window.record(t0));
        assert!(!window.record(t0 + Duration::from_secs(1)));
        assert!(!window.record(t0 + Duration::from_secs(2)));
        // Fourth failure within the window exceeds the limit.
        assert!(window.record(t0 + Duration::from_secs(3)));

        // Failures outside the window age out.
        let mut window = ParseFailureWindow::new(3, Duration::from_secs(30));
        assert!(!window.record(t0));
        assert!(!window.record(t0 + Duration::from_secs(40)));
        assert!(!window.record(t0 + Duration::from_secs(41)));
        assert!(!window.record(t0 + Duration::from_secs(42)));
    }

    #[test]
    fn subscription_set_is_source_of_truth() {
        let client = StreamClient::new(StreamConfig::default()).unwrap();
        client.subscribe(&["b".into(), "a".into()]);
        client.subscribe(&["c".into(), "a".into()]);
        client.unsubscribe(&["b".into()]);
        let subs: Vec<String> = client.subscriptions().into_iter().collect();
        assert_eq!(subs, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn empty_endpoint_is_config_error() {
        let config = StreamConfig {
            url: String::new(),
            ..StreamConfig::default()
        };
        assert!(matches!(
            StreamClient::new(config),
            Err(StreamError::Config(_))
        ));
    }
}
