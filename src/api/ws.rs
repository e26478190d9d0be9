// =============================================================================
// WebSocket Handler - live candle events
// =============================================================================
//
// Clients connect to `/api/v1/ws` (optionally `?symbol=BTCUSDT&timeframe=1m`)
// and receive every aggregator event as a JSON `AggregatedCandle`.
//
// The handler also:
//   - Responds to Ping frames with Pong frames.
//   - Tracks the connected client count on AppState.
//   - Unsubscribes from the aggregator on disconnect.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::market_data::timeframe::normalize_timeframe;
use crate::market_data::AggregatedCandle;

/// Events buffered per connection before new ones are dropped.
const CLIENT_QUEUE: usize = 1024;

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    symbol: Option<String>,
    timeframe: Option<String>,
}

/// Event filter derived from the query string.
#[derive(Debug, Clone, Default, PartialEq)]
struct EventFilter {
    symbol: Option<String>,
    timeframe: Option<String>,
}

impl EventFilter {
    fn from_query(query: WsQuery) -> Self {
        Self {
            symbol: query
                .symbol
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty()),
            timeframe: query
                .timeframe
                .map(|tf| normalize_timeframe(&tf))
                .filter(|tf| !tf.is_empty()),
        }
    }

    fn matches(&self, candle: &AggregatedCandle) -> bool {
        self.symbol.as_ref().map_or(true, |s| *s == candle.symbol)
            && self.timeframe.as_ref().map_or(true, |tf| *tf == candle.timeframe)
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let filter = EventFilter::from_query(query);
    info!(filter = ?filter, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, filter))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two concurrent branches via `tokio::select!`:
///   1. **Push** - forward aggregator events queued for this client.
///   2. **Recv** - process incoming client messages (Ping, Close).
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, filter: EventFilter) {
    state.ws_clients.fetch_add(1, Ordering::Relaxed);

    let (tx, mut rx) = mpsc::channel::<AggregatedCandle>(CLIENT_QUEUE);
    let listener_filter = filter.clone();
    // Dropped at the end of this function, which unsubscribes.
    let _subscription = state.aggregator.subscribe(move |candle| {
        if listener_filter.matches(candle) && tx.try_send(candle.clone()).is_err() {
            debug!("WebSocket client queue full — event dropped");
        }
    });

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(candle) = event else { break };
                match serde_json::to_string(&candle) {
                    Ok(json) => {
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                        state.ws_messages_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize candle event");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.ws_clients.fetch_sub(1, Ordering::Relaxed);
    info!("WebSocket connection closed — cleanup complete");
}
