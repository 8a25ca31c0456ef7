//! Message Protocol
//!
//! Requests from the extension's own pages (checking page, interstitial)
//! arrive as JSON objects tagged by `type`. Every request gets an `ok`
//! answer; anything malformed or unknown is answered with `ok: false`.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::DecisionEngine;
use crate::types::{BlockedInfo, TabId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Decide the tab's pending navigation.
    #[serde(rename_all = "camelCase")]
    CheckUrl { tab_id: TabId },
    /// Fetch what the interstitial should show for the tab.
    #[serde(rename_all = "camelCase")]
    GetBlockInfo { tab_id: TabId },
    /// Let the URL through for one allow period.
    AllowOnce { url: String },
}

/// Interstitial payload of a GET_BLOCK_INFO answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfoEntry {
    pub url: String,
    pub score: u8,
    pub timestamp: Timestamp,
}

impl From<BlockedInfo> for BlockInfoEntry {
    fn from(info: BlockedInfo) -> Self {
        Self {
            url: info.url,
            score: info.score,
            timestamp: info.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<BlockInfoEntry>,
}

impl Response {
    pub fn ok() -> Self {
        Self { ok: true, entry: None }
    }

    pub fn failed() -> Self {
        Self {
            ok: false,
            entry: None,
        }
    }

    pub fn with_entry(entry: BlockInfoEntry) -> Self {
        Self {
            ok: true,
            entry: Some(entry),
        }
    }
}

/// Parse a raw message. `None` for unknown types and missing or mistyped
/// fields.
pub fn parse_request(message: &Value) -> Option<Request> {
    match serde_json::from_value::<Request>(message.clone()) {
        Ok(request) => Some(request),
        Err(e) => {
            debug!("Ignoring message {}: {}", message, e);
            None
        }
    }
}

/// Answer a typed request.
pub async fn dispatch(engine: &DecisionEngine, request: Request) -> Response {
    match request {
        Request::CheckUrl { tab_id } => {
            engine.store().ensure_loaded().await;
            let Some(pending) = engine.store().pending(tab_id) else {
                debug!("CHECK_URL for tab {} without a pending navigation", tab_id);
                return Response::failed();
            };
            match engine.decide(tab_id, &pending.url).await {
                Ok(verdict) => {
                    debug!("Tab {}: {}", tab_id, verdict);
                    Response::ok()
                }
                Err(e) => {
                    warn!("Failed to score URL: {}", e);
                    Response::failed()
                }
            }
        }
        Request::GetBlockInfo { tab_id } => {
            engine.store().ensure_loaded().await;
            match engine.store().blocked_info(tab_id) {
                Some(info) => Response::with_entry(info.into()),
                None => Response::failed(),
            }
        }
        Request::AllowOnce { url } => match engine.allow_once(&url).await {
            Ok(_) => Response::ok(),
            Err(e) => {
                warn!("Failed to add allow rule: {}", e);
                Response::failed()
            }
        },
    }
}

/// Answer a raw JSON message with a raw JSON response.
pub async fn handle_message(engine: &DecisionEngine, message: Value) -> Value {
    let response = match parse_request(&message) {
        Some(request) => dispatch(engine, request).await,
        None => Response::failed(),
    };
    serde_json::to_value(response).unwrap_or(Value::Null)
}
