//! Hyperliquid perp exchange client.
//!
//! Read-only queries go to `/info`. Orders, cancels and leverage changes go
//! to `/exchange` as L1 actions signed with an agent key: the msgpack
//! encoding of the action plus nonce is hashed into a phantom-agent
//! connection id, which is then signed as EIP-712 typed data.

use std::collections::HashMap;
use std::str::FromStr;

use alloy_primitives::{keccak256, B256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::error::ApiError;
use super::http::RetryingClient;

pub const HYPERLIQUID_MAINNET: &str = "https://api.hyperliquid.xyz";
pub const HYPERLIQUID_TESTNET: &str = "https://api.hyperliquid-testnet.xyz";

pub const INFO_PATH: &str = "/info";
pub const EXCHANGE_PATH: &str = "/exchange";

/// Prices carry at most this many significant figures.
const PRICE_SIG_FIGS: u32 = 5;
/// Perp prices carry at most `6 - szDecimals` decimals.
const MAX_PRICE_DECIMALS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    /// Immediate-or-cancel
    Ioc,
    /// Good-til-cancelled
    Gtc,
}

impl TimeInForce {
    fn as_wire(&self) -> &'static str {
        match self {
            TimeInForce::Ioc => "Ioc",
            TimeInForce::Gtc => "Gtc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderKind {
    Limit { tif: TimeInForce },
    /// Market order released when the mark crosses `trigger_price`
    StopMarket { trigger_price: Decimal },
}

/// An order as the core asks for it, before exchange-specific rounding.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub token: String,
    pub is_buy: bool,
    pub size: Decimal,
    /// Worst acceptable price
    pub limit_price: Decimal,
    pub kind: OrderKind,
    pub reduce_only: bool,
}

/// Interpretation of an order placement response.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled {
        oid: Option<u64>,
        avg_px: Decimal,
        total_sz: Decimal,
    },
    /// Accepted and on the book, fill unknown
    Resting { oid: u64 },
    /// Exchange said no
    Error(String),
    /// Could not make sense of the payload
    Unexpected(Value),
}

impl OrderOutcome {
    /// Parse `{"status":"ok","response":{"data":{"statuses":[...]}}}`.
    pub fn from_response(raw: &Value) -> Self {
        match raw.get("status").and_then(Value::as_str) {
            Some("ok") => {}
            Some("err") => {
                let msg = raw
                    .get("response")
                    .map(|r| r.as_str().map(str::to_string).unwrap_or_else(|| r.to_string()))
                    .unwrap_or_else(|| "unknown error".to_string());
                return OrderOutcome::Error(msg);
            }
            _ => return OrderOutcome::Unexpected(raw.clone()),
        }

        let Some(status) = raw
            .pointer("/response/data/statuses")
            .and_then(Value::as_array)
            .and_then(|s| s.first())
        else {
            return OrderOutcome::Unexpected(raw.clone());
        };

        if let Some(filled) = status.get("filled") {
            let avg_px = filled.get("avgPx").and_then(decimal_field);
            let total_sz = filled.get("totalSz").and_then(decimal_field);
            return match (avg_px, total_sz) {
                (Some(avg_px), Some(total_sz)) => OrderOutcome::Filled {
                    oid: filled.get("oid").and_then(Value::as_u64),
                    avg_px,
                    total_sz,
                },
                _ => OrderOutcome::Unexpected(raw.clone()),
            };
        }
        if let Some(oid) = status.pointer("/resting/oid").and_then(Value::as_u64) {
            return OrderOutcome::Resting { oid };
        }
        if let Some(msg) = status.get("error").and_then(Value::as_str) {
            return OrderOutcome::Error(msg.to_string());
        }
        OrderOutcome::Unexpected(raw.clone())
    }
}

/// Lifecycle state reported by an order status query.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderState {
    Open,
    Filled {
        price: Option<Decimal>,
        size: Option<Decimal>,
    },
    Cancelled,
    Rejected(String),
    Unknown,
}

impl OrderState {
    fn from_response(raw: &Value) -> Self {
        if raw.get("status").and_then(Value::as_str) != Some("order") {
            return OrderState::Unknown;
        }
        let order = raw.pointer("/order/order");
        let state = raw.pointer("/order/status").and_then(Value::as_str).unwrap_or_default();
        match state {
            "open" | "triggered" => OrderState::Open,
            "filled" => OrderState::Filled {
                price: order.and_then(|o| o.get("limitPx")).and_then(decimal_field),
                size: order.and_then(|o| o.get("origSz")).and_then(decimal_field),
            },
            s if s.ends_with("anceled") || s.ends_with("ancelled") => OrderState::Cancelled,
            s if s.ends_with("ejected") => OrderState::Rejected(s.to_string()),
            _ => OrderState::Unknown,
        }
    }

    pub fn is_terminal_unfilled(&self) -> bool {
        matches!(self, OrderState::Cancelled | OrderState::Rejected(_))
    }
}

/// An order still on the book.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub coin: String,
    pub oid: u64,
    #[serde(default)]
    pub is_trigger: bool,
    #[serde(default)]
    pub reduce_only: bool,
}

/// Order placement, cancellation and price discovery on the venue.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Submit an order and return the raw venue response.
    async fn place_order(&self, order: &OrderRequest) -> Result<Value, ApiError>;

    async fn cancel_order(&self, token: &str, order_id: u64) -> Result<bool, ApiError>;

    async fn get_order_status(&self, order_id: u64) -> Result<OrderState, ApiError>;

    /// Current mid price, `None` when the venue does not list `token`.
    async fn get_mark_price(&self, token: &str) -> Result<Option<Decimal>, ApiError>;

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ApiError>;

    async fn update_leverage(&self, token: &str, leverage: u32) -> Result<(), ApiError>;
}

// ==================== Wire ====================

#[derive(Debug, Serialize)]
struct LimitWire {
    tif: &'static str,
}

#[derive(Debug, Serialize)]
struct TriggerWire {
    #[serde(rename = "isMarket")]
    is_market: bool,
    #[serde(rename = "triggerPx")]
    trigger_px: String,
    tpsl: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum OrderTypeWire {
    Limit(LimitWire),
    Trigger(TriggerWire),
}

#[derive(Debug, Serialize)]
struct OrderWire {
    a: u32,
    b: bool,
    p: String,
    s: String,
    r: bool,
    t: OrderTypeWire,
}

#[derive(Debug, Serialize)]
struct CancelWire {
    a: u32,
    o: u64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum Action {
    #[serde(rename = "order")]
    Order {
        orders: Vec<OrderWire>,
        grouping: &'static str,
    },
    #[serde(rename = "cancel")]
    Cancel { cancels: Vec<CancelWire> },
    #[serde(rename = "updateLeverage")]
    UpdateLeverage {
        asset: u32,
        #[serde(rename = "isCross")]
        is_cross: bool,
        leverage: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct AssetMeta {
    index: u32,
    sz_decimals: u32,
}

/// Round a price to the venue's tick rules.
pub fn format_price(price: Decimal, sz_decimals: u32) -> String {
    let max_dp = MAX_PRICE_DECIMALS.saturating_sub(sz_decimals);
    let rounded = price.round_sf(PRICE_SIG_FIGS).unwrap_or(price).round_dp(max_dp);
    rounded.normalize().to_string()
}

pub fn format_size(size: Decimal, sz_decimals: u32) -> String {
    size.round_dp(sz_decimals).normalize().to_string()
}

fn decimal_field(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Hash of an L1 action: msgpack(action) ++ nonce (u64 BE) ++ vault flag.
fn action_hash(action: &Action, nonce: u64) -> Result<B256, ApiError> {
    let mut bytes = rmp_serde::to_vec_named(action)
        .map_err(|e| ApiError::Decode(format!("Failed to encode action: {}", e)))?;
    bytes.extend_from_slice(&nonce.to_be_bytes());
    bytes.push(0x00);
    Ok(keccak256(&bytes))
}

/// EIP-712 digest of the phantom agent `{source, connectionId}`.
fn agent_digest(connection_id: B256, mainnet: bool) -> B256 {
    let domain_type = keccak256(
        b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
    );
    let mut domain = Vec::with_capacity(32 * 5);
    domain.extend_from_slice(domain_type.as_slice());
    domain.extend_from_slice(keccak256(b"Exchange").as_slice());
    domain.extend_from_slice(keccak256(b"1").as_slice());
    let mut chain_id = [0u8; 32];
    chain_id[24..].copy_from_slice(&1337u64.to_be_bytes());
    domain.extend_from_slice(&chain_id);
    domain.extend_from_slice(&[0u8; 32]);
    let domain_separator = keccak256(&domain);

    let agent_type = keccak256(b"Agent(string source,bytes32 connectionId)");
    let source: &[u8] = if mainnet { b"a" } else { b"b" };
    let mut agent = Vec::with_capacity(32 * 3);
    agent.extend_from_slice(agent_type.as_slice());
    agent.extend_from_slice(keccak256(source).as_slice());
    agent.extend_from_slice(connection_id.as_slice());
    let struct_hash = keccak256(&agent);

    let mut message = vec![0x19, 0x01];
    message.extend_from_slice(domain_separator.as_slice());
    message.extend_from_slice(struct_hash.as_slice());
    keccak256(&message)
}

/// Hyperliquid REST client. Without a signing key only `/info` queries work.
pub struct HyperliquidClient {
    http: RetryingClient,
    signer: Option<PrivateKeySigner>,
    account: Option<String>,
    mainnet: bool,
    assets: RwLock<HashMap<String, AssetMeta>>,
}

impl HyperliquidClient {
    /// Client for market data only.
    pub fn read_only(http: RetryingClient) -> Self {
        let mainnet = http.base_url() == HYPERLIQUID_MAINNET;
        Self {
            http,
            signer: None,
            account: None,
            mainnet,
            assets: RwLock::new(HashMap::new()),
        }
    }

    /// Trading client. `account` is the master address when the key belongs
    /// to an approved agent wallet; otherwise the key's own address is used.
    pub fn with_signer(http: RetryingClient, private_key: &str, account: Option<String>) -> Result<Self, ApiError> {
        let pk = private_key.strip_prefix("0x").unwrap_or(private_key);
        let signer = PrivateKeySigner::from_str(pk).map_err(|_| ApiError::Auth {
            status: 0,
            body: "invalid private key".to_string(),
        })?;
        let account = account.or_else(|| Some(format!("{:#x}", signer.address())));
        let mut client = Self::read_only(http);
        client.signer = Some(signer);
        client.account = account;
        Ok(client)
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    async fn info(&self, body: Value) -> Result<Value, ApiError> {
        self.http.post_value(INFO_PATH, &body).await
    }

    async fn asset(&self, token: &str) -> Result<AssetMeta, ApiError> {
        if let Some(meta) = self.assets.read().await.get(token) {
            return Ok(*meta);
        }

        let raw = self.info(json!({"type": "meta"})).await?;
        let universe = raw
            .get("universe")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::Decode("meta response without universe".to_string()))?;

        let mut assets = self.assets.write().await;
        for (index, entry) in universe.iter().enumerate() {
            if let Some(name) = entry.get("name").and_then(Value::as_str) {
                let sz_decimals = entry.get("szDecimals").and_then(Value::as_u64).unwrap_or(0) as u32;
                assets.insert(
                    name.to_string(),
                    AssetMeta {
                        index: index as u32,
                        sz_decimals,
                    },
                );
            }
        }
        debug!(assets = assets.len(), "Loaded asset metadata");

        assets
            .get(token)
            .copied()
            .ok_or_else(|| ApiError::Client {
                status: 404,
                body: format!("unknown asset {}", token),
            })
    }

    fn require_account(&self) -> Result<&str, ApiError> {
        self.account.as_deref().ok_or_else(|| ApiError::Auth {
            status: 0,
            body: "no account configured".to_string(),
        })
    }

    /// Sign and submit an L1 action.
    async fn submit(&self, action: Action) -> Result<Value, ApiError> {
        let signer = self.signer.as_ref().ok_or_else(|| ApiError::Auth {
            status: 0,
            body: "no signing key configured".to_string(),
        })?;

        let nonce = chrono::Utc::now().timestamp_millis() as u64;
        let digest = agent_digest(action_hash(&action, nonce)?, self.mainnet);
        let signature = signer.sign_hash(&digest).await.map_err(|e| ApiError::Auth {
            status: 0,
            body: format!("Failed to sign action: {}", e),
        })?;

        let bytes = signature.as_bytes();
        let v = if bytes[64] < 27 { bytes[64] + 27 } else { bytes[64] };
        let body = json!({
            "action": action,
            "nonce": nonce,
            "signature": {
                "r": format!("0x{}", hex::encode(&bytes[..32])),
                "s": format!("0x{}", hex::encode(&bytes[32..64])),
                "v": v,
            },
            "vaultAddress": Value::Null,
        });

        // Retries resend the same nonce, so a duplicate submission is refused.
        self.http.post_value(EXCHANGE_PATH, &body).await
    }
}

#[async_trait]
impl Exchange for HyperliquidClient {
    async fn place_order(&self, order: &OrderRequest) -> Result<Value, ApiError> {
        let asset = self.asset(&order.token).await?;
        let t = match order.kind {
            OrderKind::Limit { tif } => OrderTypeWire::Limit(LimitWire { tif: tif.as_wire() }),
            OrderKind::StopMarket { trigger_price } => OrderTypeWire::Trigger(TriggerWire {
                is_market: true,
                trigger_px: format_price(trigger_price, asset.sz_decimals),
                tpsl: "sl",
            }),
        };
        let wire = OrderWire {
            a: asset.index,
            b: order.is_buy,
            p: format_price(order.limit_price, asset.sz_decimals),
            s: format_size(order.size, asset.sz_decimals),
            r: order.reduce_only,
            t,
        };

        info!(
            token = %order.token,
            is_buy = order.is_buy,
            price = %wire.p,
            size = %wire.s,
            reduce_only = order.reduce_only,
            "Submitting order"
        );

        self.submit(Action::Order {
            orders: vec![wire],
            grouping: "na",
        })
        .await
    }

    async fn cancel_order(&self, token: &str, order_id: u64) -> Result<bool, ApiError> {
        let asset = self.asset(token).await?;
        let raw = self
            .submit(Action::Cancel {
                cancels: vec![CancelWire {
                    a: asset.index,
                    o: order_id,
                }],
            })
            .await?;

        let ok = raw.get("status").and_then(Value::as_str) == Some("ok")
            && raw
                .pointer("/response/data/statuses/0")
                .and_then(Value::as_str)
                == Some("success");
        debug!(token, order_id, ok, "Cancel order");
        Ok(ok)
    }

    async fn get_order_status(&self, order_id: u64) -> Result<OrderState, ApiError> {
        let user = self.require_account()?;
        let raw = self
            .info(json!({"type": "orderStatus", "user": user, "oid": order_id}))
            .await?;
        Ok(OrderState::from_response(&raw))
    }

    async fn get_mark_price(&self, token: &str) -> Result<Option<Decimal>, ApiError> {
        let mids = self.info(json!({"type": "allMids"})).await?;
        Ok(mids.get(token).and_then(decimal_field).filter(|p| *p > Decimal::ZERO))
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ApiError> {
        let user = self.require_account()?;
        let raw = self
            .info(json!({"type": "frontendOpenOrders", "user": user}))
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn update_leverage(&self, token: &str, leverage: u32) -> Result<(), ApiError> {
        let asset = self.asset(token).await?;
        let raw = self
            .submit(Action::UpdateLeverage {
                asset: asset.index,
                is_cross: true,
                leverage,
            })
            .await?;
        match raw.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            _ => Err(ApiError::Api {
                status: 200,
                body: raw.to_string(),
            }),
        }
    }
}
