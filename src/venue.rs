//! Venue client: place/cancel orders against the execution venue's CLOB.
//! Dry-run implementation logs only; live signs orders with EIP-712 and
//! authenticates with HMAC L2 headers (see [`crate::signing`]).
//!
//! Grounded on the teacher's `clob.rs` (`ClobClient` trait, `DryRunClob` /
//! `LiveClob`, `create_clob_client(dry_run)` factory) generalized from a
//! single hardcoded up/down market to arbitrary tokens, and with the live
//! path implemented end to end instead of left as a placeholder error.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::H160;
use rust_decimal::Decimal;
use tracing::info;

use crate::signing;
use crate::types::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order lifetime.
#[derive(Debug, Clone, Copy)]
pub enum OrderType {
    Gtc,
    Gtd,
    Fok,
    Fak,
}

#[derive(Debug, Clone)]
pub struct LimitOrderParams {
    pub token_id: Token,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub expiration_unix: Option<u64>,
    pub post_only: bool,
    pub fee_rate_bps: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderResult {
    pub order_id: Option<String>,
    pub success: bool,
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancelOrderResult {
    pub success: bool,
    pub error_msg: Option<String>,
}

/// Abstraction for venue order placement and cancellation (dry-run or live).
/// The execution coordinator (spec.md §4.5) talks to the venue exclusively
/// through this trait.
#[async_trait::async_trait]
pub trait VenueClient: Send + Sync {
    async fn place_limit_order(
        &self,
        params: LimitOrderParams,
        order_type: OrderType,
    ) -> Result<PlaceOrderResult>;

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOrderResult>;

    async fn place_market_order(
        &self,
        token_id: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> Result<PlaceOrderResult> {
        self.place_limit_order(
            LimitOrderParams {
                token_id: token_id.to_string(),
                side,
                price,
                size,
                expiration_unix: None,
                post_only: false,
                fee_rate_bps: None,
            },
            OrderType::Fak,
        )
        .await
    }
}

/// Dry-run: log the intended order and return success with a synthetic id.
pub struct DryRunVenue;

#[async_trait::async_trait]
impl VenueClient for DryRunVenue {
    async fn place_limit_order(
        &self,
        params: LimitOrderParams,
        order_type: OrderType,
    ) -> Result<PlaceOrderResult> {
        let side_str = match params.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let type_str = match order_type {
            OrderType::Gtc => "GTC",
            OrderType::Gtd => "GTD",
            OrderType::Fok => "FOK",
            OrderType::Fak => "FAK",
        };
        info!(
            "[dry-run] {} {} {}@{} size={}",
            type_str, side_str, params.token_id, params.price, params.size,
        );
        Ok(PlaceOrderResult {
            order_id: Some(format!("dry-run-{}", uuid::Uuid::new_v4())),
            success: true,
            error_msg: None,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOrderResult> {
        info!("[dry-run] cancel {}", order_id);
        Ok(CancelOrderResult {
            success: true,
            error_msg: None,
        })
    }
}

/// Live venue client: EIP-712 order signing + HMAC L2 auth, REST placement.
pub struct LiveVenue {
    rest_base: String,
    wallet: LocalWallet,
    api_key: String,
    api_secret: String,
    api_passphrase: String,
    chain_id: u64,
    exchange_address: H160,
    client: reqwest::Client,
}

impl LiveVenue {
    pub fn from_env(rest_base: &str) -> Result<Self> {
        let private_key = std::env::var("VENUE_PRIVATE_KEY").context("VENUE_PRIVATE_KEY required for live trading")?;
        let api_key = std::env::var("VENUE_API_KEY").context("VENUE_API_KEY required")?;
        let api_secret = std::env::var("VENUE_API_SECRET").context("VENUE_API_SECRET required")?;
        let api_passphrase = std::env::var("VENUE_API_PASSPHRASE").context("VENUE_API_PASSPHRASE required")?;
        let chain_id: u64 = std::env::var("VENUE_CHAIN_ID")
            .unwrap_or_else(|_| "137".to_string())
            .parse()
            .unwrap_or(137);
        let exchange_address: H160 = std::env::var("VENUE_EXCHANGE_ADDRESS")
            .unwrap_or_else(|_| signing::EXCHANGE_ADDRESS_DEFAULT.to_string())
            .parse()
            .context("VENUE_EXCHANGE_ADDRESS parse")?;
        let wallet: LocalWallet = private_key.parse().context("VENUE_PRIVATE_KEY parse")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            rest_base: rest_base.trim_end_matches('/').to_string(),
            wallet: wallet.with_chain_id(chain_id),
            api_key,
            api_secret,
            api_passphrase,
            chain_id,
            exchange_address,
            client,
        })
    }

    fn auth_headers(&self, method: &str, path: &str, body: Option<&str>) -> Result<Vec<(String, String)>> {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let signature = signing::build_poly_hmac(&self.api_secret, timestamp, method, path, body)?;
        Ok(vec![
            ("POLY_API_KEY".to_string(), self.api_key.clone()),
            ("POLY_PASSPHRASE".to_string(), self.api_passphrase.clone()),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_SIGNATURE".to_string(), signature),
        ])
    }
}

#[async_trait::async_trait]
impl VenueClient for LiveVenue {
    async fn place_limit_order(
        &self,
        params: LimitOrderParams,
        order_type: OrderType,
    ) -> Result<PlaceOrderResult> {
        let token_id = signing::parse_token_id(&params.token_id)?;
        let maker = self.wallet.address();
        let salt: u64 = uuid::Uuid::new_v4().as_u128() as u64;
        let expiration = params.expiration_unix.unwrap_or(0);
        let nonce = 0u64;
        let fee_rate_bps = params.fee_rate_bps.unwrap_or(0);
        let side_byte = match params.side {
            OrderSide::Buy => 0u8,
            OrderSide::Sell => 1u8,
        };
        let maker_amount = signing::decimal_to_u256_6dp(params.size * params.price);
        let taker_amount = signing::decimal_to_u256_6dp(params.size);

        let signature = signing::sign_order(
            &self.wallet,
            self.chain_id,
            self.exchange_address,
            salt,
            maker,
            maker,
            H160::zero(),
            token_id,
            maker_amount,
            taker_amount,
            expiration,
            nonce,
            fee_rate_bps,
            side_byte,
            0,
        )
        .await?;

        let order_type_str = match order_type {
            OrderType::Gtc => "GTC",
            OrderType::Gtd => "GTD",
            OrderType::Fok => "FOK",
            OrderType::Fak => "FAK",
        };
        let body = serde_json::json!({
            "salt": salt.to_string(),
            "maker": format!("{:#x}", maker),
            "tokenId": params.token_id,
            "makerAmount": maker_amount.to_string(),
            "takerAmount": taker_amount.to_string(),
            "side": if matches!(params.side, OrderSide::Buy) { "BUY" } else { "SELL" },
            "expiration": expiration.to_string(),
            "nonce": nonce.to_string(),
            "feeRateBps": fee_rate_bps.to_string(),
            "signature": signature,
            "orderType": order_type_str,
        })
        .to_string();

        let path = "/order";
        let headers = self.auth_headers("POST", path, Some(&body))?;
        let mut request = self
            .client
            .post(format!("{}{}", self.rest_base, path))
            .header("Content-Type", "application/json")
            .body(body);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        let res = request.send().await.context("POST /order")?;
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Ok(PlaceOrderResult {
                order_id: None,
                success: false,
                error_msg: Some(format!("venue {}: {}", status, text.chars().take(300).collect::<String>())),
            });
        }
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        let order_id = parsed.get("orderID").and_then(|v| v.as_str()).map(|s| s.to_string());
        Ok(PlaceOrderResult {
            order_id,
            success: true,
            error_msg: None,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOrderResult> {
        let path = "/order";
        let body = serde_json::json!({ "orderID": order_id }).to_string();
        let headers = self.auth_headers("DELETE", path, Some(&body))?;
        let mut request = self
            .client
            .delete(format!("{}{}", self.rest_base, path))
            .header("Content-Type", "application/json")
            .body(body);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        let res = request.send().await.context("DELETE /order")?;
        let status = res.status();
        if status.is_success() {
            Ok(CancelOrderResult {
                success: true,
                error_msg: None,
            })
        } else {
            let text = res.text().await.unwrap_or_default();
            Ok(CancelOrderResult {
                success: false,
                error_msg: Some(format!("venue {}: {}", status, text.chars().take(300).collect::<String>())),
            })
        }
    }
}

/// Build a venue client from config: dry-run if `dry_run`, else live.
pub fn create_venue_client(dry_run: bool, rest_base: &str) -> Result<Box<dyn VenueClient>> {
    if dry_run {
        Ok(Box::new(DryRunVenue))
    } else {
        Ok(Box::new(LiveVenue::from_env(rest_base)?))
    }
}
