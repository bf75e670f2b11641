//! Bridge fee quotes from the relay service's suggested-fees endpoint

use crate::config::BridgeConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{AssetSymbol, BridgeQuote, ChainKey};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Fill window assumed when the service does not return a deadline
const DEFAULT_FILL_WINDOW_SECS: u32 = 4 * 60 * 60;

/// One candidate transfer to price
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub origin: ChainKey,
    pub destination: ChainKey,
    pub asset: AssetSymbol,
    pub input_token: Address,
    pub output_token: Address,
    pub amount: U256,
    pub recipient: Address,
}

/// Prices a bridge transfer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteClient: Send + Sync {
    /// Quote exactly `request.amount`.
    ///
    /// Fee-floor and route rejections come back as `BridgeAmountTooLow` and
    /// `BridgeRouteUnsupported`; everything else is `BridgeQuote` or a
    /// transport error.
    async fn quote(&self, request: &QuoteRequest) -> EngineResult<BridgeQuote>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

impl NumberOrString {
    fn as_u64(&self) -> Option<u64> {
        match self {
            NumberOrString::Number(n) => Some(*n),
            NumberOrString::String(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeeBand {
    total: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Limits {
    min_deposit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuggestedFeesResponse {
    #[serde(default)]
    output_amount: Option<String>,
    total_relay_fee: FeeBand,
    timestamp: NumberOrString,
    #[serde(default)]
    fill_deadline: Option<NumberOrString>,
    #[serde(default)]
    exclusivity_deadline: Option<NumberOrString>,
    #[serde(default)]
    exclusive_relayer: Option<String>,
    #[serde(default)]
    is_amount_too_low: bool,
    #[serde(default)]
    limits: Option<Limits>,
    #[serde(default)]
    estimated_fill_time_sec: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn parse_u256(value: &str, field: &str) -> EngineResult<U256> {
    U256::from_dec_str(value.trim()).map_err(|e| EngineError::BridgeQuote {
        status: 200,
        message: format!("invalid {} {:?}: {}", field, value, e),
    })
}

/// Turn a suggested-fees response into a quote or a classified error
fn interpret_response(request: &QuoteRequest, status: u16, body: &str) -> EngineResult<BridgeQuote> {
    if !(200..300).contains(&status) {
        let error: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = error.message.unwrap_or_else(|| body.trim().to_string());

        return Err(match error.code.as_deref() {
            Some("AMOUNT_TOO_LOW") => EngineError::BridgeAmountTooLow {
                chain: request.origin,
                message,
            },
            Some("ROUTE_NOT_ENABLED") | Some("UNSUPPORTED_ROUTE") => {
                EngineError::BridgeRouteUnsupported {
                    from: request.origin,
                    to: request.destination,
                    asset: request.asset,
                }
            }
            _ => EngineError::BridgeQuote { status, message },
        });
    }

    let response: SuggestedFeesResponse =
        serde_json::from_str(body).map_err(|e| EngineError::BridgeQuote {
            status,
            message: format!("unreadable quote response: {}", e),
        })?;

    if response.is_amount_too_low {
        let floor = response
            .limits
            .as_ref()
            .and_then(|l| U256::from_dec_str(&l.min_deposit).ok())
            .map(|min| request.asset.format_amount(min))
            .unwrap_or_else(|| "unknown".to_string());
        return Err(EngineError::BridgeAmountTooLow {
            chain: request.origin,
            message: format!(
                "{} {} is below the minimum deposit of {}",
                request.asset.format_amount(request.amount),
                request.asset,
                floor
            ),
        });
    }

    let fee_total = parse_u256(&response.total_relay_fee.total, "totalRelayFee")?;
    let output_amount = match response.output_amount.as_deref() {
        Some(output) => parse_u256(output, "outputAmount")?,
        None => request.amount.saturating_sub(fee_total),
    };
    if output_amount.is_zero() {
        return Err(EngineError::BridgeAmountTooLow {
            chain: request.origin,
            message: "fees consume the entire amount".to_string(),
        });
    }

    let quote_timestamp = response
        .timestamp
        .as_u64()
        .and_then(|t| u32::try_from(t).ok())
        .ok_or_else(|| EngineError::BridgeQuote {
            status,
            message: "invalid quote timestamp".to_string(),
        })?;
    let fill_deadline = response
        .fill_deadline
        .as_ref()
        .and_then(|d| d.as_u64())
        .and_then(|d| u32::try_from(d).ok())
        .unwrap_or_else(|| quote_timestamp.saturating_add(DEFAULT_FILL_WINDOW_SECS));
    let exclusivity_deadline = response
        .exclusivity_deadline
        .as_ref()
        .and_then(|d| d.as_u64())
        .and_then(|d| u32::try_from(d).ok())
        .unwrap_or(0);
    let exclusive_relayer = response
        .exclusive_relayer
        .as_deref()
        .and_then(|r| r.parse::<Address>().ok())
        .unwrap_or_else(Address::zero);

    Ok(BridgeQuote {
        output_amount,
        fee_total,
        quote_timestamp,
        fill_deadline,
        exclusivity_deadline,
        exclusive_relayer,
        estimated_fill_secs: response.estimated_fill_time_sec,
    })
}

/// HTTP client for an Across-style relay API
pub struct AcrossQuoteClient {
    client: Client,
    api_url: String,
}

impl AcrossQuoteClient {
    pub fn new(config: &BridgeConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, request: &QuoteRequest) -> EngineResult<BridgeQuote> {
        let url = format!("{}/suggested-fees", self.api_url);
        debug!(
            "Fetching bridge quote {} -> {} for {} {}",
            request.origin,
            request.destination,
            request.asset.format_amount(request.amount),
            request.asset
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("inputToken", format!("{:?}", request.input_token)),
                ("outputToken", format!("{:?}", request.output_token)),
                ("originChainId", request.origin.chain_id().to_string()),
                ("destinationChainId", request.destination.chain_id().to_string()),
                ("amount", request.amount.to_string()),
                ("recipient", format!("{:?}", request.recipient)),
                ("message", "0x".to_string()),
            ])
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        interpret_response(request, status, &body)
    }
}

#[async_trait]
impl QuoteClient for AcrossQuoteClient {
    async fn quote(&self, request: &QuoteRequest) -> EngineResult<BridgeQuote> {
        match self.fetch(request).await {
            Err(EngineError::Http(e)) => {
                warn!("Bridge quote request failed, retrying once: {}", e);
                self.fetch(request).await
            }
            result => result,
        }
    }
}
