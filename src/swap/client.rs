//! Swap aggregator API client (quote + assemble)

use crate::chain::SimulationResult;
use crate::config::SwapConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::TxCall;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Parameters for a single-input, single-output quote
#[derive(Debug, Clone, PartialEq)]
pub struct SwapQuoteRequest {
    pub chain_id: u64,
    pub input_token: Address,
    pub output_token: Address,
    pub amount: U256,
    pub user: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapQuote {
    pub path_id: String,
    pub in_amount: U256,
    pub out_amount: U256,
    pub gas_estimate: Option<f64>,
    pub price_impact: Option<f64>,
}

/// Router transaction ready to send, with the aggregator's own dry-run if any
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledSwap {
    pub call: TxCall,
    pub simulation: Option<SimulationResult>,
}

/// Swap aggregator seam
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapApi: Send + Sync {
    async fn quote(&self, request: &SwapQuoteRequest) -> EngineResult<SwapQuote>;

    /// Build the router transaction for a previously quoted path
    async fn assemble(&self, user: Address, path_id: &str) -> EngineResult<AssembledSwap>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InputToken {
    token_address: String,
    amount: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputToken {
    token_address: String,
    proportion: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteBody {
    chain_id: u64,
    input_tokens: Vec<InputToken>,
    output_tokens: Vec<OutputToken>,
    user_addr: String,
    slippage_limit_percent: f64,
    referral_code: u64,
    compact: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    path_id: String,
    in_amounts: Vec<String>,
    out_amounts: Vec<String>,
    #[serde(default)]
    gas_estimate: Option<f64>,
    #[serde(default)]
    price_impact: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AssembleBody<'a> {
    user_addr: String,
    path_id: &'a str,
    simulate: bool,
}

#[derive(Deserialize)]
struct AssembledTransaction {
    to: Address,
    data: Bytes,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    gas: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulationError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulationBody {
    is_success: bool,
    #[serde(default)]
    simulation_error: Option<SimulationError>,
}

#[derive(Deserialize)]
struct AssembleResponse {
    transaction: AssembledTransaction,
    #[serde(default)]
    simulation: Option<SimulationBody>,
}

#[derive(Deserialize, Default)]
struct ApiErrorBody {
    #[serde(default)]
    detail: Option<String>,
}

fn api_error(status: u16, body: &str) -> EngineError {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    EngineError::SwapApi {
        status,
        message: parsed.detail.unwrap_or_else(|| body.trim().to_string()),
    }
}

fn parse_amount(value: &str, field: &str, status: u16) -> EngineResult<U256> {
    U256::from_dec_str(value.trim()).map_err(|e| EngineError::SwapApi {
        status,
        message: format!("invalid {} {:?}: {}", field, value, e),
    })
}

fn interpret_quote(status: u16, body: &str) -> EngineResult<SwapQuote> {
    if !(200..300).contains(&status) {
        return Err(api_error(status, body));
    }
    let response: QuoteResponse = serde_json::from_str(body).map_err(|e| EngineError::SwapApi {
        status,
        message: format!("unreadable quote response: {}", e),
    })?;

    let first = |amounts: &[String], field: &str| -> EngineResult<U256> {
        let value = amounts.first().ok_or_else(|| EngineError::SwapApi {
            status,
            message: format!("quote response has no {}", field),
        })?;
        parse_amount(value, field, status)
    };

    Ok(SwapQuote {
        in_amount: first(&response.in_amounts, "inAmounts")?,
        out_amount: first(&response.out_amounts, "outAmounts")?,
        path_id: response.path_id,
        gas_estimate: response.gas_estimate,
        price_impact: response.price_impact,
    })
}

fn interpret_assemble(status: u16, body: &str) -> EngineResult<AssembledSwap> {
    if !(200..300).contains(&status) {
        return Err(api_error(status, body));
    }
    let response: AssembleResponse =
        serde_json::from_str(body).map_err(|e| EngineError::SwapApi {
            status,
            message: format!("unreadable assemble response: {}", e),
        })?;

    let tx = response.transaction;
    let mut call = TxCall::new(tx.to, tx.data);
    if let Some(value) = tx.value.as_deref() {
        let value = parse_amount(value, "value", status)?;
        if !value.is_zero() {
            call = call.with_value(value);
        }
    }
    // The API reports -1 when it could not estimate
    if let Some(gas) = tx.gas.filter(|g| *g > 0) {
        call = call.with_gas(U256::from(gas as u64));
    }

    let simulation = response.simulation.map(|sim| {
        if sim.is_success {
            return SimulationResult::Success {
                gas: call.gas.unwrap_or_default(),
            };
        }
        let error = sim.simulation_error.unwrap_or(SimulationError {
            kind: String::new(),
            error_message: "simulation failed".to_string(),
        });
        if error.kind.to_ascii_lowercase().contains("gas") {
            SimulationResult::GasEstimationFailed(error.error_message)
        } else {
            SimulationResult::Reverted(error.error_message)
        }
    });

    Ok(AssembledSwap { call, simulation })
}

/// HTTP client for an Odos-style smart order router
pub struct OdosSwapClient {
    client: Client,
    api_url: String,
    slippage_percent: f64,
    referral_code: u64,
}

impl OdosSwapClient {
    pub fn new(config: &SwapConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            slippage_percent: config.slippage_percent,
            referral_code: config.referral_code,
        })
    }
}

#[async_trait]
impl SwapApi for OdosSwapClient {
    async fn quote(&self, request: &SwapQuoteRequest) -> EngineResult<SwapQuote> {
        let body = QuoteBody {
            chain_id: request.chain_id,
            input_tokens: vec![InputToken {
                token_address: format!("{:?}", request.input_token),
                amount: request.amount.to_string(),
            }],
            output_tokens: vec![OutputToken {
                token_address: format!("{:?}", request.output_token),
                proportion: 1,
            }],
            user_addr: format!("{:?}", request.user),
            slippage_limit_percent: self.slippage_percent,
            referral_code: self.referral_code,
            compact: true,
        };

        debug!("Requesting swap quote on chain {}", request.chain_id);
        let response = self
            .client
            .post(format!("{}/sor/quote/v2", self.api_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        interpret_quote(status, &text)
    }

    async fn assemble(&self, user: Address, path_id: &str) -> EngineResult<AssembledSwap> {
        let body = AssembleBody {
            user_addr: format!("{:?}", user),
            path_id,
            simulate: true,
        };

        let response = self
            .client
            .post(format!("{}/sor/assemble", self.api_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        interpret_assemble(status, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_response() {
        let body = r#"{
            "pathId": "abc123",
            "inAmounts": ["1000000"],
            "outAmounts": ["399000000000000"],
            "gasEstimate": 182000.0,
            "priceImpact": 0.01
        }"#;
        let quote = interpret_quote(200, body).unwrap();
        assert_eq!(quote.path_id, "abc123");
        assert_eq!(quote.in_amount, U256::from(1_000_000));
        assert_eq!(quote.out_amount, U256::from(399_000_000_000_000u64));
    }

    #[test]
    fn test_error_detail_is_surfaced() {
        match interpret_quote(400, r#"{"detail":"Invalid token","errorCode":4001}"#) {
            Err(EngineError::SwapApi { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid token");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_assemble_classifies_simulation() {
        let body = r#"{
            "transaction": {
                "to": "0x00000000000000000000000000000000000000c1",
                "data": "0x83bd37f9",
                "value": "5",
                "gas": -1
            },
            "simulation": {
                "isSuccess": false,
                "simulationError": {"type": "GasEstimationError", "errorMessage": "gas required exceeds allowance"}
            }
        }"#;
        let assembled = interpret_assemble(200, body).unwrap();
        assert_eq!(assembled.call.value, Some(U256::from(5)));
        assert_eq!(assembled.call.gas, None);
        assert_eq!(
            assembled.simulation,
            Some(SimulationResult::GasEstimationFailed(
                "gas required exceeds allowance".to_string()
            ))
        );

        let reverted = body.replace("GasEstimationError", "ExecutionReverted");
        let assembled = interpret_assemble(200, &reverted).unwrap();
        assert!(matches!(
            assembled.simulation,
            Some(SimulationResult::Reverted(_))
        ));
    }

    #[test]
    fn test_assemble_without_simulation() {
        let body = r#"{
            "transaction": {
                "to": "0x00000000000000000000000000000000000000c1",
                "data": "0x83bd37f9",
                "value": "0",
                "gas": 250000
            }
        }"#;
        let assembled = interpret_assemble(200, body).unwrap();
        assert_eq!(assembled.call.value, None);
        assert_eq!(assembled.call.gas, Some(U256::from(250_000)));
        assert!(assembled.simulation.is_none());
    }
}
