//! gRPC client for the liquidity service.
//!
//! | Call          | Request                                                |
//! |---------------|--------------------------------------------------------|
//! | check+reserve | `liquidity.LiquidityCheckService/CheckLiquidity`       |
//! | credit        | `liquidity.LiquidityCheckService/CreditBank`           |
//! | balances      | `liquidity.LiquidityCheckService/GetBalances`          |
//! | readiness     | `GET /ready` on the service's HTTP health port         |
//!
//! The channel connects lazily, so an unreachable service surfaces as a
//! failed call rather than a failed start.

use async_trait::async_trait;
use protos::liquidity::liquidity_check_service_client::LiquidityCheckServiceClient;
use protos::liquidity::{
    self as proto, CreditBankRequest, GetBalancesRequest, LiquidityCheckRequest,
};
use relay_worker::{DependencyError, LiquidityService, ReserveOutcome};
use serde::Serialize;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::debug;

/// Port the service answers gRPC on.
pub const GRPC_PORT: &str = ":50051";
/// Port the service answers HTTP health checks on.
pub const HEALTH_PORT: &str = ":8080";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One account position reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankBalance {
    pub bank_id: String,
    pub balance: f64,
    pub currency: String,
}

impl From<proto::BankBalance> for BankBalance {
    fn from(balance: proto::BankBalance) -> Self {
        Self {
            bank_id: balance.bank_id,
            balance: balance.balance,
            currency: balance.currency,
        }
    }
}

/// `host:port` gets an `http://` scheme; full URIs pass through.
pub fn grpc_endpoint(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// `/ready` on the health port that sits next to the gRPC port.
pub fn default_health_url(address: &str) -> String {
    let endpoint = grpc_endpoint(address).replacen(GRPC_PORT, HEALTH_PORT, 1);
    format!("{endpoint}/ready")
}

fn status_error(status: Status) -> DependencyError {
    match status.code() {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::Cancelled
        | Code::Aborted
        | Code::ResourceExhausted
        | Code::Unknown => {
            DependencyError::Transport(format!("{:?}: {}", status.code(), status.message()))
        }
        code => DependencyError::Protocol(format!("{code:?}: {}", status.message())),
    }
}

pub struct LiquidityClient {
    rpc: LiquidityCheckServiceClient<Channel>,
    http: reqwest::Client,
    endpoint: String,
    health_url: String,
}

impl LiquidityClient {
    pub fn new(address: &str) -> Result<Self, DependencyError> {
        let endpoint = grpc_endpoint(address);
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| DependencyError::Transport(format!("invalid address {endpoint}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .tcp_nodelay(true)
            .connect_lazy();

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DependencyError::Transport(e.to_string()))?;

        Ok(Self {
            rpc: LiquidityCheckServiceClient::new(channel),
            http,
            health_url: default_health_url(&endpoint),
            endpoint,
        })
    }

    /// Override the derived readiness URL.
    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = url.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    // Clones share the underlying channel.
    fn rpc(&self) -> LiquidityCheckServiceClient<Channel> {
        self.rpc.clone()
    }

    /// Current balance of every bank.
    pub async fn balances(&self) -> Result<Vec<BankBalance>, DependencyError> {
        let response = self
            .rpc()
            .get_balances(GetBalancesRequest {})
            .await
            .map_err(status_error)?;
        Ok(response
            .into_inner()
            .balances
            .into_iter()
            .map(BankBalance::from)
            .collect())
    }
}

#[async_trait]
impl LiquidityService for LiquidityClient {
    fn name(&self) -> &str {
        "liquidity"
    }

    async fn check_and_reserve(
        &self,
        subject: &str,
        amount: f64,
        currency: &str,
    ) -> Result<ReserveOutcome, DependencyError> {
        let response = self
            .rpc()
            .check_liquidity(LiquidityCheckRequest {
                bank_id: subject.to_string(),
                transaction_amount: amount,
                currency: currency.to_string(),
            })
            .await
            .map_err(status_error)?
            .into_inner();

        Ok(ReserveOutcome {
            approved: response.approved,
            balance: response.available_balance,
            code: response.error_code,
        })
    }

    async fn credit(&self, subject: &str, amount: f64, currency: &str) -> Result<(), DependencyError> {
        let response = self
            .rpc()
            .credit_bank(CreditBankRequest {
                bank_id: subject.to_string(),
                amount,
                currency: currency.to_string(),
            })
            .await
            .map_err(status_error)?
            .into_inner();

        if !response.success {
            return Err(DependencyError::Protocol(format!(
                "credit of {subject} refused: {} {}",
                response.status_code, response.message
            )));
        }
        debug!(bank_id = %subject, amount, currency = %currency, new_balance = response.new_balance, "Credited bank");
        Ok(())
    }

    async fn ready(&self) -> bool {
        match self.http.get(&self.health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::stub::{StubLedger, spawn};
    use super::*;

    async fn client(limit: f64) -> (LiquidityClient, StubLedger) {
        let ledger = StubLedger {
            limit,
            ..Default::default()
        };
        (spawn(ledger.clone()).await, ledger)
    }

    #[test]
    fn test_addresses() {
        assert_eq!(grpc_endpoint("liquidity-service:50051"), "http://liquidity-service:50051");
        assert_eq!(grpc_endpoint("https://liquidity:443/"), "https://liquidity:443");
        assert_eq!(
            default_health_url("liquidity-service:50051"),
            "http://liquidity-service:8080/ready"
        );
        assert_eq!(default_health_url("http://10.0.0.5:9000"), "http://10.0.0.5:9000/ready");
    }

    #[tokio::test]
    async fn test_check_approved_and_denied() {
        let (client, _ledger) = client(100.0).await;

        let outcome = client.check_and_reserve("bank-a", 40.0, "MYR").await.unwrap();
        assert!(outcome.approved);
        assert_eq!(outcome.balance, 60.0);

        let outcome = client.check_and_reserve("bank-a", 400.0, "MYR").await.unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.code, "INSUFFICIENT_FUNDS");
    }

    #[tokio::test]
    async fn test_credit_sends_bank_id() {
        let (client, ledger) = client(100.0).await;
        client.credit("bank-b", 12.5, "MYR").await.unwrap();

        let credits = ledger.credits.lock().unwrap();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].bank_id, "bank-b");
        assert_eq!(credits[0].amount, 12.5);
    }

    #[tokio::test]
    async fn test_balances_and_ready() {
        let (client, _ledger) = client(0.0).await;
        assert!(client.ready().await);

        let balances = client.balances().await.unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].bank_id, "bank-a");
        assert_eq!(balances[1].currency, "SGD");
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        // Nothing listens on the discard port
        let client = LiquidityClient::new("127.0.0.1:9").unwrap();
        assert_eq!(client.health_url(), "http://127.0.0.1:9/ready");
        assert!(!client.ready().await);
        assert!(matches!(
            client.check_and_reserve("bank-a", 1.0, "MYR").await,
            Err(DependencyError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_request_is_protocol_error() {
        let (client, _ledger) = client(0.0).await;
        assert!(matches!(
            client.check_and_reserve("", 1.0, "MYR").await,
            Err(DependencyError::Protocol(_))
        ));
    }
}
