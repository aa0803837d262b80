//! Periodic bank balance broadcast.

use crate::directory::BankDirectory;
use crate::liquidity::{BankBalance, LiquidityClient};
use relay_worker::{HubEvent, HubHandle, ShutdownSignal};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub bank_name: String,
    pub bic: String,
    pub balance: f64,
    pub currency: String,
}

/// Attach display names and BICs; unknown banks show their id for both.
pub fn present(balances: Vec<BankBalance>, directory: &BankDirectory) -> Vec<BalanceView> {
    balances
        .into_iter()
        .map(|b| {
            let (bank_name, bic) = match directory.bank(&b.bank_id) {
                Some(bank) => (bank.name.clone(), bank.bic.clone()),
                None => (b.bank_id.clone(), b.bank_id.clone()),
            };
            BalanceView {
                bank_name,
                bic,
                balance: b.balance,
                currency: b.currency,
            }
        })
        .collect()
}

async fn broadcast_once(client: &LiquidityClient, directory: &BankDirectory, hub: &HubHandle) {
    let balances = match tokio::time::timeout(FETCH_TIMEOUT, client.balances()).await {
        Ok(Ok(balances)) => balances,
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to fetch balances for broadcast");
            return;
        }
        Err(_) => {
            warn!(timeout_ms = FETCH_TIMEOUT.as_millis() as u64, "Balance fetch timed out");
            return;
        }
    };

    let views = present(balances, directory);
    let count = views.len();
    let data = match serde_json::to_value(views) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Failed to serialize balances");
            return;
        }
    };

    match hub.broadcast_event(&HubEvent::Balances(data)) {
        Ok(_) => info!(banks = count, "Broadcasting bank balances"),
        Err(e) => warn!(error = %e, "Failed to publish balances"),
    }
}

/// Broadcast balances after `initial_delay`, then every `every`.
pub async fn balance_loop(
    client: Arc<LiquidityClient>,
    directory: Arc<BankDirectory>,
    hub: HubHandle,
    initial_delay: Duration,
    every: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut tick = tokio::time::interval_at(Instant::now() + initial_delay, every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            _ = tick.tick() => broadcast_once(&client, &directory, &hub).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Bank;
    use crate::liquidity::stub::{StubLedger, spawn};
    use relay_worker::{BroadcastHub, HubConfig, shutdown};
    use serde_json::Value;

    fn directory() -> BankDirectory {
        BankDirectory::from_banks([Bank {
            id: "bank-a".into(),
            name: "Alpha Bank".into(),
            bic: "ALPHMYKLXXX".into(),
        }])
    }

    #[test]
    fn test_present_uses_directory() {
        let views = present(
            vec![
                BankBalance {
                    bank_id: "bank-a".into(),
                    balance: 10.0,
                    currency: "MYR".into(),
                },
                BankBalance {
                    bank_id: "bank-z".into(),
                    balance: 2.0,
                    currency: "SGD".into(),
                },
            ],
            &directory(),
        );

        assert_eq!(views[0].bank_name, "Alpha Bank");
        assert_eq!(views[0].bic, "ALPHMYKLXXX");
        assert_eq!(views[1].bank_name, "bank-z");
        assert_eq!(views[1].bic, "bank-z");
    }

    #[tokio::test]
    async fn test_loop_broadcasts_balances_event() {
        let client = Arc::new(spawn(StubLedger::default()).await);
        let (trigger, signal) = shutdown::channel();
        let (hub, hub_task) = BroadcastHub::spawn(&HubConfig::default(), signal.clone());
        let mut subscription = hub.register().await.unwrap();

        let task = tokio::spawn(balance_loop(
            client,
            Arc::new(directory()),
            hub.clone(),
            Duration::from_millis(10),
            Duration::from_secs(300),
            signal,
        ));

        let payload = tokio::time::timeout(Duration::from_secs(5), subscription.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        let event: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(event["type"], "balances");
        assert_eq!(event["data"][0]["bankName"], "Alpha Bank");
        assert_eq!(event["data"][1]["bankName"], "bank-z");

        trigger.trigger();
        task.await.unwrap();
        hub_task.await.unwrap();
    }
}
