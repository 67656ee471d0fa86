//! APT spot price from CoinGecko.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::daemon::{Daemon, DaemonContext};
use crate::dispatcher::{CoinPriceJob, JobPayload};
use crate::error::DaemonError;

const COIN_ID: &str = "aptos";
const CURRENCY: &str = "usd";

/// Response of `/simple/price`: coin id -> currency -> price.
type SimplePrice = HashMap<String, HashMap<String, f64>>;

/// Enqueues a `CoinPriceJob` whenever the APT/USD price changes.
#[derive(Debug, Default)]
pub struct CoinGeckoPriceDaemon {
    last_price: Option<f64>,
}

impl CoinGeckoPriceDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    fn price_url(ctx: &DaemonContext) -> String {
        format!(
            "{}/simple/price?ids={}&vs_currencies={}",
            ctx.app().coingecko_url.trim_end_matches('/'),
            COIN_ID,
            CURRENCY
        )
    }
}

#[async_trait]
impl Daemon for CoinGeckoPriceDaemon {
    fn name(&self) -> &'static str {
        "CoinGeckoPriceDaemon"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(300)
    }

    async fn run(&mut self, ctx: &DaemonContext) -> Result<usize, DaemonError> {
        let url = Self::price_url(ctx);
        let prices: SimplePrice = ctx.fetch_json(&url).await?;

        let price = prices
            .get(COIN_ID)
            .and_then(|quotes| quotes.get(CURRENCY))
            .copied()
            .ok_or_else(|| DaemonError::Parse {
                url: url.clone(),
                message: format!("missing {}/{} quote", COIN_ID, CURRENCY),
            })?;

        if self.last_price == Some(price) {
            return Ok(0);
        }

        ctx.dispatch(JobPayload::CoinPrice(CoinPriceJob {
            coin: COIN_ID.to_string(),
            currency: CURRENCY.to_string(),
            price,
            observed_at: Utc::now().timestamp(),
        }))
        .await?;
        self.last_price = Some(price);
        Ok(1)
    }
}
