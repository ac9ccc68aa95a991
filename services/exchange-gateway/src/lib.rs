pub mod credentials;
pub mod health;
pub mod signer;
pub mod types;
pub mod sources {
    pub mod binance_futures;
    pub mod bybit;
    pub mod paper;
}

pub use credentials::ApiCredentials;
pub use health::HealthTracker;
pub use sources::binance_futures::BinanceFuturesClient;
pub use sources::bybit::BybitClient;
pub use sources::paper::{PaperExchange, PaperFill};
pub use types::*;

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

/// Starting USDT balance of a fresh paper account
pub const PAPER_STARTING_BALANCE: i64 = 10_000;

/// Build a client for `exchange`.
///
/// Live venues require non-empty credentials. Paper accounts read public
/// market data from Binance futures mainnet and never sign requests.
pub fn connect(
    exchange: Exchange,
    credentials: Option<ApiCredentials>,
    testnet: bool,
) -> Result<Arc<dyn ExchangeClient>> {
    let credentials = credentials.filter(|c| !c.is_empty());

    let client: Arc<dyn ExchangeClient> = match exchange {
        Exchange::Binance => {
            let creds = credentials.ok_or(ExchangeError::MissingCredentials(exchange))?;
            Arc::new(BinanceFuturesClient::new(Some(creds), testnet)?)
        }
        Exchange::Bybit => {
            let creds = credentials.ok_or(ExchangeError::MissingCredentials(exchange))?;
            Arc::new(BybitClient::new(Some(creds), testnet)?)
        }
        Exchange::Paper => {
            let market = Arc::new(BinanceFuturesClient::new(None, false)?);
            Arc::new(
                PaperExchange::new(Decimal::from(PAPER_STARTING_BALANCE)).with_market(market),
            )
        }
    };

    info!("Connected {} client (testnet: {})", exchange, testnet);
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_venues_need_credentials() {
        assert!(matches!(
            connect(Exchange::Binance, None, true),
            Err(ExchangeError::MissingCredentials(Exchange::Binance))
        ));
        assert!(matches!(
            connect(Exchange::Bybit, Some(ApiCredentials::new("", "")), false),
            Err(ExchangeError::MissingCredentials(Exchange::Bybit))
        ));
    }

    #[test]
    fn test_connect_builds_requested_venue() {
        let paper = connect(Exchange::Paper, None, false).unwrap();
        assert_eq!(paper.exchange(), Exchange::Paper);

        let bybit = connect(Exchange::Bybit, Some(ApiCredentials::new("k", "s")), true).unwrap();
        assert_eq!(bybit.exchange(), Exchange::Bybit);
    }
}
