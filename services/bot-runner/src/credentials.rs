//! Picks the exchange account a run trades on

use control_plane::models::{Bot, ExchangeCredential, Subscription};
use control_plane::SecretsManager;
use exchange_gateway::{ApiCredentials, Exchange};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::RunContext;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no usable credential for {exchanges} (testnet: {testnet})")]
    NotFound { exchanges: String, testnet: bool },

    #[error("credential {id} could not be decrypted: {message}")]
    Decrypt { id: Uuid, message: String },
}

#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub exchange: Exchange,
    /// `None` for paper accounts
    pub credential_id: Option<Uuid>,
    pub credentials: Option<ApiCredentials>,
    pub testnet: bool,
}

impl ResolvedCredential {
    pub fn paper() -> Self {
        Self {
            exchange: Exchange::Paper,
            credential_id: None,
            credentials: None,
            testnet: false,
        }
    }
}

fn usable(credential: &ExchangeCredential, sub: &Subscription, bot: &Bot) -> Option<Exchange> {
    if !credential.is_active || credential.user_id != sub.user_id {
        return None;
    }
    let exchange: Exchange = credential.exchange.parse().ok()?;
    (exchange != Exchange::Paper && bot.supports(exchange)).then_some(exchange)
}

/// Bound credential first, then the first active one in the bot's
/// exchange preference order with a matching testnet flag, then paper.
pub fn select<'a>(ctx: &'a RunContext) -> Option<(Exchange, Option<&'a ExchangeCredential>)> {
    let sub = &ctx.subscription;
    let bot = &ctx.bot;

    if let Some(bound_id) = sub.credential_id {
        match ctx.credentials.iter().find(|c| c.id == bound_id) {
            Some(c) => {
                if let Some(exchange) = usable(c, sub, bot) {
                    return Some((exchange, Some(c)));
                }
                warn!(
                    subscription_id = %sub.id,
                    credential_id = %bound_id,
                    "Bound credential is not usable for this bot, looking for another"
                );
            }
            None => warn!(
                subscription_id = %sub.id,
                credential_id = %bound_id,
                "Bound credential is missing or inactive, looking for another"
            ),
        }
    }

    for exchange in &bot.supported_exchanges {
        if *exchange == Exchange::Paper {
            continue;
        }
        let found = ctx.credentials.iter().find(|c| {
            usable(c, sub, bot) == Some(*exchange) && c.is_testnet == sub.is_testnet
        });
        if let Some(c) = found {
            return Some((*exchange, Some(c)));
        }
    }

    bot.supports(Exchange::Paper).then_some((Exchange::Paper, None))
}

pub fn resolve(
    ctx: &RunContext,
    secrets: &SecretsManager,
) -> Result<ResolvedCredential, CredentialError> {
    let Some((exchange, credential)) = select(ctx) else {
        let exchanges = ctx
            .bot
            .supported_exchanges
            .iter()
            .map(|e| e.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(CredentialError::NotFound {
            exchanges,
            testnet: ctx.subscription.is_testnet,
        });
    };

    let Some(credential) = credential else {
        debug!(subscription_id = %ctx.subscription.id, "Running on a paper account");
        return Ok(ResolvedCredential::paper());
    };

    let decrypt = |value: &str| {
        secrets.decrypt(value).map_err(|e| CredentialError::Decrypt {
            id: credential.id,
            message: e.to_string(),
        })
    };
    let api_key = decrypt(&credential.encrypted_api_key)?;
    let api_secret = decrypt(&credential.encrypted_api_secret)?;

    Ok(ResolvedCredential {
        exchange,
        credential_id: Some(credential.id),
        credentials: Some(ApiCredentials::new(api_key, api_secret)),
        testnet: credential.is_testnet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bot, credential, subscription};

    fn ctx(exchanges: &[Exchange], creds: Vec<ExchangeCredential>) -> RunContext {
        let bot = bot(exchanges);
        let mut sub = subscription(&bot);
        sub.user_id = creds.first().map(|c| c.user_id).unwrap_or(sub.user_id);
        RunContext {
            subscription: sub,
            bot,
            credentials: creds,
        }
    }

    #[test]
    fn test_bound_credential_wins() {
        let user = Uuid::new_v4();
        let binance = credential(user, Exchange::Binance, false);
        let bybit = credential(user, Exchange::Bybit, false);
        let mut ctx = ctx(&[Exchange::Binance, Exchange::Bybit], vec![binance, bybit.clone()]);
        ctx.subscription.credential_id = Some(bybit.id);

        let (exchange, chosen) = select(&ctx).unwrap();
        assert_eq!(exchange, Exchange::Bybit);
        assert_eq!(chosen.map(|c| c.id), Some(bybit.id));
    }

    #[test]
    fn test_preference_order_and_testnet_match() {
        let user = Uuid::new_v4();
        let bybit = credential(user, Exchange::Bybit, false);
        let binance_testnet = credential(user, Exchange::Binance, true);
        let ctx = ctx(
            &[Exchange::Binance, Exchange::Bybit],
            vec![bybit.clone(), binance_testnet],
        );
        // Subscription is mainnet, so the testnet Binance key is skipped
        let (exchange, chosen) = select(&ctx).unwrap();
        assert_eq!(exchange, Exchange::Bybit);
        assert_eq!(chosen.map(|c| c.id), Some(bybit.id));
    }

    #[test]
    fn test_unsupported_bound_credential_falls_back() {
        let user = Uuid::new_v4();
        let bybit = credential(user, Exchange::Bybit, false);
        let mut ctx = ctx(&[Exchange::Binance, Exchange::Paper], vec![bybit.clone()]);
        ctx.subscription.credential_id = Some(bybit.id);

        let (exchange, chosen) = select(&ctx).unwrap();
        assert_eq!(exchange, Exchange::Paper);
        assert!(chosen.is_none());
    }

    #[test]
    fn test_not_found() {
        let ctx = ctx(&[Exchange::Binance], vec![]);
        let err = resolve(&ctx, &SecretsManager::from_hex_key(None).unwrap()).unwrap_err();
        assert!(matches!(err, CredentialError::NotFound { .. }));
    }

    #[test]
    fn test_resolve_decrypts() {
        let secrets =
            SecretsManager::from_hex_key(Some(&"11".repeat(32))).unwrap();
        let user = Uuid::new_v4();
        let mut binance = credential(user, Exchange::Binance, false);
        binance.encrypted_api_key = secrets.encrypt("my-key").unwrap();
        binance.encrypted_api_secret = secrets.encrypt("my-secret").unwrap();
        let ctx = ctx(&[Exchange::Binance], vec![binance]);

        let resolved = resolve(&ctx, &secrets).unwrap();
        let creds = resolved.credentials.unwrap();
        assert_eq!(creds.api_key(), "my-key");
        assert_eq!(creds.expose_secret(), "my-secret");
        assert!(!resolved.testnet);
    }
}
