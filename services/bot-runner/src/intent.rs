//! Entry intents for idempotency
//!
//! Every market entry is registered before it is sent. An equivalent entry
//! (same subscription, symbol and side) inside the window is refused, which
//! protects against a retried run doubling a position.

use exchange_gateway::PositionSide;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Window in which an equivalent entry is refused
pub const DEDUP_WINDOW: Duration = Duration::from_secs(300);
/// How long finished intents are kept around
const RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub enum IntentState {
    Pending,
    Filled { exchange_order_id: String },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct EntryIntent {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub signal_id: Uuid,
    pub state: IntentState,
    pub created_at: Instant,
}

pub struct IntentRegistry {
    intents: HashMap<Uuid, EntryIntent>,
    window: Duration,
}

impl Default for IntentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self {
            intents: HashMap::new(),
            window: DEDUP_WINDOW,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Id of a live equivalent intent, if any. Failed entries do not block.
    pub fn find_equivalent(
        &self,
        subscription_id: Uuid,
        symbol: &str,
        side: PositionSide,
    ) -> Option<Uuid> {
        self.intents
            .values()
            .find(|i| {
                i.subscription_id == subscription_id
                    && i.symbol == symbol
                    && i.side == side
                    && i.created_at.elapsed() < self.window
                    // A failed entry never reached the book, so a retry is allowed
                    && !matches!(i.state, IntentState::Failed { .. })
            })
            .map(|i| i.id)
    }

    /// Register an entry, or return the id of the equivalent one blocking it
    pub fn begin(
        &mut self,
        subscription_id: Uuid,
        symbol: &str,
        side: PositionSide,
        signal_id: Uuid,
    ) -> Result<Uuid, Uuid> {
        if let Some(existing) = self.find_equivalent(subscription_id, symbol, side) {
            debug!(
                subscription_id = %subscription_id,
                symbol,
                "Equivalent entry {} still in window",
                existing
            );
            return Err(existing);
        }

        // Pending until the exchange answers
        let intent = EntryIntent {
            id: Uuid::new_v4(),
            subscription_id,
            symbol: symbol.to_string(),
            side,
            signal_id,
            state: IntentState::Pending,
            created_at: Instant::now(),
        };
        let id = intent.id;
        self.intents.insert(id, intent);
        Ok(id)
    }

    pub fn update_state(&mut self, id: Uuid, state: IntentState) -> anyhow::Result<()> {
        let intent = self
            .intents
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("intent not found: {}", id))?;
        debug!("Intent {} state: {:?} -> {:?}", id, intent.state, state);
        intent.state = state;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<&EntryIntent> {
        self.intents.get(&id)
    }

    pub fn cleanup(&mut self) {
        // Retention outlives the window so recent outcomes stay inspectable
        let before = self.intents.len();
        self.intents.retain(|_, i| i.created_at.elapsed() < RETENTION);
        let removed = before - self.intents.len();
        if removed > 0 {
            debug!("Cleaned up {} old intents", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalent_entry_is_blocked() {
        let mut registry = IntentRegistry::new();
        let sub = Uuid::new_v4();

        let id = registry
            .begin(sub, "BTCUSDT", PositionSide::Long, Uuid::new_v4())
            .unwrap();
        registry
            .update_state(
                id,
                IntentState::Filled {
                    exchange_order_id: "42".to_string(),
                },
            )
            .unwrap();

        assert_eq!(
            registry.begin(sub, "BTCUSDT", PositionSide::Long, Uuid::new_v4()),
            Err(id)
        );
        // Other side, symbol or subscription are independent
        assert!(registry
            .begin(sub, "BTCUSDT", PositionSide::Short, Uuid::new_v4())
            .is_ok());
        assert!(registry
            .begin(sub, "ETHUSDT", PositionSide::Long, Uuid::new_v4())
            .is_ok());
        assert!(registry
            .begin(Uuid::new_v4(), "BTCUSDT", PositionSide::Long, Uuid::new_v4())
            .is_ok());
    }

    #[test]
    fn test_failed_entry_does_not_block() {
        let mut registry = IntentRegistry::new();
        let sub = Uuid::new_v4();
        let id = registry
            .begin(sub, "BTCUSDT", PositionSide::Long, Uuid::new_v4())
            .unwrap();
        registry
            .update_state(
                id,
                IntentState::Failed {
                    error: "rejected".to_string(),
                },
            )
            .unwrap();
        assert!(registry.find_equivalent(sub, "BTCUSDT", PositionSide::Long).is_none());
    }

    #[test]
    fn test_window_expiry() {
        let mut registry = IntentRegistry::new().with_window(Duration::from_millis(1));
        let sub = Uuid::new_v4();
        registry
            .begin(sub, "BTCUSDT", PositionSide::Long, Uuid::new_v4())
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(registry
            .begin(sub, "BTCUSDT", PositionSide::Long, Uuid::new_v4())
            .is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_intent() {
        let mut registry = IntentRegistry::new();
        assert!(registry.update_state(Uuid::new_v4(), IntentState::Pending).is_err());
    }
}
