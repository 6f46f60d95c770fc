use serde::{Deserialize, Serialize};

use super::StageEvent;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub sequence: u64,
    pub tx_id: String,
    pub event: StageEvent,
    pub content_hash: String,
}

impl Transaction {
    pub fn new(sequence: u64, event: StageEvent) -> Self {
        let tx_id = format!("TX-{}-{}-{}", event.product_id, event.stage, sequence);
        let content_hash = event.content_hash();
        Self {
            sequence,
            tx_id,
            event,
            content_hash,
        }
    }

    pub fn product_id(&self) -> &str {
        &self.event.product_id
    }

    /// True when the stored hash still matches the event it wraps.
    pub fn is_intact(&self) -> bool {
        self.event.content_hash() == self.content_hash
    }
}
