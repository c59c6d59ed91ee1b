use serde::{Deserialize, Serialize};

use crate::chat::endpoint::Endpoint;

/// Which upstream endpoint handles the next turn, and which behavior variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ModelSettings {
    pub model_type: Option<String>,
    pub option: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ModelSettingsPatch {
    pub model_type: Option<String>,
    pub option: Option<String>,
}

impl ModelSettings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::for_model_type(self.model_type.as_deref())
    }

    /// Empty strings clear a field; absent fields are left alone.
    pub fn apply_patch(&mut self, patch: ModelSettingsPatch) {
        fn merge(field: &mut Option<String>, value: Option<String>) {
            if let Some(v) = value {
                *field = if v.trim().is_empty() { None } else { Some(v) };
            }
        }
        merge(&mut self.model_type, patch.model_type);
        merge(&mut self.option, patch.option);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    ticket: u64,
    value: ModelSettings,
}

/// Settings as the viewer sees them: the last persisted value plus the latest
/// unconfirmed change, if any. The visible value is always the latest intent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimisticSettings {
    confirmed: ModelSettings,
    confirmed_ticket: u64,
    pending: Option<Pending>,
    next_ticket: u64,
}

impl OptimisticSettings {
    pub fn new(confirmed: ModelSettings) -> Self {
        Self {
            confirmed,
            confirmed_ticket: 0,
            pending: None,
            next_ticket: 0,
        }
    }

    pub fn current(&self) -> &ModelSettings {
        self.pending.as_ref().map(|p| &p.value).unwrap_or(&self.confirmed)
    }

    pub fn confirmed(&self) -> &ModelSettings {
        &self.confirmed
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether no proposal has been made since `ticket`.
    pub fn is_latest(&self, ticket: u64) -> bool {
        ticket == self.next_ticket
    }

    /// Applies `value` immediately. The ticket identifies the persist call.
    pub fn propose(&mut self, value: ModelSettings) -> u64 {
        self.next_ticket += 1;
        self.pending = Some(Pending {
            ticket: self.next_ticket,
            value,
        });
        self.next_ticket
    }

    /// Records a successful persist. Saves can finish in any order, so a
    /// ticket older than the last confirmed one is ignored.
    pub fn confirm(&mut self, ticket: u64, persisted: ModelSettings) {
        if ticket <= self.confirmed_ticket {
            return;
        }
        self.confirmed = persisted;
        self.confirmed_ticket = ticket;
        if self.pending.as_ref().is_some_and(|p| p.ticket <= ticket) {
            self.pending = None;
        }
    }

    /// Drops the pending value if it still belongs to `ticket`. A newer change
    /// keeps showing; returns whether the visible value reverted.
    pub fn rollback(&mut self, ticket: u64) -> bool {
        if self.pending.as_ref().is_some_and(|p| p.ticket == ticket) {
            self.pending = None;
            true
        } else {
            false
        }
    }
}
