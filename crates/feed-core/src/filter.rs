use crate::wire::{InboundMessage, NEW_TX_ACCEPTED};
use crate::{ItemKind, TxSummary};

/// Decides whether a live message belongs on a given list screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFilter {
    pub event: String,
    pub kind: Option<ItemKind>,
    pub token: Option<String>,
    pub address: Option<String>,
}

impl Default for LiveFilter {
    fn default() -> Self {
        Self {
            event: NEW_TX_ACCEPTED.to_string(),
            kind: None,
            token: None,
            address: None,
        }
    }
}

impl LiveFilter {
    pub fn for_kind(kind: ItemKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, uid: impl Into<String>) -> Self {
        self.token = Some(uid.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// The message decoded as a feed item, when it passes every criterion.
    pub fn matches(&self, message: &InboundMessage) -> Option<TxSummary> {
        if message.kind() != self.event {
            return None;
        }
        let item: TxSummary = message.payload().ok()?;
        self.accepts(&item).then_some(item)
    }

    pub fn accepts(&self, item: &TxSummary) -> bool {
        if let Some(kind) = self.kind {
            if item.kind() != kind {
                return false;
            }
        }
        if let Some(token) = &self.token {
            if !item.involves_token(token) {
                return false;
            }
        }
        if let Some(address) = &self.address {
            if !item.involves_address(address) {
                return false;
            }
        }
        true
    }
}
