use serde::{Deserialize, Serialize};

use grantledger_core::{Entity, ProviderId};

/// Funding provider, owned by an external registry.
///
/// The ledger only needs to know whether it exists and whether it is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub is_active: bool,
}

impl Provider {
    pub fn new(id: ProviderId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            contact_email: None,
            contact_phone: None,
            is_active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

impl Entity for Provider {
    type Id = ProviderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
