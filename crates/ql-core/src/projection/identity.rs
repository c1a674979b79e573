use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Cursor, Guarded, Projection, ProjectionError, ProjectionState, read, write};
use crate::event::Event;
use crate::event_type::EventType;
use crate::payload::IdentityRegistered;

/// A registered actor that can submit intents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Hash of the identity's bearer token, kept so a restored snapshot can
    /// rebuild the token index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_hash: Option<String>,
}

#[derive(Debug, Default)]
struct Identities {
    by_id: BTreeMap<String, Identity>,
    by_token: HashMap<String, String>,
}

impl Identities {
    fn insert(&mut self, identity: Identity) {
        if let Some(previous) = self.by_id.get(&identity.id) {
            if let Some(hash) = &previous.token_hash {
                self.by_token.remove(hash);
            }
        }
        if let Some(hash) = &identity.token_hash {
            self.by_token.insert(hash.clone(), identity.id.clone());
        }
        self.by_id.insert(identity.id.clone(), identity);
    }

    fn remove(&mut self, id: &str) {
        if let Some(identity) = self.by_id.remove(id) {
            if let Some(hash) = identity.token_hash {
                self.by_token.remove(&hash);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct IdentityProjection {
    inner: RwLock<Guarded<Identities>>,
}

impl IdentityProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Identity> {
        read(&self.inner).data.by_id.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Identity> {
        read(&self.inner).data.by_id.values().cloned().collect()
    }

    pub fn by_token_hash(&self, hash: &str) -> Option<Identity> {
        let guard = read(&self.inner);
        guard
            .data
            .by_token
            .get(hash)
            .and_then(|id| guard.data.by_id.get(id))
            .cloned()
    }
}

impl Projection for IdentityProjection {
    type View = Vec<Identity>;

    const NAME: &'static str = "identities";

    fn apply(&self, event: &Event) -> Result<(), ProjectionError> {
        let mut guard = write(&self.inner);
        let id = &event.dimensions.identity_id;
        match event.event_type {
            EventType::IdentityRegistered => {
                let payload: IdentityRegistered = event.decode_payload()?;
                guard.data.insert(Identity {
                    id: id.clone(),
                    kind: payload.kind,
                    metadata: payload.metadata,
                    token_hash: payload.token_hash.filter(|h| !h.is_empty()),
                });
            }
            EventType::IdentityDeleted => guard.data.remove(id),
            _ => {}
        }
        guard.cursor = Some(Cursor::of(event));
        Ok(())
    }

    fn state(&self) -> ProjectionState<Self::View> {
        let guard = read(&self.inner);
        ProjectionState {
            cursor: guard.cursor.clone(),
            view: guard.data.by_id.values().cloned().collect(),
        }
    }

    fn load_state(&self, cursor: Option<Cursor>, view: Self::View) {
        let mut identities = Identities::default();
        for identity in view {
            identities.insert(identity);
        }
        let mut guard = write(&self.inner);
        guard.cursor = cursor;
        guard.data = identities;
    }
}
