use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{Cursor, Guarded, Projection, ProjectionError, ProjectionState, read, write};
use crate::event::Event;
use crate::event_type::EventType;
use crate::payload::ProviderPollObserved;

/// Opaque per-provider driver state, taken from the `state` field of poll
/// observations and handed back to drivers after a restart.
#[derive(Debug, Default)]
pub struct ProviderStateProjection {
    inner: RwLock<Guarded<BTreeMap<String, String>>>,
}

impl ProviderStateProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_for(&self, provider_id: &str) -> Option<String> {
        read(&self.inner).data.get(provider_id).cloned()
    }
}

impl Projection for ProviderStateProjection {
    type View = BTreeMap<String, String>;

    const NAME: &'static str = "provider_states";

    fn apply(&self, event: &Event) -> Result<(), ProjectionError> {
        let mut guard = write(&self.inner);
        if event.event_type == EventType::ProviderPollObserved {
            let payload: ProviderPollObserved = event.decode_payload()?;
            if let Some(state) = payload.state {
                guard.data.insert(payload.provider_id, state);
            }
        }
        guard.cursor = Some(Cursor::of(event));
        Ok(())
    }

    fn state(&self) -> ProjectionState<Self::View> {
        let guard = read(&self.inner);
        ProjectionState {
            cursor: guard.cursor.clone(),
            view: guard.data.clone(),
        }
    }

    fn load_state(&self, cursor: Option<Cursor>, view: Self::View) {
        let mut guard = write(&self.inner);
        guard.cursor = cursor;
        guard.data = view;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::fixtures::event_at;

    #[test]
    fn keeps_latest_blob_per_provider() {
        let projection = ProviderStateProjection::new();
        for (id, state) in [("p1", "etag-1"), ("p2", "etag-2")] {
            projection
                .apply(&event_at(
                    id,
                    EventType::ProviderPollObserved,
                    0,
                    json!({"provider_id": "github", "status": "success", "state": state}),
                ))
                .unwrap();
        }
        assert_eq!(projection.state_for("github").as_deref(), Some("etag-2"));
        assert_eq!(projection.state_for("openai"), None);
    }

    #[test]
    fn poll_without_blob_keeps_previous() {
        let projection = ProviderStateProjection::new();
        projection
            .apply(&event_at(
                "p1",
                EventType::ProviderPollObserved,
                0,
                json!({"provider_id": "github", "status": "success", "state": "etag-1"}),
            ))
            .unwrap();
        projection
            .apply(&event_at(
                "p2",
                EventType::ProviderPollObserved,
                1,
                json!({"provider_id": "github", "status": "success"}),
            ))
            .unwrap();
        assert_eq!(projection.state_for("github").as_deref(), Some("etag-1"));
        assert_eq!(projection.state().cursor.unwrap().event_id.as_str(), "p2");
    }
}
