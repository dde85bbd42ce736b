//! In-process control channel over a [`RelayHub`]

use super::connector::{Connector, FramePair};
use super::relay::{ConnectionId, RelayHub};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{sink, stream};
use tracing::debug;
use url::Url;

/// Dials a [`RelayHub`] in the same process
///
/// The identifier is read from the dialed URL's query parameter, exactly
/// like the WebSocket relay does.
#[derive(Clone)]
pub struct MemoryConnector {
    hub: RelayHub,
    id_param: String,
}

impl MemoryConnector {
    /// Create a connector for `hub` reading the `id` query parameter
    pub fn new(hub: RelayHub) -> Self {
        Self {
            hub,
            id_param: "id".to_string(),
        }
    }

    /// Use a different query parameter for the identifier
    pub fn with_id_param(mut self, name: impl Into<String>) -> Self {
        self.id_param = name.into();
        self
    }

    /// Hub this connector dials
    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }
}

/// Unregisters the channel when the incoming half is dropped
struct Registration {
    hub: RelayHub,
    id: String,
    conn: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.unregister(&self.id, self.conn);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn dial(&self, url: &Url) -> Result<FramePair> {
        let id = url
            .query_pairs()
            .find(|(key, _)| key == self.id_param.as_str())
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::WebSocketError("Missing id parameter".to_string()))?;

        self.hub.record_dial(&id);
        if !self.hub.is_reachable() {
            return Err(Error::WebSocketError(format!(
                "Failed to connect: relay refused {}",
                id
            )));
        }

        let (conn, rx) = self.hub.register(&id);
        debug!("In-process channel {} opened for {}", conn, id);

        let registration = Registration {
            hub: self.hub.clone(),
            id: id.clone(),
            conn,
        };
        let incoming = stream::unfold((rx, registration), |(mut rx, registration)| async move {
            rx.recv()
                .await
                .map(|text| (Ok(text), (rx, registration)))
        });

        let outgoing = sink::unfold((self.hub.clone(), id), |(hub, id), text: String| async move {
            hub.route(&id, &text);
            Ok::<_, Error>((hub, id))
        });

        Ok(FramePair {
            sink: Box::pin(outgoing),
            stream: Box::pin(incoming),
        })
    }
}
