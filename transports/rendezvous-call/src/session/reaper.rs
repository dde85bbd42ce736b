//! Resource reaper
//!
//! Single teardown path for a call: local tracks are stopped first, then the
//! peer connection is closed, then the link is closed without reconnection.
//! Running it twice, or with nothing to release, is harmless.

use crate::media::MediaDevices;
use crate::peer::NegotiationEngine;
use crate::signaling::{CloseMode, LinkState, RendezvousLink};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// What a teardown released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Local track sets released
    pub tracks_released: usize,
    /// Whether a peer connection was closed
    pub peer_closed: bool,
    /// Whether the link was closed
    pub link_closed: bool,
}

impl TeardownReport {
    /// Whether anything was released
    pub fn is_empty(&self) -> bool {
        self.tracks_released == 0 && !self.peer_closed && !self.link_closed
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tracks_released={} peer_closed={} link_closed={}",
            self.tracks_released, self.peer_closed, self.link_closed
        )
    }
}

/// Ordered, idempotent teardown of a call
pub struct Reaper {
    media: Arc<dyn MediaDevices>,
}

impl Reaper {
    /// Create a reaper releasing tracks through `media`
    pub fn new(media: Arc<dyn MediaDevices>) -> Self {
        Self { media }
    }

    /// Release the live session and close the link
    pub async fn teardown(
        &self,
        engine: &mut NegotiationEngine,
        link: &mut RendezvousLink,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();

        if let Some(mut session) = engine.take_session() {
            if let Some(tracks) = session.take_tracks() {
                self.media.release_audio_input(tracks).await;
                report.tracks_released += 1;
            }

            if let Err(e) = session.peer().close().await {
                warn!(session = %session.id(), "Failed to close peer connection: {}", e);
            }
            report.peer_closed = true;
        }

        if link.is_active() || link.state() != LinkState::Closed {
            link.close(CloseMode::Final).await;
            report.link_closed = true;
        }

        if report.is_empty() {
            info!("Teardown: nothing to release");
        } else {
            info!("Teardown complete: {}", report);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::media::{DrainPlayback, SilentMicrophone};
    use crate::peer::EngineEventSink;
    use crate::signaling::{MemoryConnector, RelayHub};

    fn parts(hub: &RelayHub, mic: &SilentMicrophone) -> (NegotiationEngine, RendezvousLink, Reaper) {
        let sink: EngineEventSink = Arc::new(|_, _| {});
        let config = ClientConfig::with_signaling_url("ws://relay.local/ws");
        let engine = NegotiationEngine::new(
            config.clone(),
            Arc::new(mic.clone()),
            Arc::new(DrainPlayback::new()),
            sink,
        );
        let link = RendezvousLink::new(config, Arc::new(MemoryConnector::new(hub.clone())));
        (engine, link, Reaper::new(Arc::new(mic.clone())))
    }

    #[tokio::test]
    async fn test_teardown_releases_everything_once() {
        let hub = RelayHub::new();
        let mic = SilentMicrophone::new();
        let (mut engine, mut link, reaper) = parts(&hub, &mic);

        link.connect("alice").await.unwrap();
        engine.set_self_id("alice");
        engine.prepare_local_side().await.unwrap();

        let report = reaper.teardown(&mut engine, &mut link).await;
        assert_eq!(report.tracks_released, 1);
        assert!(report.peer_closed);
        assert!(report.link_closed);
        assert_eq!(mic.audit().active(), 0);
        assert_eq!(link.state(), LinkState::Closed);
        assert!(!hub.is_connected("alice"));

        let again = reaper.teardown(&mut engine, &mut link).await;
        assert!(again.is_empty());
        assert_eq!(mic.audit().released(), 1);
    }

    #[tokio::test]
    async fn test_teardown_with_nothing_live() {
        let hub = RelayHub::new();
        let mic = SilentMicrophone::new();
        let (mut engine, mut link, reaper) = parts(&hub, &mic);

        let report = reaper.teardown(&mut engine, &mut link).await;
        assert!(report.is_empty());
    }
}
