//! WebRTC peer connection construction

use crate::config::ClientConfig;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{info, instrument};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

/// ICE server list for the configured STUN servers
pub fn ice_servers(config: &ClientConfig) -> Vec<RTCIceServer> {
    config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect()
}

/// Create a peer connection with default codecs and interceptors
///
/// Audio uses the default Opus registration; the configured STUN servers
/// are the only ICE servers.
#[instrument(skip(config), fields(stun_servers = config.stun_servers.len()))]
pub async fn build_peer_connection(config: &ClientConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

    let interceptor_registry =
        register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
            Error::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(interceptor_registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: ice_servers(config),
        ..Default::default()
    };

    let peer_connection = api.new_peer_connection(rtc_config).await.map_err(|e| {
        Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
    })?;

    info!("Created peer connection");
    Ok(Arc::new(peer_connection))
}
