//! Audio capture and playback collaborators
//!
//! The negotiation engine only sees the [`MediaDevices`] and [`PlaybackSink`]
//! traits. [`SilentMicrophone`] and [`DrainPlayback`] are headless
//! implementations used by the CLI client and the tests.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Opus frame duration
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// A single 20ms Opus frame of silence (TOC byte for CELT FB 20ms, stereo)
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Local audio tracks from one acquisition
///
/// Dropping the set stops any capture task still feeding the tracks.
pub struct AudioTrackSet {
    id: u64,
    tracks: Vec<Arc<TrackLocalStaticSample>>,
    capture: Vec<JoinHandle<()>>,
}

impl AudioTrackSet {
    /// Create a set from already-built tracks
    pub fn new(id: u64, tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        Self {
            id,
            tracks,
            capture: Vec::new(),
        }
    }

    /// Attach a capture task that is stopped with the set
    pub fn with_capture(mut self, task: JoinHandle<()>) -> Self {
        self.capture.push(task);
        self
    }

    /// Acquisition number
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Tracks to attach to the peer connection
    pub fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }

    /// Number of tracks
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Whether the set holds no tracks
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Stop capture tasks
    pub fn stop(&mut self) {
        for task in self.capture.drain(..) {
            task.abort();
        }
    }
}

impl Drop for AudioTrackSet {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Local audio capture device
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Start capture and return the resulting tracks
    async fn acquire_audio_input(&self) -> Result<AudioTrackSet>;

    /// Stop capture for a set returned by [`MediaDevices::acquire_audio_input`]
    async fn release_audio_input(&self, tracks: AudioTrackSet);
}

/// Destination for remote audio
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Start playing a remote track
    ///
    /// Returns [`Error::PlaybackPermissionDenied`] when playback needs user
    /// interaction first.
    async fn play(&self, track: Arc<TrackRemote>) -> Result<()>;
}

/// Acquisition counters of a [`MediaDevices`] implementation
#[derive(Debug, Clone, Default)]
pub struct DeviceAudit {
    acquired: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
}

impl DeviceAudit {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    fn record_acquire(&self) -> u64 {
        self.acquired.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    /// Successful acquisitions so far
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Releases so far
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Track sets acquired and not yet released
    pub fn active(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

/// Microphone that captures Opus silence
///
/// Each acquisition yields one 48kHz stereo Opus track fed with a silence
/// frame every 20ms until released.
#[derive(Clone, Default)]
pub struct SilentMicrophone {
    audit: DeviceAudit,
    unavailable: Arc<AtomicBool>,
}

impl SilentMicrophone {
    /// Create an available microphone
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters shared with every clone of this microphone
    pub fn audit(&self) -> DeviceAudit {
        self.audit.clone()
    }

    /// Make acquisitions fail (`false`) or succeed (`true`)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn opus_track(id: u64) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", id),
            format!("microphone-{}", id),
        ))
    }
}

#[async_trait]
impl MediaDevices for SilentMicrophone {
    async fn acquire_audio_input(&self) -> Result<AudioTrackSet> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::MediaAcquisitionFailed(
                "No audio input device available".to_string(),
            ));
        }

        let id = self.audit.record_acquire();
        let track = Self::opus_track(id);

        let capture_track = Arc::clone(&track);
        let capture = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            loop {
                ticker.tick().await;
                let sample = Sample {
                    data: Bytes::from_static(&OPUS_SILENCE),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = capture_track.write_sample(&sample).await {
                    debug!("Failed to write silence frame: {}", e);
                }
            }
        });

        info!("Acquired audio input {}", id);
        Ok(AudioTrackSet::new(id, vec![track]).with_capture(capture))
    }

    async fn release_audio_input(&self, mut tracks: AudioTrackSet) {
        tracks.stop();
        self.audit.record_release();
        info!("Released audio input {}", tracks.id());
    }
}

/// Playback sink that reads and discards remote RTP
#[derive(Clone, Default)]
pub struct DrainPlayback {
    tracks: Arc<AtomicU64>,
    packets: Arc<AtomicU64>,
    deny: Arc<AtomicBool>,
}

impl DrainPlayback {
    /// Create a sink that accepts every track
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse playback as if user interaction were required
    pub fn deny_permission(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Remote tracks started
    pub fn tracks_started(&self) -> u64 {
        self.tracks.load(Ordering::SeqCst)
    }

    /// RTP packets drained across all tracks
    pub fn packets_received(&self) -> u64 {
        self.packets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackSink for DrainPlayback {
    async fn play(&self, track: Arc<TrackRemote>) -> Result<()> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::PlaybackPermissionDenied(
                "Playback requires user interaction".to_string(),
            ));
        }

        self.tracks.fetch_add(1, Ordering::SeqCst);
        info!(
            "Playing remote {} track ssrc={} ({})",
            track.kind(),
            track.ssrc(),
            track.codec().capability.mime_type
        );

        let packets = Arc::clone(&self.packets);
        tokio::spawn(async move {
            loop {
                match track.read_rtp().await {
                    Ok(_) => {
                        packets.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        debug!("Remote track ssrc={} ended: {}", track.ssrc(), e);
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}

/// Playback sink that refuses every track
#[derive(Debug, Clone, Copy, Default)]
pub struct MutedPlayback;

#[async_trait]
impl PlaybackSink for MutedPlayback {
    async fn play(&self, track: Arc<TrackRemote>) -> Result<()> {
        warn!("Remote track ssrc={} arrived with playback muted", track.ssrc());
        Err(Error::PlaybackPermissionDenied(
            "Playback is muted".to_string(),
        ))
    }
}
