//! Local capture and remote playback

pub mod tracks;

pub use tracks::{
    AudioTrackSet, DeviceAudit, DrainPlayback, MediaDevices, MutedPlayback, PlaybackSink,
    SilentMicrophone, FRAME_DURATION,
};
