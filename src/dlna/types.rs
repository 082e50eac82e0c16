use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

pub const AV_TRANSPORT: &str = "urn:schemas-upnp-org:service:AVTransport:1";
pub const RENDERING_CONTROL: &str = "urn:schemas-upnp-org:service:RenderingControl:1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    NoMediaPresent,
    Playing,
    Paused,
    PausedPlayback,
    Stopped,
    Transitioning,
    Error,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoMediaPresent => "NO_MEDIA_PRESENT",
            Self::Playing => "PLAYING",
            Self::Paused => "PAUSED",
            Self::PausedPlayback => "PAUSED_PLAYBACK",
            Self::Stopped => "STOPPED",
            Self::Transitioning => "TRANSITIONING",
            Self::Error => "ERROR",
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused | Self::PausedPlayback)
    }
}

impl FromStr for TransportState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NO_MEDIA_PRESENT" => Ok(Self::NoMediaPresent),
            "PLAYING" => Ok(Self::Playing),
            "PAUSED" => Ok(Self::Paused),
            "PAUSED_PLAYBACK" => Ok(Self::PausedPlayback),
            "STOPPED" => Ok(Self::Stopped),
            "TRANSITIONING" => Ok(Self::Transitioning),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown transport state {other}")),
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Control and event endpoints of one UPnP service, relative to the device
/// base URL or absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(rename = "serviceType")]
    pub service_type: String,
    #[serde(rename = "controlUrl")]
    pub control_url: String,
    #[serde(rename = "eventSubUrl")]
    pub event_sub_url: String,
}

/// Immutable description of a renderer, discovered once.
///
/// The native volume range is assumed linear. Devices with a logarithmic or
/// otherwise non-linear scale are not supported and will be mis-scaled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "avTransport")]
    pub av_transport: ServiceEndpoint,
    #[serde(rename = "renderingControl")]
    pub rendering_control: ServiceEndpoint,
    #[serde(rename = "volumeMin", default)]
    pub volume_min: u32,
    #[serde(rename = "volumeMax", default = "default_volume_max")]
    pub volume_max: u32,
}

fn default_volume_max() -> u32 {
    100
}

impl DeviceProperties {
    /// Native volume to 0-100.
    pub fn normalize_volume(&self, native: u32) -> u32 {
        let span = self.volume_max.saturating_sub(self.volume_min);
        if span == 0 {
            return 0;
        }
        let offset = native.clamp(self.volume_min, self.volume_max) - self.volume_min;
        ((offset as f64 / span as f64) * 100.0).round() as u32
    }

    /// 0-100 to native volume.
    pub fn native_volume(&self, normalized: u32) -> u32 {
        let span = self.volume_max.saturating_sub(self.volume_min);
        let pct = normalized.min(100) as f64 / 100.0;
        self.volume_min + (pct * span as f64).round() as u32
    }

    pub fn endpoint(&self, service_type: &str) -> Option<&ServiceEndpoint> {
        [&self.av_transport, &self.rendering_control]
            .into_iter()
            .find(|e| e.service_type == service_type)
    }
}

/// Media currently loaded on the renderer. Two descriptors denote the same
/// media when their URIs match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub uri: String,
    pub title: Option<String>,
    pub metadata: Option<String>,
}

impl PartialEq for MediaInfo {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for MediaInfo {}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    PlaybackStart {
        device: String,
        media: MediaInfo,
    },
    PlaybackProgress {
        device: String,
        media: MediaInfo,
        position: Option<Duration>,
    },
    MediaChanged {
        device: String,
        old: MediaInfo,
        new: MediaInfo,
    },
    PlaybackStopped {
        device: String,
        media: MediaInfo,
    },
    Unavailable {
        device: String,
    },
}

impl DeviceEvent {
    pub fn device(&self) -> &str {
        match self {
            Self::PlaybackStart { device, .. }
            | Self::PlaybackProgress { device, .. }
            | Self::MediaChanged { device, .. }
            | Self::PlaybackStopped { device, .. }
            | Self::Unavailable { device } => device,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvTransportRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub metadata: String,
    pub play_immediately: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Play,
    Pause,
    Stop,
    /// Normalized 0-100.
    SetVolume(u32),
    SetMute(bool),
    Seek(Duration),
    SetAvTransport(AvTransportRequest),
}

/// Commands that coalesce with each other share a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Transport,
    Volume,
    Mute,
    Seek,
    SetAvTransport,
}

impl DeviceCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Play | Self::Pause | Self::Stop => CommandKind::Transport,
            Self::SetVolume(_) => CommandKind::Volume,
            Self::SetMute(_) => CommandKind::Mute,
            Self::Seek(_) => CommandKind::Seek,
            Self::SetAvTransport(_) => CommandKind::SetAvTransport,
        }
    }
}
