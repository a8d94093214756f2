use std::fmt;

use rtsp_types::headers::{self, RtpLowerTransport, RtpProfile, RtpTransport};

use crate::error::{ParseErrorKind, Result, RtspError};

/// RTP profile of a transport spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Profile {
    #[default]
    Avp,
    Savp,
    Avpf,
    Savpf,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Avp => "AVP",
            Profile::Savp => "SAVP",
            Profile::Avpf => "AVPF",
            Profile::Savpf => "SAVPF",
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Profile::Savp | Profile::Savpf)
    }
}

/// How RTP travels: UDP unicast, UDP multicast or interleaved on the RTSP
/// TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LowerTransport {
    #[default]
    Udp,
    UdpMcast,
    Tcp,
}

/// A port or channel pair; `-1` means "not given".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: i32,
    pub max: i32,
}

impl PortRange {
    pub const UNSET: PortRange = PortRange { min: -1, max: -1 };

    pub fn new(min: i32, max: i32) -> Self {
        PortRange { min, max }
    }

    pub fn is_set(&self) -> bool {
        self.min >= 0
    }

    fn from_ports((min, max): (u16, Option<u16>)) -> Self {
        PortRange::new(i32::from(min), max.map_or(-1, i32::from))
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::UNSET
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max >= 0 {
            write!(f, "{}-{}", self.min, self.max)
        } else {
            write!(f, "{}", self.min)
        }
    }
}

/// One transport spec of a `Transport` header (RFC 2326 §12.39).
///
/// ```text
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// Transport: RTP/AVP;unicast;client_port=8000-8001
/// Transport: RTP/AVP;multicast;destination=224.2.0.1;port=5000-5001;ttl=16
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub profile: Profile,
    pub lower_transport: LowerTransport,
    pub destination: Option<String>,
    pub source: Option<String>,
    pub layers: Option<u32>,
    pub mode_play: bool,
    pub mode_record: bool,
    pub append: bool,
    pub ttl: u32,
    pub port: PortRange,
    pub client_port: PortRange,
    pub server_port: PortRange,
    pub interleaved: PortRange,
    pub ssrc: Option<u32>,
}

impl Default for Transport {
    fn default() -> Self {
        Transport {
            profile: Profile::Avp,
            lower_transport: LowerTransport::Udp,
            destination: None,
            source: None,
            layers: None,
            mode_play: true,
            mode_record: false,
            append: false,
            ttl: 0,
            port: PortRange::UNSET,
            client_port: PortRange::UNSET,
            server_port: PortRange::UNSET,
            interleaved: PortRange::UNSET,
            ssrc: None,
        }
    }
}

impl Transport {
    /// Parse a single transport spec. Unknown parameters are ignored.
    ///
    /// ```
    /// use rtsp::protocol::{LowerTransport, Transport};
    ///
    /// let t = Transport::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(t.lower_transport, LowerTransport::Udp);
    /// assert_eq!((t.client_port.min, t.client_port.max), (8000, 8001));
    ///
    /// let t = Transport::parse("RTP/AVP/TCP;interleaved=2-3;mode=\"RECORD\"").unwrap();
    /// assert_eq!(t.lower_transport, LowerTransport::Tcp);
    /// assert!(t.mode_record && !t.mode_play);
    ///
    /// assert!(Transport::parse("RAW/RAW/UDP").is_err());
    /// ```
    pub fn parse(spec: &str) -> Result<Self> {
        let bad = || RtspError::parse(ParseErrorKind::InvalidTransport);
        let request = rtsp_types::Request::builder(rtsp_types::Method::Setup, rtsp_types::Version::V1_0)
            .header(headers::TRANSPORT, normalize(spec))
            .empty();
        let transports = request
            .typed_header::<headers::Transports>()
            .map_err(|_| bad())?
            .ok_or_else(bad)?;
        match transports.as_slice() {
            [headers::Transport::Rtp(rtp)] => Transport::from_rtp(rtp),
            _ => Err(bad()),
        }
    }

    fn from_rtp(rtp: &RtpTransport) -> Result<Self> {
        let bad = || RtspError::parse(ParseErrorKind::InvalidTransport);
        let params = &rtp.params;

        let profile = match rtp.profile {
            RtpProfile::Avp => Profile::Avp,
            RtpProfile::SAvp => Profile::Savp,
            RtpProfile::AvpF => Profile::Avpf,
            RtpProfile::SAvpF => Profile::Savpf,
            RtpProfile::Other(_) => return Err(bad()),
        };
        let lower_transport = match (&rtp.lower_transport, params.multicast) {
            (Some(RtpLowerTransport::Tcp), true) | (Some(RtpLowerTransport::Other(_)), _) => {
                return Err(bad());
            }
            (Some(RtpLowerTransport::Tcp), false) => LowerTransport::Tcp,
            (_, true) => LowerTransport::UdpMcast,
            (_, false) => LowerTransport::Udp,
        };

        let (mode_play, mode_record) = if params.mode.is_empty() {
            (true, false)
        } else {
            let has = |name: &str| params.mode.iter().any(|m| m.as_str().eq_ignore_ascii_case(name));
            (has("play"), has("record") || has("receive"))
        };

        let layers = match params.others.get("layers") {
            Some(Some(v)) => Some(v.parse().map_err(|_| bad())?),
            Some(None) => return Err(bad()),
            None => None,
        };
        for name in params.others.keys().filter(|k| *k != "layers") {
            tracing::trace!(param = %name, "ignoring transport parameter");
        }

        Ok(Transport {
            profile,
            lower_transport,
            destination: params.destination.as_deref().map(unquote),
            source: params.source.as_deref().map(unquote),
            layers,
            mode_play,
            mode_record,
            append: params.append,
            ttl: params.ttl.map_or(0, u32::from),
            port: params.port.map_or(PortRange::UNSET, PortRange::from_ports),
            client_port: params.client_port.map_or(PortRange::UNSET, PortRange::from_ports),
            server_port: params.server_port.map_or(PortRange::UNSET, PortRange::from_ports),
            interleaved: params.interleaved.map_or(PortRange::UNSET, |(min, max)| {
                PortRange::new(i32::from(min), max.map_or(-1, i32::from))
            }),
            // RTSP 2.0 allows a '/'-separated list
            ssrc: params.ssrc.first().copied(),
        })
    }

    /// The transport-spec text, with the lower transport spelled out only
    /// for TCP.
    pub fn as_text(&self) -> String {
        let mut out = format!("RTP/{}", self.profile.as_str());
        match self.lower_transport {
            LowerTransport::Tcp => out.push_str("/TCP;unicast"),
            LowerTransport::Udp => out.push_str(";unicast"),
            LowerTransport::UdpMcast => out.push_str(";multicast"),
        }
        if let Some(dest) = &self.destination {
            out.push_str(&format!(";destination={dest}"));
        }
        if let Some(source) = &self.source {
            out.push_str(&format!(";source={source}"));
        }
        if let Some(layers) = self.layers {
            out.push_str(&format!(";layers={layers}"));
        }
        if self.mode_record {
            let mode = if self.mode_play { "PLAY,RECORD" } else { "RECORD" };
            out.push_str(&format!(";mode=\"{mode}\""));
        }
        if self.append {
            out.push_str(";append");
        }
        if self.lower_transport == LowerTransport::UdpMcast && self.ttl > 0 {
            out.push_str(&format!(";ttl={}", self.ttl));
        }
        for (name, range) in [
            ("port", self.port),
            ("client_port", self.client_port),
            ("server_port", self.server_port),
            ("interleaved", self.interleaved),
        ] {
            if range.is_set() {
                out.push_str(&format!(";{name}={range}"));
            }
        }
        if let Some(ssrc) = self.ssrc {
            out.push_str(&format!(";ssrc={ssrc:08X}"));
        }
        out
    }
}

/// Upper-cases the protocol part, lower-cases parameter names and drops
/// empty parameters. The typed header parser is case sensitive.
fn normalize(spec: &str) -> String {
    let mut parts = spec.trim().split(';').map(str::trim).filter(|p| !p.is_empty());
    let mut out = parts.next().unwrap_or_default().to_ascii_uppercase();
    for param in parts {
        out.push(';');
        match param.split_once('=') {
            Some((name, value)) => {
                out.push_str(&name.trim().to_ascii_lowercase());
                out.push('=');
                out.push_str(value.trim());
            }
            None => out.push_str(&param.to_ascii_lowercase()),
        }
    }
    out
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').to_string()
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}
