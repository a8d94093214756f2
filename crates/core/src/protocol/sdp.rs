//! SDP session descriptions (RFC 4566 / RFC 8866).
//!
//! Only the parts DESCRIBE and ANNOUNCE need: building a description of a
//! prepared media, and reading media sections and their attributes back
//! out of an announced one.
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- <sess-id> 1 IN IP4 <addr>                ← origin
//! s=Session streamed with rtsp-rs              ← session name
//! i=rtsp-server                                ← session information
//! t=0 0                                        ← timing (live stream)
//! a=tool:rtsp-rs                               ← server software
//! a=type:broadcast
//! a=control:*                                  ← aggregate control
//! m=video 0 RTP/AVP 96                         ← media description
//! c=IN IP4 0.0.0.0
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=control:stream=0                           ← per-stream control URL
//! ```

use std::fmt;

use crate::error::{ParseErrorKind, Result, RtspError};

/// One `m=` section with its own `c=` and `a=` lines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdpMedia {
    pub media: String,
    pub port: u16,
    pub num_ports: Option<u16>,
    pub proto: String,
    pub formats: Vec<String>,
    pub connection: Option<String>,
    pub attributes: Vec<(String, Option<String>)>,
}

/// A session description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sdp {
    pub origin: String,
    pub session_name: String,
    pub information: Option<String>,
    pub connection: Option<String>,
    pub times: Vec<String>,
    pub attributes: Vec<(String, Option<String>)>,
    pub medias: Vec<SdpMedia>,
}

fn find_attribute<'a>(attrs: &'a [(String, Option<String>)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_deref().unwrap_or_default())
}

fn parse_attribute(value: &str) -> (String, Option<String>) {
    match value.split_once(':') {
        Some((k, v)) => (k.to_string(), Some(v.to_string())),
        None => (value.to_string(), None),
    }
}

impl SdpMedia {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        find_attribute(&self.attributes, name)
    }

    pub fn add_attribute(&mut self, name: &str, value: Option<&str>) {
        self.attributes.push((name.to_string(), value.map(str::to_string)));
    }

    /// `(encoding, clock_rate)` from the `a=rtpmap` of payload type `pt`.
    pub fn rtpmap(&self, pt: &str) -> Option<(String, u32)> {
        self.attributes
            .iter()
            .filter(|(k, _)| k == "rtpmap")
            .filter_map(|(_, v)| v.as_deref())
            .find_map(|v| {
                let (fmt, rest) = v.split_once(' ')?;
                if fmt != pt {
                    return None;
                }
                let mut parts = rest.trim().split('/');
                let encoding = parts.next()?.to_string();
                let clock_rate = parts.next()?.parse().ok()?;
                Some((encoding, clock_rate))
            })
    }
}

impl Sdp {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        find_attribute(&self.attributes, name)
    }

    pub fn add_attribute(&mut self, name: &str, value: Option<&str>) {
        self.attributes.push((name.to_string(), value.map(str::to_string)));
    }

    /// Parse an SDP body. Lines of unknown types are skipped; a missing
    /// `v=0`, a malformed `m=` line or an empty body is an error.
    pub fn parse(text: &str) -> Result<Self> {
        let bad = || RtspError::parse(ParseErrorKind::InvalidSdp);
        let mut sdp = Sdp::default();
        let mut saw_version = false;

        for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            let (kind, value) = line.split_once('=').ok_or_else(bad)?;
            match kind {
                "v" => {
                    if value != "0" {
                        return Err(bad());
                    }
                    saw_version = true;
                }
                _ if !saw_version => return Err(bad()),
                "m" => {
                    let mut fields = value.split_whitespace();
                    let media = fields.next().ok_or_else(bad)?.to_string();
                    let ports = fields.next().ok_or_else(bad)?;
                    let (port, num_ports) = match ports.split_once('/') {
                        Some((p, n)) => (p, Some(n.parse().map_err(|_| bad())?)),
                        None => (ports, None),
                    };
                    sdp.medias.push(SdpMedia {
                        media,
                        port: port.parse().map_err(|_| bad())?,
                        num_ports,
                        proto: fields.next().ok_or_else(bad)?.to_string(),
                        formats: fields.map(str::to_string).collect(),
                        ..SdpMedia::default()
                    });
                }
                "a" => match sdp.medias.last_mut() {
                    Some(m) => m.attributes.push(parse_attribute(value)),
                    None => sdp.attributes.push(parse_attribute(value)),
                },
                "c" => match sdp.medias.last_mut() {
                    Some(m) => m.connection = Some(value.to_string()),
                    None => sdp.connection = Some(value.to_string()),
                },
                "o" => sdp.origin = value.to_string(),
                "s" => sdp.session_name = value.to_string(),
                "i" if sdp.medias.is_empty() => sdp.information = Some(value.to_string()),
                "t" => sdp.times.push(value.to_string()),
                _ => {}
            }
        }

        if !saw_version {
            return Err(bad());
        }
        Ok(sdp)
    }
}

fn write_attributes(f: &mut fmt::Formatter<'_>, attrs: &[(String, Option<String>)]) -> fmt::Result {
    for (name, value) in attrs {
        match value {
            Some(v) => write!(f, "a={name}:{v}\r\n")?,
            None => write!(f, "a={name}\r\n")?,
        }
    }
    Ok(())
}

impl fmt::Display for Sdp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\no={}\r\ns={}\r\n", self.origin, self.session_name)?;
        if let Some(info) = &self.information {
            write!(f, "i={info}\r\n")?;
        }
        if let Some(c) = &self.connection {
            write!(f, "c={c}\r\n")?;
        }
        for t in &self.times {
            write!(f, "t={t}\r\n")?;
        }
        write_attributes(f, &self.attributes)?;
        for m in &self.medias {
            write!(f, "m={} {}", m.media, m.port)?;
            if let Some(n) = m.num_ports {
                write!(f, "/{n}")?;
            }
            write!(f, " {}", m.proto)?;
            for pt in &m.formats {
                write!(f, " {pt}")?;
            }
            f.write_str("\r\n")?;
            if let Some(c) = &m.connection {
                write!(f, "c={c}\r\n")?;
            }
            write_attributes(f, &m.attributes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANNOUNCED: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=No Name\r\n\
        c=IN IP4 127.0.0.1\r\n\
        t=0 0\r\n\
        a=tool:libavformat\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1\r\n\
        a=control:streamid=0\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n\
        a=control:streamid=1\r\n";

    #[test]
    fn parse_announced_description() {
        let sdp = Sdp::parse(ANNOUNCED).unwrap();
        assert_eq!(sdp.session_name, "No Name");
        assert_eq!(sdp.attribute("tool"), Some("libavformat"));
        assert_eq!(sdp.medias.len(), 2);

        let video = &sdp.medias[0];
        assert_eq!(video.media, "video");
        assert_eq!(video.formats, vec!["96"]);
        assert_eq!(video.attribute("control"), Some("streamid=0"));
        assert_eq!(video.rtpmap("96"), Some(("H264".to_string(), 90000)));
        assert_eq!(sdp.medias[1].rtpmap("97"), Some(("MPEG4-GENERIC".to_string(), 48000)));
    }

    #[test]
    fn rejects_missing_version_and_bad_media() {
        assert!(Sdp::parse("").is_err());
        assert!(Sdp::parse("s=x\r\n").is_err());
        assert!(Sdp::parse("v=0\r\nm=video x RTP/AVP 96\r\n").is_err());
    }

    #[test]
    fn serializes_sections_in_order() {
        let mut sdp = Sdp {
            origin: "- 1 1 IN IP4 10.0.0.1".into(),
            session_name: "test".into(),
            times: vec!["0 0".into()],
            ..Sdp::default()
        };
        sdp.add_attribute("control", Some("*"));
        let mut m = SdpMedia {
            media: "video".into(),
            proto: "RTP/AVP".into(),
            formats: vec!["96".into()],
            connection: Some("IN IP4 0.0.0.0".into()),
            ..SdpMedia::default()
        };
        m.add_attribute("rtpmap", Some("96 H264/90000"));
        m.add_attribute("sendonly", None);
        sdp.medias.push(m);

        assert_eq!(
            sdp.to_string(),
            "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=test\r\nt=0 0\r\na=control:*\r\n\
             m=video 0 RTP/AVP 96\r\nc=IN IP4 0.0.0.0\r\na=rtpmap:96 H264/90000\r\na=sendonly\r\n"
        );
    }
}
