use std::fmt;
use std::str::FromStr;

/// RTSP request methods (RFC 2326 §10, RFC 7826 §13).
///
/// `Get` and `Post` only appear on HTTP-tunnelled connections, where a
/// GET/POST pair carries the RTSP stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    Redirect,
    Record,
    Get,
    Post,
    /// Any token the server does not know.
    Invalid(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Redirect => "REDIRECT",
            Method::Record => "RECORD",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Invalid(token) => token,
        }
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            "REDIRECT" => Method::Redirect,
            "RECORD" => Method::Record,
            "GET" => Method::Get,
            "POST" => Method::Post,
            other => Method::Invalid(other.to_string()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version of a message start line.
///
/// Only RTSP/1.0 and RTSP/2.0 are served; anything else is answered with
/// `505 RTSP Version Not Supported`. The HTTP versions appear on tunnel
/// halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    #[default]
    V1_0,
    V1_1,
    V2_0,
    Http1_0,
    Http1_1,
    /// A syntactically valid but unknown `RTSP/x.y`.
    Unknown,
}

impl Version {
    /// Major protocol version, 0 for [`Version::Unknown`].
    pub fn major(self) -> u8 {
        match self {
            Version::V1_0 | Version::V1_1 | Version::Http1_0 | Version::Http1_1 => 1,
            Version::V2_0 => 2,
            Version::Unknown => 0,
        }
    }

    pub fn is_http(self) -> bool {
        matches!(self, Version::Http1_0 | Version::Http1_1)
    }

    /// Parses `RTSP/x.y` or `HTTP/x.y`. Returns `None` for other protocols.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(v) = s.strip_prefix("RTSP/") {
            return Some(match v {
                "1.0" => Version::V1_0,
                "1.1" => Version::V1_1,
                "2.0" => Version::V2_0,
                _ => Version::Unknown,
            });
        }
        match s {
            "HTTP/1.0" => Some(Version::Http1_0),
            "HTTP/1.1" => Some(Version::Http1_1),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Version::V1_0 | Version::Unknown => "RTSP/1.0",
            Version::V1_1 => "RTSP/1.1",
            Version::V2_0 => "RTSP/2.0",
            Version::Http1_0 => "HTTP/1.0",
            Version::Http1_1 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_keeps_token() {
        let m: Method = "FOO".parse().unwrap();
        assert_eq!(m, Method::Invalid("FOO".into()));
        assert_eq!(m.to_string(), "FOO");
        assert_eq!("GET_PARAMETER".parse::<Method>().unwrap(), Method::GetParameter);
    }

    #[test]
    fn version_parsing() {
        assert_eq!(Version::parse("RTSP/2.0"), Some(Version::V2_0));
        assert_eq!(Version::parse("RTSP/3.0"), Some(Version::Unknown));
        assert_eq!(Version::parse("HTTP/1.0"), Some(Version::Http1_0));
        assert_eq!(Version::parse("SIP/2.0"), None);
        assert_eq!(Version::V2_0.major(), 2);
        assert!(Version::Http1_1.is_http());
    }
}
