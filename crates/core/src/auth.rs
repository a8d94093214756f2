//! Access control for RTSP requests.
//!
//! A [`Client`](crate::client::Client) consults the configured [`Auth`] at
//! fixed points of request handling. A failing check carries the response
//! to send (for example 401 with a challenge); the client sends it as-is
//! and unwinds without sending anything else.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::client::RequestContext;
use crate::protocol::{Method, RtspResponse, StatusCode};

/// The point in request handling an [`Auth`] is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCheck {
    /// Every request, before dispatch.
    Url,
    /// Whether the client may see the factory matching the path.
    MediaFactoryAccess,
    /// Whether the client may have the factory construct media.
    MediaFactoryConstruct,
    /// Whether the client may choose its own multicast destination.
    TransportClientSettings,
}

pub trait Auth: Send + Sync {
    /// `Err` carries the response to send to the client.
    fn check(&self, ctx: &RequestContext, check: AuthCheck) -> Result<(), RtspResponse>;
}

/// HTTP Basic authentication (RFC 7617) against a fixed user table.
pub struct BasicAuth {
    realm: String,
    users: HashMap<String, String>,
}

impl BasicAuth {
    pub fn new(realm: &str) -> Self {
        BasicAuth {
            realm: realm.to_string(),
            users: HashMap::new(),
        }
    }

    pub fn add_user(mut self, user: &str, password: &str) -> Self {
        self.users.insert(user.to_string(), password.to_string());
        self
    }

    fn authenticated(&self, ctx: &RequestContext) -> bool {
        let Some(value) = ctx.request.get_header("Authorization") else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        match credentials.split_once(':') {
            Some((user, pass)) => self.users.get(user).is_some_and(|p| p == pass),
            None => false,
        }
    }

    fn challenge(&self, ctx: &RequestContext) -> RtspResponse {
        RtspResponse::for_request(StatusCode::UNAUTHORIZED, &ctx.request)
            .add_header("WWW-Authenticate", &format!("Basic realm=\"{}\"", self.realm))
    }
}

impl Auth for BasicAuth {
    fn check(&self, ctx: &RequestContext, check: AuthCheck) -> Result<(), RtspResponse> {
        if check == AuthCheck::Url && ctx.method == Method::Options {
            return Ok(());
        }
        if self.authenticated(ctx) {
            return Ok(());
        }
        tracing::debug!(?check, method = %ctx.method, "authentication required");
        Err(self.challenge(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RtspRequest;

    fn ctx(auth: Option<&str>) -> RequestContext {
        let mut req = RtspRequest::new(Method::Describe, "rtsp://h/test").add_header("CSeq", "2");
        if let Some(a) = auth {
            req = req.add_header("Authorization", a);
        }
        RequestContext::new(req)
    }

    #[test]
    fn basic_credentials() {
        let auth = BasicAuth::new("cams").add_user("admin", "secret");
        // admin:secret
        assert!(auth.check(&ctx(Some("Basic YWRtaW46c2VjcmV0")), AuthCheck::Url).is_ok());

        let resp = auth.check(&ctx(None), AuthCheck::Url).unwrap_err();
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
        assert_eq!(resp.get_header("WWW-Authenticate"), Some("Basic realm=\"cams\""));
        assert_eq!(resp.get_header("CSeq"), Some("2"));

        // admin:wrong
        assert!(auth.check(&ctx(Some("Basic YWRtaW46d3Jvbmc=")), AuthCheck::Url).is_err());
    }

    #[test]
    fn options_needs_no_credentials() {
        let auth = BasicAuth::new("cams");
        let req = RtspRequest::new(Method::Options, "*");
        assert!(auth.check(&RequestContext::new(req), AuthCheck::Url).is_ok());
    }
}
