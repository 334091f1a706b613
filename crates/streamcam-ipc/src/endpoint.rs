//! RTMP server URI parsing.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::error::EndpointError;

/// Port used when the URI does not name one.
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// A publish target parsed from `rtmp://host[:port]/app/streamKey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtmpEndpoint {
    /// Server host name or address.
    pub host: String,

    /// Server TCP port.
    pub port: u16,

    /// RTMP application name.
    pub app: String,

    /// Stream key (play path) to publish under.
    pub stream_key: String,
}

impl RtmpEndpoint {
    /// Parse a server URI.
    ///
    /// A missing scheme is treated as `rtmp://`. The path must consist of
    /// exactly two segments; any query string is kept as part of the stream
    /// key since servers commonly carry credentials there.
    pub fn parse(uri: &str) -> Result<Self, EndpointError> {
        let uri = uri.trim();
        let parsed = if uri.contains("://") {
            Url::parse(uri)
        } else {
            Url::parse(&format!("rtmp://{uri}"))
        }
        .map_err(|e| EndpointError::Malformed(e.to_string()))?;

        if parsed.scheme() != "rtmp" {
            return Err(EndpointError::UnsupportedScheme(parsed.scheme().to_string()));
        }

        let host = match parsed.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(EndpointError::MissingHost),
        };

        let path = parsed.path().trim_start_matches('/');
        let mut segments = path.split('/');
        let (app, key) = match (segments.next(), segments.next(), segments.next()) {
            (Some(app), Some(key), None) if !app.is_empty() && !key.is_empty() => (app, key),
            _ => return Err(EndpointError::InvalidPath(path.to_string())),
        };

        let stream_key = match parsed.query() {
            Some(query) if !query.is_empty() => format!("{key}?{query}"),
            _ => key.to_string(),
        };

        Ok(Self {
            host,
            port: parsed.port().unwrap_or(DEFAULT_RTMP_PORT),
            app: app.to_string(),
            stream_key,
        })
    }

    /// The `tcUrl` a client announces in its connect command.
    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

impl fmt::Display for RtmpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}/{}", self.host, self.port, self.app, self.stream_key)
    }
}
