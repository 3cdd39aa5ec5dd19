// HTTP transport for the XS1 control endpoint.
//
// Every call is a GET against `<base>/control` carrying a fixed JSONP
// callback. The gateway answers `x(<json>)`; the wrapper is stripped here so
// callers only ever see the JSON tree. No device semantics live in this file.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, ParseError};

/// Callback name sent with every request. The gateway echoes it as the
/// envelope identifier.
pub const CALLBACK: &str = "x";

const USER_AGENT: &str = concat!("xs1-to-mqtt/", env!("CARGO_PKG_VERSION"));

/// Stateless request/response channel to one gateway.
#[derive(Debug, Clone)]
pub struct Transport {
    http: reqwest::Client,
    /// Used for the event subscription. Only the connect phase is bounded,
    /// the body streams for as long as the gateway keeps it open.
    streaming: reqwest::Client,
    control_url: Url,
    timeout: Duration,
}

impl Transport {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, Error> {
        let control_url = control_url(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(Error::ClientSetup)?;
        let streaming = reqwest::Client::builder()
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(Error::ClientSetup)?;

        Ok(Self {
            http,
            streaming,
            control_url,
            timeout,
        })
    }

    /// Build `<base>/control?callback=x&cmd=<command>&<params>`.
    pub fn request_url(&self, command: &str, params: &[(&str, String)]) -> Url {
        let mut url = self.control_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("callback", CALLBACK)
                .append_pair("cmd", command);
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    /// Issue one command and return the unwrapped JSON payload.
    pub async fn send(&self, command: &str, params: &[(&str, String)]) -> Result<Value, Error> {
        let url = self.request_url(command, params);
        debug!("GET {}", url);

        let resp = self.http.get(url).send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = resp.text().await.map_err(|e| self.classify(e))?;
        trace!(command, bytes = body.len(), "response received");

        Ok(unwrap_jsonp(&body)?)
    }

    /// Open a long-lived streaming response for the event subscription.
    pub async fn open_stream(
        &self,
        command: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::Response, Error> {
        let url = self.request_url(command, params);
        debug!("GET {} (stream)", url);

        let resp = self
            .streaming
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
            });
        }
        Ok(resp)
    }

    pub(crate) fn classify(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                timeout: self.timeout,
            }
        } else {
            Error::NetworkUnreachable(err)
        }
    }
}

fn control_url(base: &Url) -> Result<Url, Error> {
    if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
        return Err(Error::InvalidUrl(format!("{base} is not an http(s) URL with a host")));
    }

    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|()| Error::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .push("control");
    Ok(url)
}

/// Strip a `<callback>(<json>)` envelope and parse what is inside.
///
/// Surrounding whitespace and a single trailing `;` are tolerated. Anything
/// else outside the parentheses is a malformed envelope.
pub fn unwrap_jsonp(body: &str) -> Result<Value, ParseError> {
    let trimmed = body.trim();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();

    let open = trimmed.find('(').ok_or(ParseError::MalformedEnvelope)?;
    let (callback, rest) = trimmed.split_at(open);
    let is_identifier = !callback.is_empty()
        && callback
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.'));
    if !is_identifier {
        return Err(ParseError::MalformedEnvelope);
    }

    let inner = rest[1..]
        .strip_suffix(')')
        .ok_or(ParseError::MalformedEnvelope)?;
    serde_json::from_str(inner).map_err(ParseError::InvalidPayload)
}
