use crate::dlna::events::{leaf_elements, xml_escape};
use crate::dlna::types::ServiceEndpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Output arguments of one SOAP action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SoapResponse {
    values: HashMap<String, String>,
}

impl SoapResponse {
    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub sid: String,
    pub timeout: Duration,
}

/// One request/response exchange with a renderer. Each call is a single
/// attempt; callers decide what a failure means.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn send_command(
        &self,
        service: &ServiceEndpoint,
        action: &str,
        args: &[(&str, String)],
        extra_headers: &HashMap<String, String>,
    ) -> Result<SoapResponse, TransportError>;

    /// Creates a subscription, or renews `renew_sid` when given.
    async fn subscribe(
        &self,
        service: &ServiceEndpoint,
        callback_url: &str,
        renew_sid: Option<&str>,
        timeout: Duration,
    ) -> Result<Subscription, TransportError>;

    async fn unsubscribe(&self, service: &ServiceEndpoint, sid: &str) -> Result<(), TransportError>;
}

/// SOAP over HTTP with GENA subscriptions.
pub struct SoapTransport {
    http: reqwest::Client,
    base_url: url::Url,
}

impl SoapTransport {
    pub fn new(base_url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: url::Url::parse(base_url)?,
        })
    }

    /// Resolves a service path against the device base URL. Absolute URLs
    /// pass through unchanged.
    fn normalize_url(&self, path: &str) -> Result<url::Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::Malformed(format!("bad url {path}: {e}")))
    }
}

fn envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let mut body = String::new();
    for (name, value) in args {
        body.push_str(&format!("<{name}>{}</{name}>", xml_escape(value)));
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
<s:Body><u:{action} xmlns:u=\"{service_type}\">{body}</u:{action}></s:Body></s:Envelope>"
    )
}

fn map_err(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(e)
    }
}

fn method(name: &str) -> Result<http::Method, TransportError> {
    http::Method::from_bytes(name.as_bytes())
        .map_err(|e| TransportError::Malformed(format!("bad method {name}: {e}")))
}

/// `Second-1800` style header values.
fn parse_timeout_header(value: Option<&HeaderValue>, fallback: Duration) -> Duration {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Second-"))
        .and_then(|secs| secs.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

#[async_trait]
impl DeviceTransport for SoapTransport {
    async fn send_command(
        &self,
        service: &ServiceEndpoint,
        action: &str,
        args: &[(&str, String)],
        extra_headers: &HashMap<String, String>,
    ) -> Result<SoapResponse, TransportError> {
        let url = self.normalize_url(&service.control_url)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/xml; charset=\"utf-8\""),
        );
        let soap_action = format!("\"{}#{}\"", service.service_type, action);
        headers.insert(
            "SOAPACTION",
            HeaderValue::from_str(&soap_action)
                .map_err(|e| TransportError::Malformed(e.to_string()))?,
        );
        for (key, value) in extra_headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        debug!("{} {}", action, url);
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .body(envelope(&service.service_type, action, args))
            .send()
            .await
            .map_err(map_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let text = resp.text().await.map_err(map_err)?;
        if !text.contains(&format!("{action}Response")) {
            return Err(TransportError::Malformed(format!(
                "no {action}Response element"
            )));
        }
        Ok(SoapResponse {
            values: leaf_elements(&text),
        })
    }

    async fn subscribe(
        &self,
        service: &ServiceEndpoint,
        callback_url: &str,
        renew_sid: Option<&str>,
        timeout: Duration,
    ) -> Result<Subscription, TransportError> {
        let url = self.normalize_url(&service.event_sub_url)?;
        let mut req = self
            .http
            .request(method("SUBSCRIBE")?, url)
            .header("TIMEOUT", format!("Second-{}", timeout.as_secs()));
        req = match renew_sid {
            Some(sid) => req.header("SID", sid),
            None => req
                .header("CALLBACK", format!("<{callback_url}>"))
                .header("NT", "upnp:event"),
        };

        let resp = req.send().await.map_err(map_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let sid = resp
            .headers()
            .get("SID")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Malformed("SUBSCRIBE response without SID".into()))?;
        Ok(Subscription {
            sid,
            timeout: parse_timeout_header(resp.headers().get("TIMEOUT"), timeout),
        })
    }

    async fn unsubscribe(&self, service: &ServiceEndpoint, sid: &str) -> Result<(), TransportError> {
        let url = self.normalize_url(&service.event_sub_url)?;
        let resp = self
            .http
            .request(method("UNSUBSCRIBE")?, url)
            .header("SID", sid)
            .send()
            .await
            .map_err(map_err)?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}
