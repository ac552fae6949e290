//! Property bags backing the request and façade host objects.
//!
//! Script-visible objects do not reflect arbitrary Rust state. Each one is a
//! fixed set of recognized keys; the prelude defines getters for exactly the
//! keys a bag reports and everything else (helper methods, caches) lives on
//! the JS side.

use crate::request::RequestHead;
use boa_engine::JsValue;
use std::net::SocketAddr;
use vesper_metrics::HandlerStyle;

use super::conversions::js_str;

/// Lookup over a closed set of keys.
pub(crate) trait PropertyBag {
    fn keys(&self) -> Vec<&'static str>;

    fn has(&self, name: &str) -> bool {
        self.keys().contains(&name)
    }

    /// Value of `name`, or `None` when the key is not part of the bag.
    fn get(&self, name: &str) -> Option<JsValue>;
}

/// Keys readable on the middleware `req` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKey {
    Ip,
    Method,
    Path,
    Protocol,
    Secure,
    Url,
    Query,
    Hostname,
    Href,
}

impl RequestKey {
    pub(crate) const ALL: [RequestKey; 9] = [
        RequestKey::Ip,
        RequestKey::Method,
        RequestKey::Path,
        RequestKey::Protocol,
        RequestKey::Secure,
        RequestKey::Url,
        RequestKey::Query,
        RequestKey::Hostname,
        RequestKey::Href,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            RequestKey::Ip => "ip",
            RequestKey::Method => "method",
            RequestKey::Path => "path",
            RequestKey::Protocol => "protocol",
            RequestKey::Secure => "secure",
            RequestKey::Url => "url",
            RequestKey::Query => "query",
            RequestKey::Hostname => "hostname",
            RequestKey::Href => "href",
        }
    }

    pub(crate) fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name() == name)
    }
}

/// Borrowed view of a bound request.
pub(crate) struct RequestProps<'a> {
    pub head: &'a RequestHead,
    pub remote: Option<SocketAddr>,
    pub secure: bool,
}

impl RequestProps<'_> {
    fn protocol(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }

    fn hostname(&self) -> String {
        let host = self
            .head
            .header("host")
            .or_else(|| self.head.uri.host())
            .unwrap_or("localhost");
        // Strip the port, keeping bracketed IPv6 literals intact.
        match host.rfind(':') {
            Some(i) if !host[i..].contains(']') => host[..i].to_string(),
            _ => host.to_string(),
        }
    }

    fn href(&self) -> String {
        if self.head.uri.scheme().is_some() {
            return self.head.uri.to_string();
        }
        let authority = self
            .head
            .header("host")
            .or_else(|| self.head.uri.authority().map(|a| a.as_str()))
            .unwrap_or("localhost");
        let path = self
            .head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}://{}{}", self.protocol(), authority, path)
    }

    /// The value of one recognized key.
    pub(crate) fn value(&self, key: RequestKey) -> JsValue {
        match key {
            RequestKey::Ip => match self.remote {
                Some(addr) => js_str(&addr.ip().to_string()),
                None => JsValue::undefined(),
            },
            RequestKey::Method => js_str(self.head.method.as_str()),
            RequestKey::Path => js_str(self.head.path()),
            RequestKey::Protocol => js_str(self.protocol()),
            RequestKey::Secure => JsValue::new(self.secure),
            RequestKey::Url => js_str(
                self.head
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/"),
            ),
            RequestKey::Query => js_str(self.head.query()),
            RequestKey::Hostname => js_str(&self.hostname()),
            RequestKey::Href => js_str(&self.href()),
        }
    }
}

impl PropertyBag for RequestProps<'_> {
    fn keys(&self) -> Vec<&'static str> {
        RequestKey::ALL.iter().map(|key| key.name()).collect()
    }

    fn get(&self, name: &str) -> Option<JsValue> {
        RequestKey::parse(name).map(|key| self.value(key))
    }
}

/// Top level keys of the two façade shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FacadeKey {
    Req,
    Res,
    Next,
    Request,
    RespondWith,
    WaitUntil,
    Fetch,
    Kv,
}

impl FacadeKey {
    pub(crate) fn name(self) -> &'static str {
        match self {
            FacadeKey::Req => "req",
            FacadeKey::Res => "res",
            FacadeKey::Next => "next",
            FacadeKey::Request => "request",
            FacadeKey::RespondWith => "respondWith",
            FacadeKey::WaitUntil => "waitUntil",
            FacadeKey::Fetch => "fetch",
            FacadeKey::Kv => "kv",
        }
    }

    fn for_style(style: HandlerStyle) -> &'static [FacadeKey] {
        match style {
            HandlerStyle::Middleware => &[
                FacadeKey::Req,
                FacadeKey::Res,
                FacadeKey::Next,
                FacadeKey::Fetch,
                FacadeKey::Kv,
            ],
            HandlerStyle::Event => &[
                FacadeKey::Request,
                FacadeKey::RespondWith,
                FacadeKey::WaitUntil,
                FacadeKey::Fetch,
                FacadeKey::Kv,
            ],
        }
    }
}

/// Which capabilities a bound façade exposes.
pub(crate) struct FacadeProps {
    pub style: HandlerStyle,
    pub fetch_enabled: bool,
}

impl PropertyBag for FacadeProps {
    fn keys(&self) -> Vec<&'static str> {
        FacadeKey::for_style(self.style)
            .iter()
            .filter(|key| self.fetch_enabled || **key != FacadeKey::Fetch)
            .map(|key| key.name())
            .collect()
    }

    /// Façade values are built by the prelude; the bag only answers presence.
    fn get(&self, name: &str) -> Option<JsValue> {
        self.has(name).then(|| JsValue::new(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};

    fn head(uri: &str) -> RequestHead {
        let mut head = RequestHead::new(Method::GET, uri.parse::<Uri>().unwrap());
        head.headers
            .insert("host", "example.test:8080".parse().unwrap());
        head
    }

    #[test]
    fn test_request_key_names_round_trip() {
        for key in RequestKey::ALL {
            assert_eq!(RequestKey::parse(key.name()), Some(key));
        }
        assert_eq!(RequestKey::parse("cookies"), None);
    }

    #[test]
    fn test_request_props_values() {
        let head = head("/items?id=7");
        let props = RequestProps {
            head: &head,
            remote: Some("10.0.0.1:5000".parse().unwrap()),
            secure: false,
        };

        let string = |key: &str| {
            props
                .get(key)
                .and_then(|v| v.as_string().map(|s| s.to_std_string_escaped()))
        };
        assert_eq!(string("ip").as_deref(), Some("10.0.0.1"));
        assert_eq!(string("method").as_deref(), Some("GET"));
        assert_eq!(string("path").as_deref(), Some("/items"));
        assert_eq!(string("query").as_deref(), Some("id=7"));
        assert_eq!(string("url").as_deref(), Some("/items?id=7"));
        assert_eq!(string("protocol").as_deref(), Some("http"));
        assert_eq!(string("hostname").as_deref(), Some("example.test"));
        assert_eq!(
            string("href").as_deref(),
            Some("http://example.test:8080/items?id=7")
        );
        assert!(props.get("body").is_none());
    }

    #[test]
    fn test_fetch_key_depends_on_options() {
        let without = FacadeProps {
            style: HandlerStyle::Middleware,
            fetch_enabled: false,
        };
        assert!(without.has("req"));
        assert!(!without.has("fetch"));
        assert!(!without.has("respondWith"));

        let with = FacadeProps {
            style: HandlerStyle::Event,
            fetch_enabled: true,
        };
        assert!(with.has("fetch"));
        assert!(with.has("respondWith"));
        assert!(!with.has("next"));
    }
}
