use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::Full;
use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;
use crate::util::{lock_unpoisoned, truncate_body};

type DecodeSink = Box<dyn FnOnce(&Bytes) -> Result<()> + Send>;

/// Description of one HTTP call, decoupled from the act of sending it.
///
/// An `Item` is produced by the caller's generator after rate-limit admission
/// and is built once per logical call; the executor rebuilds the outbound
/// request from it on every retry attempt. An empty method defaults to GET.
pub struct Item {
    path: String,
    method: String,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
    result: Option<DecodeSink>,
    header_target: Option<Weak<Mutex<HeaderMap>>>,
    authenticated: bool,
    verbose: bool,
    http_debugging: bool,
}

impl Item {
    /// Starts a descriptor for `path`, which must be an absolute URL.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: String::new(),
            headers: HashMap::new(),
            body: None,
            result: None,
            header_target: None,
            authenticated: false,
            verbose: false,
            http_debugging: false,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Decodes the terminal response body as JSON into the value behind
    /// `target`.
    ///
    /// The target is written only on a fully successful decode; a malformed
    /// body surfaces [`Error::Decode`] and leaves it untouched.
    pub fn decode_into<T>(mut self, target: &Arc<Mutex<T>>) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        let target = Arc::downgrade(target);
        self.result = Some(Box::new(move |body: &Bytes| {
            let Some(cell) = target.upgrade() else {
                return Ok(());
            };
            let decoded = serde_json::from_slice(body).map_err(|source| Error::Decode {
                source,
                body: truncate_body(body),
            })?;
            *lock_unpoisoned(&cell) = decoded;
            Ok(())
        }));
        self
    }

    /// Copies the terminal response headers into the map behind `target`.
    ///
    /// The caller keeps ownership of the storage; it must stay allocated for
    /// the duration of the call or validation fails with
    /// [`Error::HeaderTargetGone`].
    pub fn header_target(mut self, target: Weak<Mutex<HeaderMap>>) -> Self {
        self.header_target = Some(target);
        self
    }

    /// Marks the call as carrying authentication material.
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    pub fn http_debugging(mut self) -> Self {
        self.http_debugging = true;
        self
    }

    pub(crate) fn prepare(self, user_agent: &str) -> Result<PreparedRequest> {
        if self.path.is_empty() {
            return Err(Error::InvalidPath { path: self.path });
        }
        let uri: Uri = self.path.parse().map_err(|_| Error::InvalidPath {
            path: self.path.clone(),
        })?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(Error::InvalidPath { path: self.path });
        }

        let trimmed_method = self.method.trim();
        let method = if trimmed_method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(trimmed_method.as_bytes()).map_err(|_| Error::InvalidMethod {
                method: self.method.clone(),
            })?
        };

        let mut headers = HeaderMap::with_capacity(self.headers.len() + 1);
        for (name, value) in &self.headers {
            headers.insert(parse_header_name(name)?, parse_header_value(name, value)?);
        }
        if !user_agent.is_empty() && !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, parse_header_value("user-agent", user_agent)?);
        }

        if let Some(target) = &self.header_target
            && target.upgrade().is_none()
        {
            return Err(Error::HeaderTargetGone);
        }

        Ok(PreparedRequest {
            method,
            uri,
            headers,
            body: self.body.unwrap_or_default(),
            result: self.result,
            header_target: self.header_target,
            authenticated: self.authenticated,
            verbose: self.verbose,
            http_debugging: self.http_debugging,
        })
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Item")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body_bytes", &self.body.as_ref().map_or(0, Bytes::len))
            .field("decodes_result", &self.result.is_some())
            .field("passes_back_headers", &self.header_target.is_some())
            .field("authenticated", &self.authenticated)
            .field("verbose", &self.verbose)
            .field("http_debugging", &self.http_debugging)
            .finish()
    }
}

/// A validated descriptor, ready to be replayed across retry attempts.
pub(crate) struct PreparedRequest {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) result: Option<DecodeSink>,
    pub(crate) header_target: Option<Weak<Mutex<HeaderMap>>>,
    pub(crate) authenticated: bool,
    pub(crate) verbose: bool,
    pub(crate) http_debugging: bool,
}

impl fmt::Debug for PreparedRequest {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PreparedRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .field("body_bytes", &self.body.len())
            .field("decodes_result", &self.result.is_some())
            .field("passes_back_headers", &self.header_target.is_some())
            .field("authenticated", &self.authenticated)
            .field("verbose", &self.verbose)
            .field("http_debugging", &self.http_debugging)
            .finish()
    }
}

impl PreparedRequest {
    pub(crate) fn to_http_request(&self) -> Result<Request<Full<Bytes>>> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(Full::new(self.body.clone()))
            .map_err(|source| Error::RequestBuild { source })?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}
