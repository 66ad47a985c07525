use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tower_service::Service;

use crate::Result;
use crate::error::{BoxError, Error};
use crate::util::lock_unpoisoned;

type DirectClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;
type ProxiedClient = Client<HttpsConnector<ProxyConnector>, Full<Bytes>>;

#[derive(Clone)]
enum TransportClient {
    Direct(DirectClient),
    Proxied(ProxiedClient),
}

impl TransportClient {
    async fn request(
        &self,
        request: Request<Full<Bytes>>,
    ) -> std::result::Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        match self {
            Self::Direct(client) => client.request(request).await,
            Self::Proxied(client) => client.request(request).await,
        }
    }
}

pub(crate) enum TransportCallError {
    Transport(hyper_util::client::legacy::Error),
    Timeout,
}

/// Pooled hyper client with a runtime-swappable proxy configuration.
///
/// `set_proxy` builds a fresh client routed through a CONNECT tunnel and
/// swaps it in atomically; a failed build leaves the previous client
/// untouched.
pub(crate) struct Transport {
    client: Mutex<TransportClient>,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
}

impl Transport {
    pub(crate) fn new(
        connect_timeout: Duration,
        pool_idle_timeout: Duration,
        pool_max_idle_per_host: usize,
    ) -> Result<Self> {
        let client = build_direct_client(connect_timeout, pool_idle_timeout, pool_max_idle_per_host)?;
        Ok(Self {
            client: Mutex::new(client),
            connect_timeout,
            pool_idle_timeout,
            pool_max_idle_per_host,
        })
    }

    pub(crate) fn set_proxy(&self, proxy: Uri) -> Result<()> {
        let rebuilt = build_proxied_client(
            proxy,
            self.connect_timeout,
            self.pool_idle_timeout,
            self.pool_max_idle_per_host,
        )?;
        *lock_unpoisoned(&self.client) = rebuilt;
        Ok(())
    }

    pub(crate) async fn execute(
        &self,
        request: Request<Full<Bytes>>,
        attempt_timeout: Duration,
    ) -> std::result::Result<Response<Incoming>, TransportCallError> {
        let client = lock_unpoisoned(&self.client).clone();
        match timeout(attempt_timeout, client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(TransportCallError::Transport(source)),
            Err(_) => Err(TransportCallError::Timeout),
        }
    }
}

fn base_connector(connect_timeout: Duration) -> HttpConnector {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    connector.set_connect_timeout(Some(connect_timeout));
    connector
}

fn build_direct_client(
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
) -> Result<TransportClient> {
    let https = https_layer()?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(base_connector(connect_timeout));
    Ok(TransportClient::Direct(
        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build(https),
    ))
}

fn build_proxied_client(
    proxy: Uri,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
) -> Result<TransportClient> {
    let connector = ProxyConnector {
        tunnel: Tunnel::new(proxy, base_connector(connect_timeout)),
    };
    let https = https_layer()?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(connector);
    Ok(TransportClient::Proxied(
        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build(https),
    ))
}

fn https_layer() -> Result<HttpsConnectorBuilder<hyper_rustls::builderstates::WantsSchemes>> {
    HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|source| Error::TlsInit {
            message: source.to_string(),
        })
}

/// Routes every connection through a CONNECT tunnel at the configured proxy.
#[derive(Clone)]
struct ProxyConnector {
    tunnel: Tunnel<HttpConnector>,
}

impl Service<Uri> for ProxyConnector {
    type Response = <HttpConnector as Service<Uri>>::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        match self.tunnel.poll_ready(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connecting = self.tunnel.call(normalize_tunnel_target(dst));
        Box::pin(async move {
            connecting
                .await
                .map_err(|error| Box::new(error) as BoxError)
        })
    }
}

/// CONNECT targets need an explicit port; fill in the scheme default.
fn normalize_tunnel_target(dst: Uri) -> Uri {
    if dst.port().is_some() {
        return dst;
    }

    let Some(scheme) = dst.scheme_str() else {
        return dst;
    };
    let default_port = if scheme.eq_ignore_ascii_case("https") {
        443
    } else if scheme.eq_ignore_ascii_case("http") {
        80
    } else {
        return dst;
    };
    let Some(host) = dst.host() else {
        return dst;
    };
    let authority_text = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{default_port}")
    } else {
        format!("{host}:{default_port}")
    };

    let Ok(authority) = authority_text.parse() else {
        return dst;
    };
    let original = dst.clone();
    let mut parts = dst.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}

#[cfg(test)]
mod tests {
    use super::normalize_tunnel_target;

    #[test]
    fn normalize_tunnel_target_sets_default_ports() {
        let https: http::Uri = "https://api.example.com/v1/ticker"
            .parse()
            .expect("uri should parse");
        assert_eq!(
            normalize_tunnel_target(https).to_string(),
            "https://api.example.com:443/v1/ticker"
        );

        let http: http::Uri = "http://api.example.com/v1/ticker"
            .parse()
            .expect("uri should parse");
        assert_eq!(
            normalize_tunnel_target(http).to_string(),
            "http://api.example.com:80/v1/ticker"
        );
    }

    #[test]
    fn normalize_tunnel_target_keeps_explicit_port() {
        let uri: http::Uri = "https://api.example.com:9443/v1/ticker"
            .parse()
            .expect("uri should parse");
        assert_eq!(
            normalize_tunnel_target(uri).to_string(),
            "https://api.example.com:9443/v1/ticker"
        );
    }
}
