//! Transparent forwarding of HTTP requests to trusted modules.

use std::{sync::Arc, time::Duration};

use axum::{
    body::{Body, HttpBody},
    extract::Request,
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, info};

use crate::{routes::RouteRegistry, trust::TrustRegistry};

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("downstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("building response: {0}")]
    Response(#[from] axum::http::Error),
}

/// Streams requests to `base_url + path?query` and the downstream response
/// back to the caller.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Forward `req` to the module at `base_url`. Transport failures become
    /// a bare 500; nothing is retried.
    pub async fn forward(&self, base_url: &str, req: Request) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.try_forward(base_url, req).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(%method, %path, base_url, error = %e, "passthrough failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    async fn try_forward(&self, base_url: &str, req: Request) -> Result<Response, ForwardError> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{base_url}{path_and_query}");
        debug!(method = %parts.method, %target, "forwarding");

        let mut headers = parts.headers;
        headers.remove(header::HOST);
        strip_hop_by_hop(&mut headers);

        let body = if body.size_hint().exact() == Some(0) {
            reqwest::Body::from(Vec::new())
        } else {
            reqwest::Body::wrap_stream(body.into_data_stream())
        };
        let downstream = self
            .client
            .request(parts.method, target)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let mut builder = Response::builder().status(downstream.status());
        if let Some(out) = builder.headers_mut() {
            out.extend(downstream.headers().clone());
            strip_hop_by_hop(out);
        }
        Ok(builder.body(Body::from_stream(downstream.bytes_stream()))?)
    }
}

/// Connection-level headers that must not cross a proxy.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    const HOP_BY_HOP: [HeaderName; 4] = [
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::TE,
        header::UPGRADE,
    ];
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Register every route declared by passthrough modules. Bodies are
/// streamed, so these routes skip the JSON step.
pub fn register_module_routes<S>(
    registry: &mut RouteRegistry<S>,
    trust: &TrustRegistry,
    forwarder: &Arc<Forwarder>,
) where
    S: Clone + Send + Sync + 'static,
{
    for module in trust.modules() {
        let Some(base_url) = module.base_url.as_deref() else {
            continue;
        };
        for (path, methods) in &module.route_methods {
            for method in methods {
                let forwarder = Arc::clone(forwarder);
                let base_url = base_url.to_string();
                registry.register_streaming(path, *method, move |req: Request| async move {
                    forwarder.forward(&base_url, req).await
                });
            }
        }
        info!(module = %module.name, routes = module.route_methods.len(), "passthrough module");
    }
}
