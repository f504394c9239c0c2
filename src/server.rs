//! HTTP endpoints: health echo, event publication and relay fetches, plus
//! the passthrough routes of trusted modules.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri, Version},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::{
    filter::Filter,
    passthrough::{register_module_routes, Forwarder},
    relay::{Fetched, PublishError, RelayClient},
    routes::{JsonBody, RouteError, RouteMethod, RouteRegistry},
    trust::TrustRegistry,
    validation::{accepts, parse_event, unix_now, Rejection, Validator},
};

/// Shared state of the local handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<dyn RelayClient>,
    pub validator: Arc<Validator>,
}

/// Register the gateway's own endpoints.
pub fn local_routes(registry: &mut RouteRegistry<AppState>) {
    registry
        .register("/health", RouteMethod::Get, health)
        .register("/nostr/publish", RouteMethod::Post, publish)
        .register("/nostr/fetch", RouteMethod::Post, fetch);
}

/// Every route the gateway would serve, local and passthrough.
pub fn route_registry(trust: &TrustRegistry, forwarder: &Arc<Forwarder>) -> RouteRegistry<AppState> {
    let mut registry = RouteRegistry::new();
    local_routes(&mut registry);
    register_module_routes(&mut registry, trust, forwarder);
    registry
}

/// Build the complete application. Route table errors are returned before
/// anything listens.
pub fn build_app(
    state: AppState,
    trust: &TrustRegistry,
    forwarder: &Arc<Forwarder>,
) -> Result<Router, RouteError> {
    let router = route_registry(trust, forwarder).build()?;
    Ok(router
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Serve `app` on `addr` until `shutdown` resolves.
pub async fn serve_http(
    addr: SocketAddr,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Echo the request back, for connectivity checks.
async fn health(
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    JsonBody(body): JsonBody,
) -> Json<Value> {
    let (major, minor) = match version {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_2 => (2, 0),
        Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    };
    let query: Map<String, Value> = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect()
        })
        .unwrap_or_default();
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let (host_name, port) = match host.rsplit_once(':') {
        Some((name, port)) if port.parse::<u16>().is_ok() => (name, port.parse::<u16>().ok()),
        _ => (host, None),
    };
    let mut header_map = Map::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        header_map.insert(name.as_str().to_string(), Value::String(joined));
    }
    Json(json!({
        "status": "OK",
        "request": {
            "method": method.as_str(),
            "url": {"path": uri.path(), "query": query},
            "protocol": uri.scheme_str().unwrap_or("http"),
            "http": {"major": major, "minor": minor},
            "host": {"name": host_name, "port": port},
            "headers": header_map,
            "body": body,
        }
    }))
}

/// Validate a signed event and publish it to the relays.
async fn publish(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(body): JsonBody,
) -> Response {
    let event = match parse_event(body.as_ref()) {
        Ok(event) => event,
        Err(rejection) => {
            debug!("unparsable publish body");
            return rejection.into_response();
        }
    };
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    if !accepts(accept) {
        debug!(accept, "unacceptable Accept header");
        return Rejection::NotAcceptable.into_response();
    }
    if let Err(rejection) = state.validator.validate(&event, unix_now()) {
        info!(id = %event.id, %rejection, "event rejected");
        return rejection.into_response();
    }
    match state.relay.publish(&event).await {
        Ok(()) => match event.nevent() {
            Ok(nevent) => (
                StatusCode::ACCEPTED,
                [(header::LOCATION, format!("nostr:{nevent}"))],
            )
                .into_response(),
            Err(e) => {
                error!(id = %event.id, error = %e, "encoding event reference");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(PublishError::NoRelays) => {
            info!(id = %event.id, "no relay accepted event");
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(e) => {
            error!(id = %event.id, error = %e, "publish failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Query the relays with a caller supplied filter.
async fn fetch(State(state): State<AppState>, JsonBody(body): JsonBody) -> Response {
    let Some(body @ Value::Object(_)) = body else {
        debug!("unparsable fetch body");
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    };
    let mut filter = match Filter::from_value(&body) {
        Ok(filter) => filter,
        Err(e) => {
            debug!(error = %e, "invalid filter");
            return StatusCode::UNPROCESSABLE_ENTITY.into_response();
        }
    };
    filter.clamp_limit();

    match state.relay.fetch(&filter).await {
        Ok(Fetched::Events(events)) => (StatusCode::OK, Json(events)).into_response(),
        Ok(Fetched::Notice(reason)) => {
            debug!(%reason, "relay notice during fetch");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "ERROR", "reason": reason})),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "fetch failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
