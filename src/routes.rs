//! Route registry: explicit (path, method) registrations checked for
//! completeness and uniqueness before the router is built.

use std::{
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
    fmt,
    str::FromStr,
};

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Request},
    handler::Handler,
    http::{header, request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{on, MethodFilter, MethodRouter},
    Router,
};
use serde_json::Value;
use tracing::{debug, warn};

/// Largest request body the JSON step will buffer.
const JSON_BODY_LIMIT: usize = 1024 * 1024;

/// HTTP methods a route may be registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl RouteMethod {
    pub const ALL: [RouteMethod; 5] = [
        RouteMethod::Get,
        RouteMethod::Post,
        RouteMethod::Put,
        RouteMethod::Patch,
        RouteMethod::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RouteMethod::Get => "GET",
            RouteMethod::Post => "POST",
            RouteMethod::Put => "PUT",
            RouteMethod::Patch => "PATCH",
            RouteMethod::Delete => "DELETE",
        }
    }

    fn filter(self) -> MethodFilter {
        match self {
            RouteMethod::Get => MethodFilter::GET,
            RouteMethod::Post => MethodFilter::POST,
            RouteMethod::Put => MethodFilter::PUT,
            RouteMethod::Patch => MethodFilter::PATCH,
            RouteMethod::Delete => MethodFilter::DELETE,
        }
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RouteMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| s.to_string())
    }
}

/// Fatal route table errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RouteError {
    #[error("no routes registered")]
    Empty,
    #[error("duplicate routes: {}", .0.join(", "))]
    Duplicate(Vec<String>),
    #[error("route path `{0}` must start with `/`")]
    InvalidPath(String),
}

/// Request body as parsed by the JSON step; `None` when the body was empty
/// or not valid JSON.
#[derive(Debug, Clone, Default)]
pub struct JsonBody(pub Option<Value>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for JsonBody {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<JsonBody>().cloned().unwrap_or_default())
    }
}

/// One registered handler.
pub struct RouteEntry<S> {
    pub path: String,
    pub method: RouteMethod,
    handler: MethodRouter<S>,
}

/// Collects registrations and turns them into an axum [`Router`].
pub struct RouteRegistry<S> {
    entries: Vec<RouteEntry<S>>,
}

impl<S> Default for RouteRegistry<S> {
    fn default() -> Self {
        Self { entries: vec![] }
    }
}

impl<S: Clone + Send + Sync + 'static> RouteRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` with a JSON-body-parsing step in front of it.
    pub fn register<H, T>(&mut self, path: &str, method: RouteMethod, handler: H) -> &mut Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        let router = on(method.filter(), handler).route_layer(middleware::from_fn(parse_json_body));
        self.push(path, method, router)
    }

    /// Register `handler` without touching the request body.
    pub fn register_streaming<H, T>(
        &mut self,
        path: &str,
        method: RouteMethod,
        handler: H,
    ) -> &mut Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        self.push(path, method, on(method.filter(), handler))
    }

    fn push(&mut self, path: &str, method: RouteMethod, handler: MethodRouter<S>) -> &mut Self {
        self.entries.push(RouteEntry {
            path: path.to_string(),
            method,
            handler,
        });
        self
    }

    /// Registered methods per path.
    pub fn allowed_methods(&self) -> BTreeMap<String, BTreeSet<RouteMethod>> {
        let mut allowed: BTreeMap<String, BTreeSet<RouteMethod>> = BTreeMap::new();
        for entry in &self.entries {
            allowed
                .entry(entry.path.clone())
                .or_default()
                .insert(entry.method);
        }
        allowed
    }

    /// Every (path, method) pair registered more than once.
    pub fn duplicates(&self) -> Vec<String> {
        let mut counter: BTreeMap<(&str, RouteMethod), usize> = BTreeMap::new();
        for entry in &self.entries {
            *counter.entry((entry.path.as_str(), entry.method)).or_default() += 1;
        }
        counter
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|((path, method), _)| format!("{method} {path}"))
            .collect()
    }

    /// Check that the table is non-empty, free of duplicates and made of
    /// absolute paths.
    pub fn validate(&self) -> Result<(), RouteError> {
        if self.entries.is_empty() {
            return Err(RouteError::Empty);
        }
        let duplicates = self.duplicates();
        if !duplicates.is_empty() {
            return Err(RouteError::Duplicate(duplicates));
        }
        if let Some(bad) = self.entries.iter().find(|e| !e.path.starts_with('/')) {
            return Err(RouteError::InvalidPath(bad.path.clone()));
        }
        Ok(())
    }

    /// Validate the registrations and build the router, adding a 405
    /// responder for every supported method a known path does not handle.
    pub fn build(self) -> Result<Router<S>, RouteError> {
        self.validate()?;
        let allowed = self.allowed_methods();
        let mut by_path: BTreeMap<String, Vec<MethodRouter<S>>> = BTreeMap::new();
        for entry in self.entries {
            debug!(method = %entry.method, path = %entry.path, "registered route");
            by_path.entry(entry.path).or_default().push(entry.handler);
        }

        let mut router = Router::new();
        for (path, handlers) in by_path {
            let registered = &allowed[&path];
            let mut method_router = handlers.into_iter().fold(MethodRouter::new(), MethodRouter::merge);
            let allow = allow_header(registered);
            for method in RouteMethod::ALL.into_iter().filter(|m| !registered.contains(m)) {
                let allow = allow.clone();
                method_router = method_router.merge(on(method.filter(), move || async move {
                    (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, allow)])
                }));
            }
            router = router.route(&path, method_router);
        }
        Ok(router)
    }
}

/// `Allow` header value: `OPTIONS` followed by the registered methods.
fn allow_header(methods: &BTreeSet<RouteMethod>) -> String {
    std::iter::once("OPTIONS")
        .chain(methods.iter().map(|m| m.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Buffer the request body, parse it as JSON and stash the result in the
/// request extensions for [`JsonBody`].
async fn parse_json_body(req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, JSON_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };
    let parsed = if bytes.is_empty() {
        None
    } else {
        serde_json::from_slice::<Value>(&bytes).ok()
    };
    parts.extensions.insert(JsonBody(parsed));
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{extract::Path, Json};
    use std::net::SocketAddr;

    /// Serve `app` on an ephemeral port.
    pub(crate) async fn serve_router(app: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        (addr, handle)
    }

    async fn ok() -> &'static str {
        "ok"
    }

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!("get".parse::<RouteMethod>().unwrap(), RouteMethod::Get);
        assert_eq!("PaTcH".parse::<RouteMethod>().unwrap(), RouteMethod::Patch);
        assert!("head".parse::<RouteMethod>().is_err());
    }

    #[test]
    fn empty_registry_is_fatal() {
        let reg: RouteRegistry<()> = RouteRegistry::new();
        assert_eq!(reg.build().err(), Some(RouteError::Empty));
    }

    #[test]
    fn duplicates_are_fatal_and_all_reported() {
        let mut reg: RouteRegistry<()> = RouteRegistry::new();
        reg.register("/card", RouteMethod::Get, ok)
            .register("/card", RouteMethod::Get, ok)
            .register("/card", RouteMethod::Post, ok)
            .register("/pay", RouteMethod::Delete, ok)
            .register("/pay", RouteMethod::Delete, ok);
        assert_eq!(
            reg.build().err(),
            Some(RouteError::Duplicate(vec![
                "GET /card".into(),
                "DELETE /pay".into()
            ]))
        );
    }

    #[test]
    fn relative_paths_rejected() {
        let mut reg: RouteRegistry<()> = RouteRegistry::new();
        reg.register("card", RouteMethod::Get, ok);
        assert_eq!(reg.build().err(), Some(RouteError::InvalidPath("card".into())));
    }

    #[test]
    fn allow_header_lists_options_first() {
        let set = BTreeSet::from([RouteMethod::Post, RouteMethod::Get]);
        assert_eq!(allow_header(&set), "OPTIONS, GET, POST");
    }

    #[tokio::test]
    async fn unregistered_method_gets_405_with_allow() {
        let mut reg: RouteRegistry<()> = RouteRegistry::new();
        reg.register("/card", RouteMethod::Post, ok);
        let (addr, handle) = serve_router(reg.build().unwrap()).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("http://{addr}/card")).send().await.unwrap();
        assert_eq!(resp.status(), 405);
        assert_eq!(resp.headers()[header::ALLOW], "OPTIONS, POST");

        let resp = client
            .delete(format!("http://{addr}/card"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 405);

        let resp = client.post(format!("http://{addr}/card")).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client.get(format!("http://{addr}/unknown")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        handle.abort();
    }

    #[tokio::test]
    async fn json_step_parses_body_and_params_work() {
        async fn echo(Path(id): Path<String>, JsonBody(body): JsonBody) -> Json<Value> {
            Json(serde_json::json!({"id": id, "body": body}))
        }
        let mut reg: RouteRegistry<()> = RouteRegistry::new();
        reg.register("/item/:id", RouteMethod::Put, echo);
        let (addr, handle) = serve_router(reg.build().unwrap()).await;
        let client = reqwest::Client::new();

        let resp: Value = client
            .put(format!("http://{addr}/item/7"))
            .body(r#"{"a":1}"#)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["id"], "7");
        assert_eq!(resp["body"]["a"], 1);

        let resp: Value = client
            .put(format!("http://{addr}/item/8"))
            .body("not json")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(resp["body"].is_null());
        handle.abort();
    }
}
