//! HTTPS front end.
//!
//! Every request goes through [`Router::dispatch`], which walks an ordered
//! route table: static assets first, then the token-gated feed, then 404.
//! Handlers only ever read the feed store.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::{header, Method, StatusCode};
use actix_web::middleware::{from_fn, Next};
use actix_web::web::{self, Bytes};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::atom::{self, ATOM_MIME_TYPE};
use crate::config::Settings;
use crate::feed::FeedStore;
use crate::security_headers::SECURITY_HEADERS;
use crate::static_files::{StaticFiles, StaticResource};

pub const FEED_PATH: &str = "/feed/atom.xml";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

const UNAUTHORISED: &str = "401 Unauthorized";
const PAGE_NOT_FOUND: &str = "404 Not Found";
const METHOD_NOT_ALLOWED: &str = "405 Method Not Allowed";
const TOO_MANY_REQUESTS: &str = "429 Too Many Requests";
const INTERNAL_ERROR: &str = "500 Internal Server Error";

/// Builds a response carrying the security headers.
fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = HttpResponse::build(status);
    response.insert_header((header::CONTENT_TYPE, content_type));
    for (name, value) in SECURITY_HEADERS.iter() {
        response.insert_header((*name, value.as_str()));
    }
    response.body(body.into())
}

fn respond_text(status: StatusCode, text: &'static str) -> HttpResponse {
    respond(status, "text/plain; charset=utf-8", text)
}

#[derive(Deserialize)]
struct FeedQuery {
    token: Option<String>,
}

pub enum Route {
    Static(StaticResource),
    Feed { path: String },
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        match self {
            Route::Static(resource) => resource.request_path == path,
            Route::Feed { path: feed_path } => feed_path == path,
        }
    }
}

pub struct Router {
    routes: Vec<Route>,
    token: String,
    store: Arc<FeedStore>,
}

impl Router {
    pub fn new(static_files: StaticFiles, token: &str, store: Arc<FeedStore>) -> Self {
        let mut routes: Vec<Route> = static_files
            .into_resources()
            .into_iter()
            .map(Route::Static)
            .collect();
        routes.push(Route::Feed {
            path: FEED_PATH.to_string(),
        });

        Self {
            routes,
            token: token.to_string(),
            store,
        }
    }

    pub async fn dispatch(&self, req: &HttpRequest) -> HttpResponse {
        let path = req.path();

        if req.method() != Method::GET {
            info!(status = 405, path, method = %req.method(), "serving: rejected");
            let mut response = respond_text(StatusCode::METHOD_NOT_ALLOWED, METHOD_NOT_ALLOWED);
            response
                .headers_mut()
                .insert(header::ALLOW, header::HeaderValue::from_static("GET"));
            return response;
        }

        match self.routes.iter().find(|route| route.matches(path)) {
            Some(Route::Static(resource)) => {
                info!(status = 200, path, "serving: static");
                respond(StatusCode::OK, resource.mime_type, resource.body.clone())
            }
            Some(Route::Feed { .. }) => self.serve_feed(req).await,
            None => {
                info!(status = 404, path, "serving: not found");
                respond_text(StatusCode::NOT_FOUND, PAGE_NOT_FOUND)
            }
        }
    }

    fn is_token_match(&self, req: &HttpRequest) -> bool {
        web::Query::<FeedQuery>::from_query(req.query_string())
            .ok()
            .and_then(|query| query.into_inner().token)
            .is_some_and(|token| token == self.token)
    }

    async fn serve_feed(&self, req: &HttpRequest) -> HttpResponse {
        let path = req.path();
        if !self.is_token_match(req) {
            info!(status = 401, path, "serving: dynamic");
            return respond_text(StatusCode::UNAUTHORIZED, UNAUTHORISED);
        }

        let snapshot = self.store.snapshot().await;
        match atom::render(&snapshot) {
            Ok(xml) => {
                info!(status = 200, path, entries = snapshot.entries.len(), "serving: dynamic");
                respond(StatusCode::OK, ATOM_MIME_TYPE, xml)
            }
            Err(e) => {
                error!(error = %e, "failed to render feed");
                respond_text(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
            }
        }
    }
}

/// Catch-all actix handler.
pub async fn dispatch(req: HttpRequest, router: web::Data<Router>) -> HttpResponse {
    router.dispatch(&req).await
}

/// Caps concurrent in-flight requests per peer address.
pub struct PeerLimiter {
    max_per_peer: usize,
    in_flight: Mutex<HashMap<IpAddr, usize>>,
}

pub struct PeerPermit {
    limiter: Arc<PeerLimiter>,
    ip: IpAddr,
}

impl PeerLimiter {
    pub fn new(max_per_peer: usize) -> Self {
        Self {
            max_per_peer: max_per_peer.max(1),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(limiter: &Arc<PeerLimiter>, ip: IpAddr) -> Option<PeerPermit> {
        let mut in_flight = limiter.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let count = in_flight.entry(ip).or_insert(0);
        if *count >= limiter.max_per_peer {
            return None;
        }
        *count += 1;

        Some(PeerPermit {
            limiter: Arc::clone(limiter),
            ip,
        })
    }

    pub fn in_flight(&self, ip: IpAddr) -> usize {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.get(&ip).copied().unwrap_or(0)
    }
}

impl Drop for PeerPermit {
    fn drop(&mut self) {
        let mut in_flight = self
            .limiter
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(count) = in_flight.get_mut(&self.ip) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.ip);
            }
        }
    }
}

/// Middleware enforcing [`PeerLimiter`] when one is registered as app data.
pub async fn limit_per_peer(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, actix_web::Error> {
    let limiter = req.app_data::<web::Data<PeerLimiter>>().cloned();
    let peer = req.peer_addr().map(|addr| addr.ip());

    let (Some(limiter), Some(ip)) = (limiter, peer) else {
        return Ok(next.call(req).await?.map_into_boxed_body());
    };

    let Some(_permit) = PeerLimiter::try_acquire(&limiter.into_inner(), ip) else {
        warn!(%ip, path = req.path(), "too many concurrent requests from peer");
        let response = respond_text(StatusCode::TOO_MANY_REQUESTS, TOO_MANY_REQUESTS);
        return Ok(req.into_response(response));
    };

    Ok(next.call(req).await?.map_into_boxed_body())
}

/// Binds the HTTPS listener and serves until the process is signalled.
pub async fn serve(
    settings: &Settings,
    router: web::Data<Router>,
    tls: rustls::ServerConfig,
) -> std::io::Result<()> {
    // Test harnesses reconnect rapidly from one address, so no cap there
    let limiter = (!settings.fuzzing)
        .then(|| web::Data::new(PeerLimiter::new(settings.max_connections_per_peer)));

    let address = settings.socket_addr();
    let server = HttpServer::new(move || {
        let limiter = limiter.clone();
        App::new()
            .app_data(router.clone())
            .configure(move |cfg| {
                if let Some(limiter) = limiter {
                    cfg.app_data(limiter);
                }
            })
            .wrap(from_fn(limit_per_peer))
            .default_service(web::to(dispatch))
    })
    .keep_alive(CONNECTION_TIMEOUT)
    .client_request_timeout(CONNECTION_TIMEOUT)
    .bind_rustls_0_23(address, tls)?;

    info!("Server running at https://{address}/");
    server.run().await
}
