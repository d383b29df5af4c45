//! Request logging.
//!
//! Every request gets a short request id and a tracing span carrying it, so log
//! lines emitted by handlers during the request can be correlated. Health probes
//! are logged at debug to keep load balancer polling out of the info stream.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, StatusCode},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

fn is_health_probe(path: &str) -> bool {
    path == "/health" || path == "/api/v1/health"
}

/// First 8 hex digits of a v4 uuid; plenty to tell concurrent requests apart.
fn short_request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().clone();
        let path = req.path().to_string();
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        let quiet = is_health_probe(&path);
        let is_upgrade = req.headers().contains_key(header::UPGRADE);

        let span = info_span!("request", request_id = %short_request_id(), method = %method, path = %path);

        if quiet {
            debug!(parent: &span, remote_addr = %remote_addr, "Health probe");
        } else {
            info!(parent: &span, remote_addr = %remote_addr, upgrade = is_upgrade, "Request started");
        }

        let fut = self.service.call(req);

        Box::pin(
            async move {
                let result = fut.await;
                let duration_ms = start_time.elapsed().as_millis() as u64;

                match &result {
                    Ok(response) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                        // the socket actor logs its own lifecycle from here on
                        info!(remote_addr = %remote_addr, duration_ms, "WebSocket upgraded");
                    }
                    Ok(response) if quiet && response.status().is_success() => {
                        debug!(duration_ms, "Health probe answered");
                    }
                    Ok(response) => {
                        info!(status = response.status().as_u16(), duration_ms, "Request completed");
                    }
                    Err(err) => {
                        error!(remote_addr = %remote_addr, duration_ms, error = %err, "Request failed");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}
