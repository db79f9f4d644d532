//! Per-endpoint HTTP metrics collection.
//!
//! Counts every request, accumulates latency per "METHOD /path" key in
//! `AppState`, and counts 4xx/5xx responses as errors. The snapshots are
//! served by the /metrics endpoint.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct HttpMetrics;

impl<S, B> Transform<S, ServiceRequest> for HttpMetrics
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = HttpMetricsService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(HttpMetricsService { service }))
    }
}

pub struct HttpMetricsService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for HttpMetricsService<S>
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
        let started = Instant::now();
        // Path without the query string, so /status?verbose=1 and /status
        // land in the same bucket
        let endpoint = format!("{} {}", req.method(), req.uri().path());

        if let Some(state) = req.app_data::<web::Data<AppState>>() {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            if let Ok(response) = &result {
                if let Some(state) = response.request().app_data::<web::Data<AppState>>() {
                    state.record_endpoint_request(&endpoint, duration_ms, is_error);

                    if is_error {
                        state.increment_error_count();
                    }
                }
            }

            result
        })
    }
}
