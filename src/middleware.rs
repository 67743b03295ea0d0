//! Tower integration: run [`Engine::admit`] before the wrapped service.

use crate::engine::{Engine, Request, Verdict};
use crate::error::AdmissionError;
use futures::future::BoxFuture;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Requests the admission layer can describe to the engine.
pub trait AdmissionRequest {
    fn admission_request(&self) -> Request;
}

impl AdmissionRequest for Request {
    fn admission_request(&self) -> Request {
        self.clone()
    }
}

/// A layer that denies requests exceeding the engine's limits.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    engine: Engine,
}

impl AdmissionLayer {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, engine: self.engine.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    engine: Engine,
}

impl<S, Req> Service<Req> for AdmissionService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    Req: AdmissionRequest + Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let engine = self.engine.clone();
        // the clone may not be ready; keep the one that was polled
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match engine.admit(&req.admission_request()).await {
                Verdict::Admitted { .. } => inner.call(req).await.map_err(AdmissionError::Inner),
                Verdict::Denied(denial) => Err(AdmissionError::Denied(denial)),
            }
        })
    }
}
