//! Route table and middleware.

use crate::context::{Context, HandlerResult};
use crate::error::{Fault, RouterError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tether_packet::{is_reserved, operator};
use tracing::debug;

/// Handles a request, finishing with [`Context::success`] or [`Context::error`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    async fn call(&self, ctx: Context) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: Context) -> HandlerResult {
        self(ctx).await
    }
}

/// Runs before a handler and may replace the context it receives.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Inspect or augment the request.
    ///
    /// Responding on the context stops the chain; the handler does not run.
    async fn handle(&self, ctx: Context) -> Result<Context, Fault>;
}

#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Context, Fault>> + Send + 'static,
{
    async fn handle(&self, ctx: Context) -> Result<Context, Fault> {
        self(ctx).await
    }
}

/// Wrap a middleware for [`Router::handle_func_with`].
pub fn middleware(middleware: impl Middleware) -> Arc<dyn Middleware> {
    Arc::new(middleware)
}

struct Route {
    name: String,
    handler: Arc<dyn Handler>,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// Maps operators to handlers.
#[derive(Default)]
pub struct Router {
    routes: HashMap<u32, Route>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `route`.
    ///
    /// # Errors
    ///
    /// Fails if the route hashes into the reserved range or onto an operator
    /// that is already registered.
    pub fn handle_func(
        &mut self,
        route: &str,
        handler: impl Handler,
    ) -> Result<&mut Self, RouterError> {
        self.handle_func_with(route, handler, Vec::new())
    }

    /// Register a handler for `route` preceded by its own middleware.
    ///
    /// # Errors
    ///
    /// Fails if the route hashes into the reserved range or onto an operator
    /// that is already registered.
    pub fn handle_func_with(
        &mut self,
        route: &str,
        handler: impl Handler,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> Result<&mut Self, RouterError> {
        let operator = operator(route);
        if is_reserved(operator) {
            return Err(RouterError::Reserved {
                route: route.to_string(),
                operator,
            });
        }
        if let Some(existing) = self.routes.get(&operator) {
            return Err(RouterError::Collision {
                route: route.to_string(),
                existing: existing.name.clone(),
                operator,
            });
        }

        debug!("Registered route {} as operator {}", route, operator);
        self.routes.insert(
            operator,
            Route {
                name: route.to_string(),
                handler: Arc::new(handler),
                middleware,
            },
        );
        Ok(self)
    }

    /// Append middleware run for every route, after per-route middleware.
    pub fn use_middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Name of the route registered under `operator`.
    #[must_use]
    pub fn route_name(&self, operator: u32) -> Option<&str> {
        self.routes.get(&operator).map(|route| route.name.as_str())
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if no routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Run middleware and the handler for the context's operator.
    ///
    /// Returns `None` when no route matches.
    pub(crate) async fn dispatch(&self, ctx: Context) -> Option<HandlerResult> {
        let route = self.routes.get(&ctx.operator())?;
        Some(self.run(route, ctx).await)
    }

    async fn run(&self, route: &Route, mut ctx: Context) -> HandlerResult {
        for middleware in route.middleware.iter().chain(self.middleware.iter()) {
            ctx = middleware.handle(ctx).await?;
            if ctx.is_completed() {
                return Ok(());
            }
        }
        route.handler.call(ctx).await
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|(operator, route)| (route.name.as_str(), *operator))
            .collect();
        routes.sort_unstable();
        f.debug_struct("Router")
            .field("routes", &routes)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}
