//! Handler registration and request dispatch.
//!
//! # Dispatch Order (first match wins)
//! 1. `*` target → empty `200`
//! 2. `/` with a handler registered for the request's media type
//! 3. Exact path
//! 4. Prefixes, in registration order
//! 5. `404`
//!
//! # Design Decisions
//! - Tables are mutable while requests are in flight: the exact and
//!   content-type tables are `DashMap`s, the ordered prefix list is swapped
//!   wholesale through `ArcSwap`
//! - Handlers get `&mut Request` / `&mut Response` and report failures as
//!   [`HandlerError`]; the dispatcher turns status errors into responses
//!   and closes any response the handler left open

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use http::StatusCode;

use super::{ConnectionOutcome, Request, Response};
use crate::error::{HandlerError, HttpError, Result};
use crate::observability::metrics;

/// Boxed future returned by handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An application request handler.
pub trait Handler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

struct HandlerFn<F>(F);

impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, Result<(), HandlerError>>
        + Send
        + Sync
        + 'static,
{
    fn handle<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        (self.0)(req, res)
    }
}

/// Adapt a closure into a [`Handler`].
///
/// ```ignore
/// let hello = handler_fn(|_req, res| Box::pin(async move {
///     res.send_text(StatusCode::OK, "hello").await?;
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, Result<(), HandlerError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(HandlerFn(f))
}

type PrefixTable = Vec<(String, Arc<dyn Handler>)>;

/// The three handler tables.
pub struct Dispatcher {
    exact: DashMap<String, Arc<dyn Handler>>,
    content_types: DashMap<String, Arc<dyn Handler>>,
    prefixes: ArcSwap<PrefixTable>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            exact: DashMap::new(),
            content_types: DashMap::new(),
            prefixes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn add_exact(&self, path: impl Into<String>, handler: Arc<dyn Handler>) {
        self.exact.insert(path.into(), handler);
    }

    pub fn remove_exact(&self, path: &str) -> bool {
        self.exact.remove(path).is_some()
    }

    /// Register a prefix. Prefixes are tried in registration order;
    /// re-registering a prefix replaces its handler in place.
    pub fn add_prefix(&self, prefix: impl Into<String>, handler: Arc<dyn Handler>) {
        let prefix = prefix.into();
        self.prefixes.rcu(|current| {
            let mut table: PrefixTable = current.iter().cloned().collect();
            match table.iter_mut().find(|(p, _)| *p == prefix) {
                Some(entry) => entry.1 = Arc::clone(&handler),
                None => table.push((prefix.clone(), Arc::clone(&handler))),
            }
            table
        });
    }

    pub fn remove_prefix(&self, prefix: &str) -> bool {
        let previous = self.prefixes.rcu(|current| {
            current
                .iter()
                .filter(|(p, _)| p != prefix)
                .cloned()
                .collect::<PrefixTable>()
        });
        previous.iter().any(|(p, _)| p == prefix)
    }

    /// Register a handler for requests to `/` with this media type
    /// (compared without parameters, case-insensitively).
    pub fn add_content_type(&self, media_type: &str, handler: Arc<dyn Handler>) {
        self.content_types
            .insert(media_type.trim().to_ascii_lowercase(), handler);
    }

    pub fn remove_content_type(&self, media_type: &str) -> bool {
        self.content_types
            .remove(&media_type.trim().to_ascii_lowercase())
            .is_some()
    }

    /// Find the handler for `req`, following the dispatch order.
    pub fn resolve(&self, req: &Request) -> Option<Arc<dyn Handler>> {
        let path = req.path();
        if path == "/" {
            if let Some(media_type) = req.media_type() {
                if let Some(handler) = self.content_types.get(&media_type) {
                    return Some(Arc::clone(handler.value()));
                }
            }
        }
        if let Some(handler) = self.exact.get(path) {
            return Some(Arc::clone(handler.value()));
        }
        self.prefixes
            .load()
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, handler)| Arc::clone(handler))
    }

    /// Run the matching handler and finish the response.
    ///
    /// Handler status errors become responses while the head is still
    /// unsent. Errors that can no longer be reported to the peer are
    /// returned; the caller must then abandon the connection or stream.
    pub async fn dispatch(&self, req: &mut Request, res: &mut Response) -> Result<ConnectionOutcome> {
        let started = Instant::now();
        let protocol = req.protocol().as_str();

        let outcome = if req.target() == "*" {
            res.send(Bytes::new()).await
        } else {
            match self.resolve(req) {
                Some(handler) => self.invoke(handler, req, res).await,
                None => res.send_text(StatusCode::NOT_FOUND, "Not Found").await,
            }
        };

        if res.headers_sent() {
            metrics::request_completed(protocol, res.status(), started.elapsed());
        }
        tracing::debug!(
            method = %req.method(),
            target = %req.target(),
            status = res.status().as_u16(),
            protocol,
            "Request dispatched"
        );
        outcome
    }

    async fn invoke(
        &self,
        handler: Arc<dyn Handler>,
        req: &mut Request,
        res: &mut Response,
    ) -> Result<ConnectionOutcome> {
        match handler.handle(req, res).await {
            Ok(()) => res.close().await,
            Err(HandlerError::Status { status, message }) if !res.headers_sent() => {
                tracing::debug!(status = status.as_u16(), message = %message, "Handler returned status");
                res.send_text(status, message).await
            }
            Err(HandlerError::Status { status, message }) => {
                Err(HttpError::status(status, message))
            }
            Err(HandlerError::Other(err)) => Err(HttpError::Handler(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, Protocol, Version};

    fn request(target: &str, content_type: Option<&str>) -> Request {
        let mut headers = Headers::new();
        if let Some(ct) = content_type {
            headers.set("Content-Type", ct);
        }
        Request::new(
            Protocol::Http1,
            "POST".into(),
            target.into(),
            Version::HTTP_11,
            headers,
            "127.0.0.1:1".parse().unwrap(),
        )
    }

    struct Named(&'static str);

    impl Handler for Named {
        fn handle<'a>(
            &'a self,
            _req: &'a mut Request,
            res: &'a mut Response,
        ) -> BoxFuture<'a, Result<(), HandlerError>> {
            Box::pin(async move {
                res.send_text(StatusCode::OK, self.0).await?;
                Ok(())
            })
        }
    }

    fn named(name: &'static str) -> Arc<dyn Handler> {
        Arc::new(Named(name))
    }

    fn resolved_name(dispatcher: &Dispatcher, req: &Request) -> Option<*const ()> {
        dispatcher
            .resolve(req)
            .map(|h| Arc::as_ptr(&h) as *const ())
    }

    #[test]
    fn exact_beats_prefix_and_content_type() {
        let dispatcher = Dispatcher::new();
        let exact = named("exact");
        let prefix = named("prefix");
        let xml = named("xml");
        dispatcher.add_exact("/foo", Arc::clone(&exact));
        dispatcher.add_prefix("/fo", Arc::clone(&prefix));
        dispatcher.add_content_type("text/xml", Arc::clone(&xml));

        let ptr = |h: &Arc<dyn Handler>| Some(Arc::as_ptr(h) as *const ());
        assert_eq!(resolved_name(&dispatcher, &request("/foo", Some("text/xml"))), ptr(&exact));
        assert_eq!(resolved_name(&dispatcher, &request("/foo?x=1", None)), ptr(&exact));
        assert_eq!(resolved_name(&dispatcher, &request("/fox", None)), ptr(&prefix));
        assert_eq!(
            resolved_name(&dispatcher, &request("/", Some("Text/XML; charset=utf-8"))),
            ptr(&xml)
        );
        assert!(dispatcher.resolve(&request("/", Some("application/json"))).is_none());
        assert!(dispatcher.resolve(&request("/bar", None)).is_none());
    }

    #[test]
    fn prefixes_match_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let short = named("short");
        let long = named("long");
        dispatcher.add_prefix("/api", Arc::clone(&short));
        dispatcher.add_prefix("/api/v2", Arc::clone(&long));

        let ptr = |h: &Arc<dyn Handler>| Some(Arc::as_ptr(h) as *const ());
        assert_eq!(resolved_name(&dispatcher, &request("/api/v2/x", None)), ptr(&short));

        assert!(dispatcher.remove_prefix("/api"));
        assert!(!dispatcher.remove_prefix("/api"));
        assert_eq!(resolved_name(&dispatcher, &request("/api/v2/x", None)), ptr(&long));
    }

    #[test]
    fn tables_can_be_unregistered() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_exact("/a", named("a"));
        dispatcher.add_content_type("text/xml", named("xml"));
        assert!(dispatcher.remove_exact("/a"));
        assert!(dispatcher.remove_content_type("TEXT/XML"));
        assert!(dispatcher.resolve(&request("/a", None)).is_none());
        assert!(dispatcher.resolve(&request("/", Some("text/xml"))).is_none());
    }
}
