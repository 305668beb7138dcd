//! Request-to-session binding
//!
//! Every request outside the bypass prefixes gets a fresh scope linked to a
//! session: the one named by the session header when it is still live,
//! otherwise a new one. The scope's reference is released after the handler
//! returns and before the response is sent, so a session flagged for
//! immediate expiry is gone by the time the client sees the response.

use crate::config::SessionConfig;
use crate::error::{CoreResult, ScopekeeperError};
use crate::scope::{ScopeContainer, ScopeId};
use crate::session::{ScopeLease, Session, SessionId, SessionRegistry};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, error, info_span, Instrument};

/// Settings and registry handle shared by the binding middleware
pub struct SessionBinding {
    registry: Arc<SessionRegistry>,
    header_name: HeaderName,
    bypass_prefixes: Vec<String>,
    expire_new_immediately: bool,
}

impl SessionBinding {
    /// Build from session configuration
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::Config` if the header name is invalid.
    pub fn new(registry: Arc<SessionRegistry>, config: &SessionConfig) -> CoreResult<Self> {
        let header_name = HeaderName::from_bytes(config.header_name.as_bytes()).map_err(|e| {
            ScopekeeperError::Config(format!(
                "Invalid session header name {}: {}",
                config.header_name, e
            ))
        })?;

        Ok(Self {
            registry,
            header_name,
            bypass_prefixes: config
                .bypass_prefixes
                .iter()
                .map(|prefix| prefix.to_ascii_lowercase())
                .collect(),
            expire_new_immediately: config.expire_new_sessions_immediately,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header_name
    }

    /// True when `path` starts with a bypass prefix, ignoring ASCII case
    pub fn is_bypassed(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        self.bypass_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn resolve(
        &self,
        scope: Arc<ScopeContainer>,
        headers: &HeaderMap,
    ) -> CoreResult<(Arc<Session>, ScopeLease)> {
        if let Some(session_id) = self.requested_session(headers) {
            match self.registry.get_session(&session_id) {
                Ok(session) => match self.registry.attach_scope(Arc::clone(&scope), &session) {
                    Ok(lease) => return Ok((session, lease)),
                    Err(e) if e.is_not_found() => {
                        debug!(session.id = %session_id, "Session ended before attach, creating a new one")
                    }
                    Err(e) => return Err(e),
                },
                Err(_) => {
                    debug!(session.id = %session_id, "Requested session not found, creating a new one")
                }
            }
        }

        let (session, lease) = self.registry.attach_new_session(scope)?;
        if self.expire_new_immediately {
            session.set_expires_immediately(true);
        }
        Ok((session, lease))
    }

    fn requested_session(&self, headers: &HeaderMap) -> Option<SessionId> {
        let raw = headers.get(&self.header_name)?;
        let parsed = raw
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<SessionId>().ok());
        if parsed.is_none() {
            debug!("Malformed session header ignored");
        }
        parsed
    }
}

/// Per-request scope and session, available to handlers as an extension
#[derive(Clone)]
pub struct RequestContext {
    pub scope: Arc<ScopeContainer>,
    pub session: Arc<Session>,
}

impl RequestContext {
    pub fn scope_id(&self) -> ScopeId {
        self.scope.id()
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }
}

/// Axum middleware binding each request to a scope and session
///
/// Lifecycle failures never reach the client as errors other than a bare
/// 500 when no session can be created at all.
pub async fn bind_session(
    State(binding): State<Arc<SessionBinding>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if binding.is_bypassed(request.uri().path()) {
        return next.run(request).await;
    }

    let scope = binding.registry.scope_factory().create_scope(None);
    let (session, lease) = match binding.resolve(Arc::clone(&scope), request.headers()) {
        Ok(bound) => bound,
        Err(e) => {
            error!(scope.id = %scope.id(), error = %e, "Failed to bind request to a session");
            scope.dispose();
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let span = info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        scope.id = %scope.id(),
        session.id = %session.id(),
    );
    request.extensions_mut().insert(RequestContext {
        scope: Arc::clone(&scope),
        session: Arc::clone(&session),
    });

    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&session.id().to_string()) {
        response
            .headers_mut()
            .insert(binding.header_name.clone(), value);
    }

    let outcome = lease.release().await;
    debug!(session.id = %session.id(), ?outcome, "Request scope released");
    response
}
