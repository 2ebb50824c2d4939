//! HTTP Basic authentication for URL-constrained resources.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::{debug, warn};

use super::{IdentityStore, PRINCIPAL_SESSION_ATTRIBUTE, Principal, SecurityDecision, SecurityHook};
use crate::context::Context;
use crate::router::mapping::{MappingError, UrlPattern};

/// A URL pattern that requires authentication, and optionally one of a set of roles.
#[derive(Debug, Clone)]
pub struct SecurityConstraint {
    pattern: UrlPattern,
    roles: Vec<String>,
}

impl SecurityConstraint {
    /// Requires any authenticated user for paths matching `pattern`.
    ///
    /// # Errors
    ///
    /// [`MappingError::InvalidPattern`] for an unparseable pattern.
    pub fn new(pattern: &str) -> Result<Self, MappingError> {
        Ok(Self {
            pattern: UrlPattern::parse(pattern)?,
            roles: Vec::new(),
        })
    }

    /// Additionally requires `role`. With several roles, any one suffices.
    #[must_use]
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    fn permits(&self, principal: &Principal) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| principal.has_role(r))
    }
}

/// Challenges for Basic credentials on constrained paths.
///
/// On successful authentication the principal is attached to the request.
/// If the exchange already has a session that was not yet bound to this
/// principal, its id is rotated before the principal is recorded on it.
pub struct BasicAuthHook {
    realm: String,
    constraints: Vec<SecurityConstraint>,
    identities: Arc<dyn IdentityStore>,
}

impl BasicAuthHook {
    pub fn new(realm: impl Into<String>, identities: Arc<dyn IdentityStore>) -> Self {
        Self {
            realm: realm.into(),
            constraints: Vec::new(),
            identities,
        }
    }

    #[must_use]
    pub fn constraint(mut self, constraint: SecurityConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    fn challenge(&self) -> SecurityDecision {
        SecurityDecision::Deny {
            status: 401,
            challenge: Some(format!("Basic realm=\"{}\"", self.realm)),
        }
    }

    fn credentials(ctx: &Context) -> Option<(String, String)> {
        let header = ctx.request().headers().get("authorization")?;
        let (scheme, encoded) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_owned(), password.to_owned()))
    }

    // Rotates the session id when the session was not yet bound to `principal`.
    fn bind_session(ctx: &mut Context, principal: &Principal) {
        let Some(session) = ctx.session(false) else {
            return;
        };
        let bound = session.attribute(PRINCIPAL_SESSION_ATTRIBUTE);
        if bound.as_ref().and_then(Value::as_str) == Some(principal.name()) {
            return;
        }
        match ctx.change_session_id() {
            Ok(new_id) => {
                if let Some(session) = ctx.session(false) {
                    session.set_attribute(PRINCIPAL_SESSION_ATTRIBUTE, principal.name());
                }
                debug!(
                    user = principal.name(),
                    session = %new_id,
                    "session id rotated after login"
                );
            }
            Err(e) => warn!(error = %e, "could not rotate session id after login"),
        }
    }
}

impl SecurityHook for BasicAuthHook {
    fn check(&self, ctx: &mut Context) -> SecurityDecision {
        let path = ctx.request().context_relative_path().to_owned();
        let Some(constraint) = self.constraints.iter().find(|c| c.pattern.matches(&path)) else {
            return SecurityDecision::Allow;
        };

        let Some((user, password)) = Self::credentials(ctx) else {
            return self.challenge();
        };
        let Some(principal) = self.identities.validate(&user, &password) else {
            debug!(%user, "authentication failed");
            return self.challenge();
        };
        if !constraint.permits(&principal) {
            debug!(%user, %path, "authenticated user lacks a required role");
            return SecurityDecision::Deny {
                status: 403,
                challenge: None,
            };
        }

        Self::bind_session(ctx, &principal);
        ctx.request_mut().set_principal(principal);
        SecurityDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::Application;
    use crate::http::SessionIdSource;
    use crate::security::InMemoryIdentityStore;
    use crate::servlet::servlet_fn;

    fn hook() -> BasicAuthHook {
        let store = InMemoryIdentityStore::new();
        store.add_user("alice", "wonderland", ["admin"]);
        store.add_user("bob", "builder", Vec::<String>::new());
        BasicAuthHook::new("test", Arc::new(store))
            .constraint(SecurityConstraint::new("/admin/*").unwrap().role("admin"))
    }

    fn app() -> Arc<Application> {
        Arc::new(
            Application::builder("/ctx")
                .servlet("any", servlet_fn(|_| Ok(())), &["/"])
                .build()
                .unwrap(),
        )
    }

    fn ctx(app: &Arc<Application>, path: &str, auth: Option<(&str, &str)>) -> Context {
        let mut ctx = Context::detached(&format!("GET /ctx{path} HTTP/1.1"));
        ctx.set_application(Arc::clone(app));
        ctx.request_mut().set_context_path("/ctx");
        if let Some((user, password)) = auth {
            let token = STANDARD.encode(format!("{user}:{password}"));
            ctx.request_mut().headers_mut().append("Authorization", format!("Basic {token}"));
        }
        ctx
    }

    #[test]
    fn unconstrained_paths_pass() {
        let app = app();
        let mut ctx = ctx(&app, "/public", None);
        assert_eq!(hook().check(&mut ctx), SecurityDecision::Allow);
        assert!(ctx.request().principal().is_none());
    }

    #[test]
    fn missing_or_bad_credentials_are_challenged() {
        let app = app();
        for auth in [None, Some(("alice", "nope")), Some(("mallory", "x"))] {
            let mut ctx = ctx(&app, "/admin/panel", auth);
            assert_eq!(
                hook().check(&mut ctx),
                SecurityDecision::Deny {
                    status: 401,
                    challenge: Some("Basic realm=\"test\"".into())
                }
            );
        }
    }

    #[test]
    fn missing_role_is_forbidden() {
        let app = app();
        let mut ctx = ctx(&app, "/admin/panel", Some(("bob", "builder")));
        assert_eq!(
            hook().check(&mut ctx),
            SecurityDecision::Deny {
                status: 403,
                challenge: None
            }
        );
    }

    #[test]
    fn login_sets_principal_and_rotates_session() {
        let app = app();
        let before = app.sessions().create();
        let mut ctx = ctx(&app, "/admin/panel", Some(("alice", "wonderland")));
        ctx.request_mut()
            .set_requested_session_id(before.id().to_owned(), SessionIdSource::Cookie);

        assert_eq!(hook().check(&mut ctx), SecurityDecision::Allow);
        assert!(ctx.request().is_user_in_role("admin"));
        assert!(!before.is_valid());
        let after = ctx.session(false).unwrap();
        assert_ne!(after.id(), before.id());
        assert_eq!(after.attribute(PRINCIPAL_SESSION_ATTRIBUTE), Some(Value::from("alice")));

        // Already bound: no second rotation.
        let id = after.id().to_owned();
        assert_eq!(hook().check(&mut ctx), SecurityDecision::Allow);
        assert_eq!(ctx.session(false).unwrap().id(), id);
    }
}
