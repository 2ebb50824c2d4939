//! Applications: the unit of deployment.
//!
//! An [`Application`] owns its servlets, filters, URL mapping table, error
//! pages and session store, and composes the optional security and resource
//! capabilities. It is assembled with [`ApplicationBuilder`] and then driven
//! through its lifecycle by whoever deploys it:
//!
//! ```text
//! CONSTRUCTED → INITIALIZED → STARTED → STOPPED → DESTROYED
//! ```
//!
//! Only a `STARTED` application that has not been marked unavailable receives
//! traffic.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::filter::{Filter, FilterConfig, FilterMapping, FilterRegistration, FilterTarget};
use crate::router::mapping::{MappingError, MappingMatch, UrlMapper};
use crate::security::SecurityHook;
use crate::servlet::{Servlet, ServletConfig, ServletError};
use crate::session::{SessionConfig, SessionManager};

mod error_pages;
mod resources;

pub use error_pages::{ErrorPage, ErrorPages};
pub use resources::{MemoryResources, Resource, ResourceLookup, ResourceServlet};

/// Errors raised while building an application or moving it through its lifecycle.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("invalid context path {0:?}")]
    InvalidContextPath(String),

    #[error("servlet {0:?} is registered twice")]
    DuplicateServlet(String),

    #[error("filter {0:?} is registered twice")]
    DuplicateFilter(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("filter {filter:?} is mapped to unknown servlet {servlet:?}")]
    UnknownServlet { filter: String, servlet: String },

    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("{name} failed to initialize: {source}")]
    Init {
        name: String,
        #[source]
        source: ServletError,
    },
}

/// Where an application is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    Initialized,
    Started,
    Stopped,
    Destroyed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Constructed => "CONSTRUCTED",
            Self::Initialized => "INITIALIZED",
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::Destroyed => "DESTROYED",
        })
    }
}

/// Normalizes a context path: `"/"` and `""` both mean the root application.
///
/// # Errors
///
/// A non-root path must start with `/`, must not end with `/`, and must not
/// contain `*`, `?`, `;` or `#`.
pub fn normalize_context_path(path: &str) -> Result<String, ApplicationError> {
    if path.is_empty() || path == "/" {
        return Ok(String::new());
    }
    let valid = path.starts_with('/')
        && !path.ends_with('/')
        && !path.contains("//")
        && !path.contains(['*', '?', ';', '#']);
    if valid {
        Ok(path.to_owned())
    } else {
        Err(ApplicationError::InvalidContextPath(path.to_owned()))
    }
}

/// A deployed web application.
pub struct Application {
    context_path: String,
    display_name: Option<String>,
    servlet_order: Vec<String>,
    servlets: HashMap<String, Arc<dyn Servlet>>,
    filters: Vec<FilterRegistration>,
    mapper: UrlMapper,
    error_pages: ErrorPages,
    sessions: Arc<SessionManager>,
    security: Option<Arc<dyn SecurityHook>>,
    resources: Option<Arc<dyn ResourceLookup>>,
    state: Mutex<LifecycleState>,
    unavailable: AtomicBool,
}

impl Application {
    /// Starts building an application mounted at `context_path`.
    pub fn builder(context_path: impl Into<String>) -> ApplicationBuilder {
        ApplicationBuilder::new(context_path)
    }

    /// Normalized context path; empty for the root application.
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(if self.context_path.is_empty() {
            "ROOT"
        } else {
            self.context_path.as_str()
        })
    }

    pub fn servlet(&self, name: &str) -> Option<&Arc<dyn Servlet>> {
        self.servlets.get(name)
    }

    /// Servlet names in registration order.
    pub fn servlet_names(&self) -> impl Iterator<Item = &str> {
        self.servlet_order.iter().map(String::as_str)
    }

    /// Filters in declaration order.
    pub fn filters(&self) -> &[FilterRegistration] {
        &self.filters
    }

    pub fn mapper(&self) -> &UrlMapper {
        &self.mapper
    }

    /// Maps a context-relative path to a servlet.
    pub fn map(&self, path: &str) -> Option<MappingMatch> {
        self.mapper.map(path)
    }

    pub fn error_pages(&self) -> &ErrorPages {
        &self.error_pages
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn security(&self) -> Option<&Arc<dyn SecurityHook>> {
        self.security.as_ref()
    }

    pub fn resources(&self) -> Option<&Arc<dyn ResourceLookup>> {
        self.resources.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock_state()
    }

    /// `true` when started and not marked unavailable.
    pub fn is_available(&self) -> bool {
        self.state() == LifecycleState::Started && !self.unavailable.load(Ordering::Acquire)
    }

    /// Temporarily takes a started application out of service (answers `503`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
        info!(context = %self.display_name(), unavailable, "availability changed");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        state: &mut LifecycleState,
        allowed: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), ApplicationError> {
        if !allowed.contains(state) {
            return Err(ApplicationError::InvalidTransition { from: *state, to });
        }
        *state = to;
        Ok(())
    }

    /// Runs every servlet's and then every filter's `init`.
    ///
    /// # Errors
    ///
    /// [`ApplicationError::Init`] for the first callback that fails; the
    /// application stays `CONSTRUCTED`.
    pub fn init(&self) -> Result<(), ApplicationError> {
        let mut state = self.lock_state();
        if *state != LifecycleState::Constructed {
            return Err(ApplicationError::InvalidTransition {
                from: *state,
                to: LifecycleState::Initialized,
            });
        }
        for name in &self.servlet_order {
            let config = ServletConfig {
                name: name.clone(),
                context_path: self.context_path.clone(),
            };
            if let Some(servlet) = self.servlets.get(name) {
                servlet.init(&config).map_err(|source| ApplicationError::Init {
                    name: format!("servlet {name}"),
                    source,
                })?;
            }
        }
        for registration in &self.filters {
            let config = FilterConfig {
                name: registration.name.clone(),
                context_path: self.context_path.clone(),
            };
            registration
                .filter
                .init(&config)
                .map_err(|source| ApplicationError::Init {
                    name: format!("filter {}", registration.name),
                    source,
                })?;
        }
        *state = LifecycleState::Initialized;
        debug!(context = %self.display_name(), "application initialized");
        Ok(())
    }

    pub fn start(&self) -> Result<(), ApplicationError> {
        let mut state = self.lock_state();
        Self::transition(&mut state, &[LifecycleState::Initialized], LifecycleState::Started)?;
        info!(context = %self.display_name(), "application started");
        Ok(())
    }

    pub fn stop(&self) -> Result<(), ApplicationError> {
        let mut state = self.lock_state();
        Self::transition(&mut state, &[LifecycleState::Started], LifecycleState::Stopped)?;
        info!(context = %self.display_name(), "application stopped");
        Ok(())
    }

    /// Calls every `destroy` hook and drops all sessions.
    ///
    /// A started application must be stopped first.
    pub fn destroy(&self) -> Result<(), ApplicationError> {
        let mut state = self.lock_state();
        let was_initialized = *state != LifecycleState::Constructed;
        Self::transition(
            &mut state,
            &[
                LifecycleState::Constructed,
                LifecycleState::Initialized,
                LifecycleState::Stopped,
            ],
            LifecycleState::Destroyed,
        )?;
        if was_initialized {
            for registration in self.filters.iter().rev() {
                registration.filter.destroy();
            }
            for name in self.servlet_order.iter().rev() {
                if let Some(servlet) = self.servlets.get(name) {
                    servlet.destroy();
                }
            }
        }
        self.sessions.invalidate_all();
        info!(context = %self.display_name(), "application destroyed");
        Ok(())
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("context_path", &self.context_path)
            .field("servlets", &self.servlet_order)
            .field("filters", &self.filters.iter().map(|r| &r.name).collect::<Vec<_>>())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Assembles an [`Application`].
///
/// Registration errors are collected and reported by [`build`](Self::build),
/// so calls can be chained.
///
/// # Examples
///
/// ```
/// use servlette::application::Application;
/// use servlette::filter::FilterMapping;
/// use servlette::servlet::servlet_fn;
///
/// let app = Application::builder("/context")
///     .servlet("snoop", servlet_fn(|ctx| Ok(ctx.response_mut().write_str("hi")?)), &["/snoop/*"])
///     .build()
///     .unwrap();
/// assert_eq!(app.map("/snoop/index.html").unwrap().servlet_name, "snoop");
/// ```
pub struct ApplicationBuilder {
    context_path: String,
    display_name: Option<String>,
    servlets: Vec<(String, Arc<dyn Servlet>, Vec<String>)>,
    filters: Vec<FilterRegistration>,
    error_pages: Vec<ErrorPage>,
    session_config: SessionConfig,
    security: Option<Arc<dyn SecurityHook>>,
    resources: Option<Arc<dyn ResourceLookup>>,
}

impl ApplicationBuilder {
    fn new(context_path: impl Into<String>) -> Self {
        Self {
            context_path: context_path.into(),
            display_name: None,
            servlets: Vec::new(),
            filters: Vec::new(),
            error_pages: Vec::new(),
            session_config: SessionConfig::default(),
            security: None,
            resources: None,
        }
    }

    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Registers a servlet under `name`, mapped to each of `patterns`.
    #[must_use]
    pub fn servlet(
        self,
        name: impl Into<String>,
        servlet: impl Servlet + 'static,
        patterns: &[&str],
    ) -> Self {
        self.servlet_arc(name, Arc::new(servlet), patterns)
    }

    #[must_use]
    pub fn servlet_arc(
        mut self,
        name: impl Into<String>,
        servlet: Arc<dyn Servlet>,
        patterns: &[&str],
    ) -> Self {
        let patterns = patterns.iter().map(|p| (*p).to_owned()).collect();
        self.servlets.push((name.into(), servlet, patterns));
        self
    }

    /// Registers a filter. Filters run in the order they are registered.
    #[must_use]
    pub fn filter(
        mut self,
        name: impl Into<String>,
        filter: impl Filter + 'static,
        mappings: impl IntoIterator<Item = FilterMapping>,
    ) -> Self {
        self.filters.push(FilterRegistration {
            name: name.into(),
            filter: Arc::new(filter),
            mappings: mappings.into_iter().collect(),
        });
        self
    }

    #[must_use]
    pub fn error_page(mut self, page: ErrorPage) -> Self {
        self.error_pages.push(page);
        self
    }

    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    #[must_use]
    pub fn security(mut self, hook: impl SecurityHook + 'static) -> Self {
        self.security = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn resources(mut self, lookup: impl ResourceLookup + 'static) -> Self {
        self.resources = Some(Arc::new(lookup));
        self
    }

    /// Validates the registrations and produces a `CONSTRUCTED` application.
    ///
    /// # Errors
    ///
    /// - [`ApplicationError::InvalidContextPath`]: malformed context path.
    /// - [`ApplicationError::DuplicateServlet`] / [`ApplicationError::DuplicateFilter`].
    /// - [`ApplicationError::Mapping`]: malformed or conflicting URL pattern.
    /// - [`ApplicationError::UnknownServlet`]: a filter names a servlet that does not exist.
    pub fn build(self) -> Result<Application, ApplicationError> {
        let context_path = normalize_context_path(&self.context_path)?;

        let mut servlet_order = Vec::with_capacity(self.servlets.len());
        let mut servlets = HashMap::with_capacity(self.servlets.len());
        let mut mapper = UrlMapper::new();
        for (name, servlet, patterns) in self.servlets {
            if servlets.contains_key(&name) {
                return Err(ApplicationError::DuplicateServlet(name));
            }
            for pattern in &patterns {
                mapper.add(pattern, &name)?;
            }
            servlet_order.push(name.clone());
            servlets.insert(name, servlet);
        }

        let mut seen = std::collections::HashSet::new();
        for registration in &self.filters {
            if !seen.insert(registration.name.as_str()) {
                return Err(ApplicationError::DuplicateFilter(registration.name.clone()));
            }
            for mapping in &registration.mappings {
                if let FilterTarget::Servlet(servlet) = mapping.target() {
                    if servlet != "*" && !servlets.contains_key(servlet) {
                        return Err(ApplicationError::UnknownServlet {
                            filter: registration.name.clone(),
                            servlet: servlet.clone(),
                        });
                    }
                }
            }
        }

        let mut error_pages = ErrorPages::default();
        for page in self.error_pages {
            error_pages.insert(page);
        }

        Ok(Application {
            context_path,
            display_name: self.display_name,
            servlet_order,
            servlets,
            filters: self.filters,
            mapper,
            error_pages,
            sessions: SessionManager::new(self.session_config),
            security: self.security,
            resources: self.resources,
            state: Mutex::new(LifecycleState::Constructed),
            unavailable: AtomicBool::new(false),
        })
    }
}
