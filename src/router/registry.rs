//! Deployed applications keyed by context path.
//!
//! Readers (every connection) take a lock-free snapshot of the whole table;
//! deploy and undeploy build a new table and publish it atomically, so a
//! reader sees an application either fully started or not at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::info;

use crate::application::{Application, ApplicationError, LifecycleState};

type Table = HashMap<String, Arc<Application>>;

/// Errors raised by deploy and undeploy.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("an application is already deployed at {0:?}")]
    DuplicateContext(String),

    #[error("no application is deployed at {0:?}")]
    NotDeployed(String),

    #[error(transparent)]
    Application(#[from] ApplicationError),
}

/// The set of live applications.
#[derive(Default)]
pub struct ApplicationRegistry {
    table: ArcSwap<Table>,
    writer: Mutex<()>,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes and starts `application`, then makes it routable.
    ///
    /// An application that is already initialized or started is published as is.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateContext`]: the context path is taken.
    /// - [`RegistryError::Application`]: a lifecycle callback failed, or the
    ///   application was already stopped or destroyed.
    pub fn deploy(&self, application: Arc<Application>) -> Result<(), RegistryError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let context_path = application.context_path().to_owned();
        if self.table.load().contains_key(&context_path) {
            return Err(RegistryError::DuplicateContext(context_path));
        }

        let state = application.state();
        if matches!(state, LifecycleState::Stopped | LifecycleState::Destroyed) {
            return Err(ApplicationError::InvalidTransition {
                from: state,
                to: LifecycleState::Started,
            }
            .into());
        }

        if application.state() == LifecycleState::Constructed {
            application.init()?;
        }
        if application.state() == LifecycleState::Initialized {
            application.start()?;
        }

        let mut next = Table::clone(&self.table.load());
        next.insert(context_path, Arc::clone(&application));
        self.table.store(Arc::new(next));
        info!(context = %application.display_name(), "application deployed");
        Ok(())
    }

    /// Unpublishes the application at `context_path`, then stops and destroys it.
    ///
    /// Requests already holding the application finish against it.
    pub fn undeploy(&self, context_path: &str) -> Result<Arc<Application>, RegistryError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Table::clone(&self.table.load());
        let application = next
            .remove(context_path)
            .ok_or_else(|| RegistryError::NotDeployed(context_path.to_owned()))?;
        self.table.store(Arc::new(next));

        if application.state() == LifecycleState::Started {
            application.stop()?;
        }
        application.destroy()?;
        info!(context = %application.display_name(), "application undeployed");
        Ok(application)
    }

    /// Returns the application whose context path is the longest `/`-aligned
    /// prefix of `path`; the root application (`""`) claims everything else.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use servlette::application::Application;
    /// use servlette::router::ApplicationRegistry;
    ///
    /// let registry = ApplicationRegistry::new();
    /// registry.deploy(Arc::new(Application::builder("/shop").build().unwrap())).unwrap();
    /// registry.deploy(Arc::new(Application::builder("/").build().unwrap())).unwrap();
    ///
    /// assert_eq!(registry.find("/shop/cart").unwrap().context_path(), "/shop");
    /// assert_eq!(registry.find("/shopping").unwrap().context_path(), "");
    /// ```
    pub fn find(&self, path: &str) -> Option<Arc<Application>> {
        let table = self.table.load();
        let mut candidate = path.trim_end_matches('/');
        loop {
            if let Some(application) = table.get(candidate) {
                return Some(Arc::clone(application));
            }
            match candidate.rfind('/') {
                Some(slash) => candidate = &candidate[..slash],
                // `*` and absolute-form targets never reach an aligned prefix.
                None => return table.get("").cloned(),
            }
        }
    }

    /// Returns the application deployed at exactly `context_path`.
    pub fn get(&self, context_path: &str) -> Option<Arc<Application>> {
        self.table.load().get(context_path).cloned()
    }

    /// Snapshot of every deployed application.
    pub fn applications(&self) -> Vec<Arc<Application>> {
        self.table.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}

impl std::fmt::Debug for ApplicationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.load();
        f.debug_struct("ApplicationRegistry")
            .field("contexts", &table.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(path: &str) -> Arc<Application> {
        Arc::new(Application::builder(path).build().unwrap())
    }

    #[test]
    fn deploy_starts_and_publishes() {
        let registry = ApplicationRegistry::new();
        let shop = app("/shop");
        registry.deploy(Arc::clone(&shop)).unwrap();
        assert_eq!(shop.state(), LifecycleState::Started);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("/shop").unwrap(), &shop));
    }

    #[test]
    fn duplicate_context_is_rejected() {
        let registry = ApplicationRegistry::new();
        registry.deploy(app("/shop")).unwrap();
        let second = app("/shop");
        let err = registry.deploy(Arc::clone(&second)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateContext(p) if p == "/shop"));
        assert_eq!(second.state(), LifecycleState::Constructed);
    }

    #[test]
    fn longest_context_prefix_wins() {
        let registry = ApplicationRegistry::new();
        registry.deploy(app("/a")).unwrap();
        registry.deploy(app("/a/b")).unwrap();
        assert_eq!(registry.find("/a/b/c").unwrap().context_path(), "/a/b");
        assert_eq!(registry.find("/a/bc").unwrap().context_path(), "/a");
        assert_eq!(registry.find("/a").unwrap().context_path(), "/a");
        assert!(registry.find("/nope").is_none());
    }

    #[test]
    fn root_claims_whatever_is_left() {
        let registry = ApplicationRegistry::new();
        registry.deploy(app("/")).unwrap();
        assert_eq!(registry.find("/").unwrap().context_path(), "");
        assert_eq!(registry.find("/x/y").unwrap().context_path(), "");
        assert_eq!(registry.find("").unwrap().context_path(), "");
    }

    #[test]
    fn undeploy_unpublishes_then_destroys() {
        let registry = ApplicationRegistry::new();
        registry.deploy(app("/gone")).unwrap();
        let removed = registry.undeploy("/gone").unwrap();
        assert_eq!(removed.state(), LifecycleState::Destroyed);
        assert!(registry.find("/gone/x").is_none());
        assert!(matches!(registry.undeploy("/gone"), Err(RegistryError::NotDeployed(_))));
    }

    #[test]
    fn retired_application_cannot_be_redeployed() {
        let registry = ApplicationRegistry::new();
        registry.deploy(app("/old")).unwrap();
        let destroyed = registry.undeploy("/old").unwrap();
        let err = registry.deploy(destroyed).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Application(ApplicationError::InvalidTransition {
                from: LifecycleState::Destroyed,
                to: LifecycleState::Started,
            })
        ));
        assert!(registry.is_empty());

        let stopped = app("/paused");
        stopped.init().unwrap();
        stopped.start().unwrap();
        stopped.stop().unwrap();
        assert!(registry.deploy(stopped).is_err());
        assert!(registry.find("/paused/x").is_none());
    }

    #[test]
    fn targets_without_a_slash_fall_to_root() {
        let registry = ApplicationRegistry::new();
        registry.deploy(app("/shop")).unwrap();
        assert!(registry.find("*").is_none());

        registry.deploy(app("/")).unwrap();
        assert_eq!(registry.find("*").unwrap().context_path(), "");
        assert_eq!(registry.find("http://host/x").unwrap().context_path(), "");
        assert_eq!(registry.find("/shop/cart").unwrap().context_path(), "/shop");
    }
}
