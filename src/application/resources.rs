//! Static resource lookup, one of the narrow capabilities an application can carry.

use std::collections::HashMap;

use bytes::Bytes;

use crate::context::Context;
use crate::servlet::{BoxFuture, Servlet, ServletError, ServletResult};

/// A resolved static resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub content_type: String,
    pub body: Bytes,
}

/// Resolves context-relative paths to static content.
pub trait ResourceLookup: Send + Sync {
    fn lookup(&self, path: &str) -> Option<Resource>;
}

/// Resources held in memory, keyed by context-relative path.
#[derive(Debug, Clone, Default)]
pub struct MemoryResources {
    entries: HashMap<String, Resource>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(
        mut self,
        path: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        self.entries.insert(
            path.into(),
            Resource {
                content_type: content_type.into(),
                body: body.into(),
            },
        );
        self
    }
}

impl ResourceLookup for MemoryResources {
    fn lookup(&self, path: &str) -> Option<Resource> {
        self.entries.get(path).cloned()
    }
}

/// Serves the application's resources by context-relative path; `404` when absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceServlet;

impl Servlet for ResourceServlet {
    fn service<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ServletResult> {
        let path = {
            let req = ctx.request();
            format!("{}{}", req.servlet_path(), req.path_info().unwrap_or_default())
        };
        let found = ctx
            .application()
            .and_then(|app| app.resources())
            .and_then(|resources| resources.lookup(&path));
        let result = match found {
            Some(resource) => {
                let response = ctx.response_mut();
                response.set_header("Content-Type", resource.content_type);
                response.set_header("Content-Length", resource.body.len().to_string());
                response.write(&resource.body).map_err(ServletError::from)
            }
            None => Err(ServletError::status(404)),
        };
        Box::pin(std::future::ready(result))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::application::Application;

    fn app() -> Arc<Application> {
        let resources = MemoryResources::new()
            .with("/static/site.css", "text/css", "body{}")
            .with("/static/index.html", "text/html; charset=utf-8", "<h1>hi</h1>");
        Application::builder("/ctx")
            .resources(resources)
            .servlet("static", ResourceServlet, &["/static/*"])
            .build()
            .map(Arc::new)
            .unwrap()
    }

    async fn serve(app: &Arc<Application>, path_info: &str) -> (Context, ServletResult) {
        let mut ctx = Context::detached(&format!("GET /ctx/static{path_info} HTTP/1.1"));
        ctx.set_application(Arc::clone(app));
        ctx.request_mut()
            .set_servlet_paths("/static".to_owned(), Some(path_info.to_owned()));
        let result = ResourceServlet.service(&mut ctx).await;
        (ctx, result)
    }

    #[test]
    fn lookup_is_exact() {
        let resources = MemoryResources::new().with("/a.txt", "text/plain", "a");
        assert_eq!(resources.lookup("/a.txt").map(|r| r.body), Some(Bytes::from_static(b"a")));
        assert!(resources.lookup("/A.txt").is_none());
        assert!(resources.lookup("/a.txt/").is_none());
    }

    #[tokio::test]
    async fn hit_writes_body_with_its_content_type() {
        let app = app();
        let (ctx, result) = serve(&app, "/site.css").await;
        result.unwrap();
        assert_eq!(ctx.response().headers().get("content-type"), Some("text/css"));
        assert_eq!(ctx.response().headers().get("content-length"), Some("6"));
        assert_eq!(ctx.response().pending_body(), b"body{}");

        let (ctx, result) = serve(&app, "/index.html").await;
        result.unwrap();
        assert_eq!(
            ctx.response().headers().get("content-type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(ctx.response().pending_body(), b"<h1>hi</h1>");
    }

    #[tokio::test]
    async fn miss_is_not_found() {
        let app = app();
        let (ctx, result) = serve(&app, "/missing.js").await;
        assert_eq!(result.unwrap_err().status_code(), 404);
        assert!(ctx.response().pending_body().is_empty());
    }

    #[tokio::test]
    async fn application_without_resources_is_not_found() {
        let app = Application::builder("/ctx")
            .servlet("static", ResourceServlet, &["/static/*"])
            .build()
            .map(Arc::new)
            .unwrap();
        let (_, result) = serve(&app, "/site.css").await;
        assert_eq!(result.unwrap_err().status_code(), 404);
    }
}
