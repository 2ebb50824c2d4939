//! Request snooper: echoes what the server resolved for each request.
//!
//! ```text
//! RUST_LOG=servlette=debug cargo run --example snoop
//! curl -i http://127.0.0.1:8080/context/snoop/index.html
//! curl -i http://127.0.0.1:8080/context/broken
//! ```

use std::sync::Arc;
use std::time::Instant;

use servlette::application::ErrorPage;
use servlette::filter::{ERROR_REQUEST_URI, ERROR_STATUS_CODE};
use servlette::servlet::BoxFuture;
use servlette::{
    Application, ApplicationRegistry, Context, Filter, FilterChain, FilterMapping, Server,
    ServerConfig, Servlet, ServletError, ServletResult, servlet_fn,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Snoop;

impl Servlet for Snoop {
    fn service<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ServletResult> {
        Box::pin(async move {
            let visits = match ctx.session(true) {
                Some(session) => {
                    let seen = session.attribute("visits").and_then(|v| v.as_u64());
                    let visits = seen.unwrap_or(0) + 1;
                    session.set_attribute("visits", visits);
                    visits
                }
                None => 0,
            };

            let request = ctx.request();
            let mut page = String::new();
            page.push_str(&format!(
                "method:       {}\n",
                request.method().map(|m| m.as_str()).unwrap_or("-")
            ));
            page.push_str(&format!("request uri:  {}\n", request.request_uri()));
            page.push_str(&format!("context path: {}\n", request.context_path()));
            page.push_str(&format!("servlet path: {}\n", request.servlet_path()));
            page.push_str(&format!("path info:    {}\n", request.path_info().unwrap_or("-")));
            page.push_str(&format!("query:        {}\n", request.query_string().unwrap_or("-")));
            page.push_str(&format!("visits:       {visits}\n"));
            page.push_str("headers:\n");
            for (name, value) in request.headers().iter() {
                page.push_str(&format!("  {name}: {value}\n"));
            }

            let response = ctx.response_mut();
            response.set_header("Content-Type", "text/plain; charset=utf-8");
            response.write_str(&page)?;
            Ok(())
        })
    }
}

struct AccessLog;

impl Filter for AccessLog {
    fn do_filter<'a>(
        &'a self,
        ctx: &'a mut Context,
        chain: FilterChain,
    ) -> BoxFuture<'a, ServletResult> {
        Box::pin(async move {
            let started = Instant::now();
            let uri = ctx.request().request_uri().to_owned();
            let result = chain.do_filter(ctx).await;
            info!(
                %uri,
                status = ctx.response().status(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "access"
            );
            result
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("servlette=info,snoop=info")),
        )
        .init();

    let app = Application::builder("/context")
        .display_name("snoop")
        .servlet("snoop", Snoop, &["/snoop/*"])
        .servlet(
            "broken",
            servlet_fn(|_| {
                Err(ServletError::status_with_message(500, "this servlet always fails"))
            }),
            &["/broken"],
        )
        .servlet(
            "error",
            servlet_fn(|ctx| {
                let request = ctx.request();
                let status = request.attribute(ERROR_STATUS_CODE).cloned().unwrap_or_default();
                let uri = request.attribute(ERROR_REQUEST_URI).cloned().unwrap_or_default();
                ctx.response_mut()
                    .write_str(&format!("something went wrong ({status}) while serving {uri}\n"))?;
                Ok(())
            }),
            &["/error"],
        )
        .filter("access-log", AccessLog, [FilterMapping::url("/*")?])
        .error_page(ErrorPage::default_page("/error"))
        .build()?;

    let registry = Arc::new(ApplicationRegistry::new());
    registry.deploy(Arc::new(app))?;

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let handle = Server::new(config, Arc::clone(&registry)).start().await?;
    info!("try http://{}/context/snoop/index.html", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    handle.stop().await;
    registry.undeploy("/context")?;
    Ok(())
}
