//! # servlette
//!
//! An embeddable async HTTP/1.x server with servlet-style applications.
//!
//! Applications are deployed under a context path and own their servlets,
//! filters, error pages and sessions. Each connection carries one request:
//! it is parsed, routed to an application and then to a servlet through the
//! matching filters, answered, and closed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use servlette::{Application, ApplicationRegistry, Server, ServerConfig, servlet_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(ApplicationRegistry::new());
//!     let app = Application::builder("/hello")
//!         .servlet(
//!             "greeter",
//!             servlet_fn(|ctx| {
//!                 let who = ctx.request().path_info().unwrap_or("/world").to_owned();
//!                 ctx.response_mut().write_str(&format!("Hello, {}!", &who[1..]))?;
//!                 Ok(())
//!             }),
//!             &["/*"],
//!         )
//!         .build()?;
//!     registry.deploy(Arc::new(app))?;
//!
//!     let handle = Server::new(ServerConfig::default(), registry).start().await?;
//!     println!("Listening on http://{}/hello", handle.local_addr());
//!     handle.stop().await;
//!     Ok(())
//! }
//! ```

pub mod application;
pub mod config;
pub mod context;
pub mod filter;
pub mod http;
pub mod router;
pub mod security;
pub mod server;
pub mod servlet;
pub mod session;

pub use application::{Application, ApplicationBuilder, ApplicationError};
pub use config::{ConfigError, ServerConfig};
pub use context::{AsyncContext, Context};
pub use filter::{DispatcherType, Filter, FilterChain, FilterMapping};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::{ApplicationRegistry, RegistryError, Router};
pub use server::{Server, ServerError, ServerHandle};
pub use servlet::{Servlet, ServletError, ServletResult, servlet_fn};
pub use session::{SessionHandle, SessionManager};
