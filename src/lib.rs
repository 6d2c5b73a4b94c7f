//! `sixcore`: the runtime engine underneath an embeddable HTTP
//! application server — cache, DNS resolution, MIME/encoding registry,
//! a socket-callback reactor, form/query parsing, the HTTP/1.x response
//! pipeline, a connection pool, server lifecycle management, a URL
//! parser, log-file rotation, and shared variables.

pub mod cache;
pub mod collections;
pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod form;
pub mod logging;
pub mod mime;
pub mod pool;
pub mod reactor;
pub mod response;
pub mod rotation;
pub mod server;
pub mod sharedvar;
pub mod url_parse;

pub use error::{CoreError, CoreResult};
