//! Volley core library: the channel-RPC load-generation engine shared by the
//! CLI and embedding callers.

#[path = "runtime/capture.rs"]
mod capture;
#[path = "platform/config.rs"]
mod config;
#[path = "runtime/connection.rs"]
mod connection;
#[path = "runtime/context.rs"]
mod context;
#[path = "runtime/correlate.rs"]
mod correlate;
#[path = "runtime/delegate.rs"]
mod delegate;
#[path = "platform/duration.rs"]
mod duration;
mod engine;
#[path = "platform/envinfo.rs"]
mod envinfo;
#[path = "platform/error.rs"]
mod error;
#[path = "model/reporting.rs"]
mod reporting;
#[path = "model/request.rs"]
mod request;
#[path = "runtime/respond.rs"]
mod respond;
#[path = "model/scenario.rs"]
mod scenario;
#[path = "runtime/template.rs"]
mod template;
#[path = "runtime/transport.rs"]
mod transport;

pub use capture::*;
pub use config::*;
pub use connection::*;
pub use context::*;
pub use correlate::*;
pub use delegate::*;
pub use duration::*;
pub use engine::*;
pub use envinfo::*;
pub use error::*;
pub use reporting::*;
pub use request::*;
pub use respond::*;
pub use scenario::*;
pub use template::*;
pub use transport::*;
