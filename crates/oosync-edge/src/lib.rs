//! Edge half of the oosync replication engine: a stateless HTTPS handler
//! that authenticates a client, applies its pushed changes inside one
//! transaction, and answers with a page of remote changes: incremental
//! when the client has a watermark, cursor-paginated otherwise.

pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod pg;
pub mod pull;
pub mod push;
pub mod rules;

pub use config::{CollectionDef, EdgeConfig, JwtVerifier, SanitizeRules, TableRules};
pub use error::{EdgeError, Result};
pub use handler::{router, AppState};
