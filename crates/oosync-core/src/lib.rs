//! Shared core for the oosync replication engine: schema registry, wire
//! protocol types, pull cursor codec, row normalization, and pull rules.

pub mod cursor;
pub mod error;
pub mod normalize;
pub mod protocol;
pub mod rules;
pub mod schema;

pub use cursor::{PullCursor, CURSOR_VERSION};
pub use error::CoreError;
pub use normalize::{normalize_timestamp, sanitize_booleans_to_int};
pub use protocol::{
    clamp_page_size, parse_row_id, ChangeRow, CollectionsOverride, GenreFilter, Op, SyncRequest,
    SyncResponse, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use rules::{CompoundOp, PullRule};
pub use schema::{PrimaryKey, SchemaRegistry, TableSchema};
