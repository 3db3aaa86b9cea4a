// HTTP adapter: the server surface and the client-side sync target.

pub mod http_app;
pub mod http_target;
pub mod stream;

pub use http_app::create_router;
pub use http_target::{sync_db_with_url, HttpSyncTarget};
pub use stream::{StreamDocEntry, SyncStreamWriter, SYNC_STREAM_CONTENT_TYPE};
