pub mod config;
pub mod error;
pub mod db;
pub mod index;
pub mod jobs;
pub mod query;
pub mod server;
pub mod watch;

pub use config::Config;
pub use error::{CallIndexError, Result};
pub use jobs::{run_trigger, IndexContext, TriggerReport, TriggerRequest};
pub use query::{search_recordings, RecordingPage, RecordingQuery};
