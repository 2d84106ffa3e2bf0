/// Shutterhub - event photo marketplace coordination
///
/// Coordinates uploaded event photos with face-match processing: the match
/// queue, operator verification of detected candidates, notification
/// fan-out and realtime views over the record store's change feed.

pub mod api;
pub mod chat;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod matching;
pub mod metrics;
pub mod notify;
pub mod object_store;
pub mod photos;
pub mod realtime;
pub mod server;
pub mod store;
pub mod upload;

pub use context::AppContext;
pub use error::{HubError, HubResult};
