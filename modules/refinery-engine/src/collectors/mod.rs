//! Source-specific normalizers: everything that turns an external event
//! into an [`refinery_common::IngestRecord`].

pub mod feed;
pub mod media;
pub mod webhook;

pub use feed::FeedPoller;
pub use media::MediaCollector;
pub use webhook::WebhookPayload;
