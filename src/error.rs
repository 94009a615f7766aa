//! Error type shared by the resolver pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DNS wire format error: {0}")]
    Wire(#[from] hickory_proto::ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DoH server {host} returned HTTP {status}")]
    DohStatus { host: String, status: u16 },

    #[error("DoH server {host} returned unexpected content type: {content_type}")]
    DohContentType { host: String, content_type: String },

    #[error("DoH server {0} sent a message that is not a response")]
    DohNotResponse(String),

    #[error("invalid upstream address: {0}")]
    InvalidUpstream(String),

    #[error("metric registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("failed to parse host list from {source_url}: {reason}")]
    ListParse { source_url: String, reason: String },
}
