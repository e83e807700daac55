pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod feed;
pub mod identity;
pub mod issue;
pub mod mr;
pub mod names;
pub mod schedmeta;
pub mod workspace;

pub use errors::GtError;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
