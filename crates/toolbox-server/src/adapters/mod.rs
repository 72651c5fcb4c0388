//! Backend adapters: each one supplies a [`toolbox_core::Service`] that lives
//! in the shared cache.

pub mod elasticsearch;
pub mod ssh;

pub use elasticsearch::ElasticsearchService;
