//! Origin download, variant derivation and the background trigger.

pub mod origin;
pub mod processor;
pub mod trigger;
pub mod worker;

pub use origin::{FetchSettings, FetchedImage, HttpOriginFetcher, OriginFetcher};
pub use trigger::{FetchOverview, FetchState, FetchStatus, FetchTrigger};
pub use worker::{ArtworkCacheWorker, CacheOutcome};
