//! Harvest enrich crate - image discovery and object-detection enrichment.
//!
//! The coordinator runs a vision model over downloaded images and appends
//! one detection row per detected object. A failing image is counted and
//! logged without affecting the others.

pub mod coordinator;
pub mod media;

pub use coordinator::{EnrichSummary, EnrichmentCoordinator, ItemError, ItemOutcome};
pub use media::{MediaListing, MediaStore};
