pub mod engine;
pub mod store;

pub use engine::{delete_cascade, DedupEngine, DedupReport};
pub use store::{list_artifacts, DedupStore, Seed, SeedKind};
