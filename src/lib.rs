pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod homography;
pub mod knn;
pub mod ledger;
pub mod location;
pub mod matcher;
pub mod recogniser;
pub mod rootsift;
pub mod store;
pub mod utils;
pub mod verify;

pub use config::Opts;
pub use error::PipelineError;
pub use location::LocationTag;
pub use recogniser::{Locator, Recogniser};
pub use store::{IndexRecord, IndexStore, save_features};
