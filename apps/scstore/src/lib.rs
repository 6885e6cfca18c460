//! # scstore
//!
//! Command-line front end for the scstore graph store.
//!
//! ## Usage
//!
//! ```bash
//! # Create a repository
//! scstore --repo ./kb init
//!
//! # Load a JSON graph description and inspect it
//! scstore --repo ./kb import -f graph.json
//! scstore --repo ./kb stats
//! scstore --repo ./kb find --content apple
//! scstore --repo ./kb arcs --seg 0 --offset 1
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod import;

pub use config::AppConfig;
pub use error::AppError;
pub use import::{GraphDocument, ImportReport, import_graph};
