//! Collaborators called by the results-export steps, with in-memory
//! implementations.

pub mod file_generator;
pub mod notifier;

pub use file_generator::{FileGenerator, GeneratedFile, InMemoryFileGenerator};
pub use notifier::{DownstreamNotifier, InMemoryDownstreamNotifier};
