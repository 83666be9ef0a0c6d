//! Fakes and fixtures shared by the Strata test suites.

pub mod fixtures;
mod logs;
mod store;
mod strategy;

pub use logs::LogCapture;
pub use store::{FailingBranchStore, InMemoryStore};
pub use strategy::{ScriptedModel, ScriptedStrategy};
