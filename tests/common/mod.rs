//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestEngine, COLLECTION_X, REVIEWER, STEP_1};
//!
//! #[test]
//! fn test_claim() {
//!     let env = TestEngine::spawn();
//!     let alice = env.identity("alice");
//!     env.join(COLLECTION_X, REVIEWER, alice);
//!     let item = env.submit(COLLECTION_X);
//!     env.claim_and_approve(item, alice, STEP_1);
//! }
//! ```

#![allow(dead_code)]

mod constants;
mod fixtures;

pub use constants::*;
#[allow(unused_imports)]
pub use fixtures::{create_cli_workspace, role, TestEngine};
