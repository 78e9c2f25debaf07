//! Shared constants for end-to-end tests
//!
//! Step, action and role names match the workflow in [`WORKFLOWS_TOML`].

// ============================================================================
// Collections
// ============================================================================

pub const COLLECTION_X: &str = "x";
pub const COLLECTION_Y: &str = "y";

/// Not mapped explicitly, routed through the default workflow.
pub const COLLECTION_UNMAPPED: &str = "unmapped";

// ============================================================================
// Roles and steps
// ============================================================================

pub const REVIEWER: &str = "reviewer";
pub const EDITOR: &str = "editor";
pub const FINAL_EDITOR: &str = "finaleditor";

pub const STEP_1: &str = "reviewstep";
pub const STEP_2: &str = "editstep";
pub const STEP_3: &str = "finaleditstep";

// ============================================================================
// Actions
// ============================================================================

pub const CLAIM: &str = "claim";
pub const UNCLAIM: &str = "unclaim";
pub const APPROVE: &str = "approve";
pub const REJECT: &str = "reject";
pub const SEND_BACK: &str = "sendback";

/// Three review steps, each serviced by its own role.
pub const WORKFLOWS_TOML: &str = r#"
[[workflow]]
id = "default"
roles = ["reviewer", "editor", "finaleditor"]

  [[workflow.step]]
  id = "reviewstep"
  role = "reviewer"
  actions = [
    { id = "claim", kind = "claim" },
    { id = "unclaim", kind = "release" },
    { id = "approve", kind = "complete" },
    { id = "reject", kind = "complete", outcome = "return_to_submitter" },
  ]

  [[workflow.step]]
  id = "editstep"
  role = "editor"
  actions = [
    { id = "claim", kind = "claim" },
    { id = "unclaim", kind = "release" },
    { id = "approve", kind = "complete" },
    { id = "sendback", kind = "complete", outcome = "return_to", target = "reviewstep" },
  ]

  [[workflow.step]]
  id = "finaleditstep"
  role = "finaleditor"
  actions = [
    { id = "claim", kind = "claim" },
    { id = "unclaim", kind = "release" },
    { id = "approve", kind = "complete" },
    { id = "sendback", kind = "complete", outcome = "return_to", target = "editstep" },
  ]

[[collection]]
id = "x"
workflow = "default"

[[collection]]
id = "y"
workflow = "default"
"#;
