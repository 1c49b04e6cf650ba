// Column Automation Engine
//
// Reacts to card column transitions and dwell time with ordered chains of
// side-effecting actions. Execution is exactly-once per qualifying transition
// via the execution ledger, with partial-failure isolation between actions
// and between automations.

pub mod actions;
pub mod engine;
pub mod executor;
pub mod ledger;
pub mod resolver;
pub mod triggers;

pub use actions::{batch_is_clean, ActionKind, ActionResult, AutomationAction};
pub use engine::{fetch_card, Automation, AutomationEngine};
pub use executor::{idempotency_key, render_template, ActionError};
pub use ledger::ExecutionLedger;
pub use resolver::{CardContext, ConnectionMode, EntityResolver};
pub use triggers::{
    classify_transition, AutomationTrigger, DurationUnit, TransitionKind, TriggerKind,
};
