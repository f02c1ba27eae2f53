//! Email polling pipeline.
//!
//! One run per mailbox per poll:
//! 1. Scheduler wakes and finds the mailboxes that are due
//! 2. Orchestrator authenticates, lists candidates, and walks each email
//! 3. Rules pick the template, the model extracts, processing corrects
//! 4. Dispatch delivers directly or hands off to the workflow engine

pub mod factory;
pub mod orchestrator;
pub mod rules;
pub mod scheduler;

pub use factory::{AdapterFactory, HttpAdapterFactory};
pub use orchestrator::{PollingPipeline, RunSummary};
pub use rules::match_rule;
pub use scheduler::spawn_polling_scheduler;
