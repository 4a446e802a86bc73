pub mod step;
pub mod summary;

pub use step::{Backoff, RetryPolicy, StepError, StepRunner};
pub use summary::{ConversationGateway, RunReport, SummaryWorkflow, WorkflowError};
