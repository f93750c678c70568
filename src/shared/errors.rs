use thiserror::Error;

/// Failure taxonomy for the allocation core. Every variant is recovered
/// inside the orchestrators; none of them surface to the caller that
/// triggered the lead or visit event.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A filter stage legitimately emptied the candidate set.
    #[error("no eligible candidate after {stage} stage")]
    EmptyCandidatePool { stage: &'static str },

    /// An unexpected internal error inside a filter or selector stage.
    #[error("stage {stage} failed: {detail}")]
    StageExecutionFault { stage: &'static str, detail: String },

    /// A work item already exists for the incoming lead id.
    #[error("work item already exists for lead {leadid}")]
    DuplicateWorkItem { leadid: String },

    /// A conditional card update affected zero rows because a concurrent
    /// selection consumed the card first.
    #[error("card {card_id} was consumed concurrently")]
    CardConsumptionConflict { card_id: i64 },

    /// No rule matched at all, which the mandatory fallback rule should
    /// make impossible.
    #[error("no allocation rule matched (fallback rule missing?)")]
    RuleInvariantViolation,

    #[error("storage error: {0}")]
    Storage(#[from] diesel::result::Error),
}
