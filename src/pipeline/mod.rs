//! Staged promotion pipeline.
//!
//! A [`PipelineRun`] promotes one desired-state version through the
//! environments in order; the [`PromotionController`] drives runs, consults
//! the [`ApprovalGate`] and hands converged clusters to a [`DeliveryAgent`].

mod cancel;
mod controller;
mod gate;
mod run;

pub use cancel::CancellationFlag;
pub use controller::PromotionController;
pub use gate::{
    ApprovalDecision, ApprovalGate, ApprovalRequest, AutoApprovalGate, AutoApprovalPolicy,
    DeliveryAgent, GateResponse, LoggingDeliveryAgent, ManualApprovalGate,
};
pub use run::{
    DesiredState, FailureChain, PipelineEvent, PipelineRun, RunState, StageOutcome, StageRecord,
};
