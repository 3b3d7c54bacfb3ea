mod engine;
mod fiscal;
mod snapshot;
mod types;

pub use engine::run_plan;
pub use fiscal::{DeclaredFiscalNeeds, FiscalEstimate, FiscalNeedsProvider};
pub use snapshot::{HouseholdSnapshot, normalize_snapshot};
pub use types::{
    AllocationContext, AllocationPlan, Bucket, DebtAction, FundedGoal, InvestmentStrategy,
    PlanStatus, SavingsStrategy, TaxDiagnosis, TaxFundingMode, TaxPriority, TaxReason,
    ThirdPillarStatus, TopupOrder, Transfer,
};
