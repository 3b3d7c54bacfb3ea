use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

const CENT_EPS: f64 = 1e-6;

pub fn round_money(value: f64) -> f64 {
    // the epsilon keeps values stored as 0.61499.. from truncating down
    ((value + 1e-9) * 100.0).round() / 100.0
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bucket {
    CurrentAccount,
    Security,
    Tax,
    RetirementPillar,
    ShortTermGoal,
    LongTermGoal,
    Investments,
    Debt,
}

impl Bucket {
    pub const ALL: [Bucket; 8] = [
        Bucket::CurrentAccount,
        Bucket::Security,
        Bucket::Tax,
        Bucket::RetirementPillar,
        Bucket::ShortTermGoal,
        Bucket::LongTermGoal,
        Bucket::Investments,
        Bucket::Debt,
    ];
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EmploymentStatus {
    Employee,
    SelfEmployed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SavingsStrategy {
    Prudent,
    Balanced,
    Aggressive,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InvestmentStrategy {
    Securite,
    Equilibre,
    Aggressif,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoanKind {
    Mortgage,
    Consumer,
    Leasing,
    Other,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaxFundingMode {
    Provision,
    PayLater,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaxPriority {
    Normal,
    High,
    Critical,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TopupOrder {
    CurrentThenSavings,
    SavingsThenCurrent,
}

#[derive(Debug, Clone)]
pub struct IncomeEntry {
    pub monthly_net: f64,
    pub status: EmploymentStatus,
    pub thirteenth_salary: bool,
    pub thirteenth_month: u32,
}

#[derive(Debug, Clone)]
pub struct LoanEntry {
    pub label: String,
    pub monthly_payment: f64,
    pub balance: f64,
    pub kind: LoanKind,
    pub interest_rate: f64,
}

#[derive(Debug, Clone)]
pub struct AssetBalances {
    pub payment_account: f64,
    pub security_savings: f64,
    pub tax_provision: f64,
    pub pillar_balance: f64,
    pub pillar_contributed_ytd: f64,
    pub pillar_ytd_year: i32,
}

#[derive(Debug, Clone)]
pub struct GoalPlan {
    pub label: String,
    pub target_amount: f64,
    pub horizon_years: f64,
}

#[derive(Debug, Clone)]
pub struct LongTermGoal {
    pub kind: String,
    pub target_amount: f64,
    pub horizon_years: f64,
}

#[derive(Debug, Clone)]
pub struct TaxSettings {
    pub mode: TaxFundingMode,
    pub priority: TaxPriority,
    pub surplus_share_cap: f64,
    pub urgent_surplus_share_cap: f64,
    pub hard_monthly_ceiling: Option<f64>,
    pub allow_balance_topups: bool,
    pub topup_order: TopupOrder,
    pub affordable_monthly_rate: f64,
    pub deadline: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub savings: SavingsStrategy,
    pub investment: InvestmentStrategy,
    pub min_current_account_months: f64,
    pub precaution_income_months: f64,
    pub invest_max_surplus_share: f64,
    pub tax: TaxSettings,
}

#[derive(Debug, Clone)]
pub struct AdvancedOverrides {
    pub skip_current_month: bool,
    pub force_recompute: bool,
    pub monthly_investment_cap: Option<f64>,
}

// every monetary field is a non-negative monthly equivalent
#[derive(Debug, Clone)]
pub struct AllocationContext {
    pub reference_date: NaiveDate,
    pub incomes: Vec<IncomeEntry>,
    pub fixed_expenses: f64,
    pub variable_expenses: f64,
    pub exceptional_expenses: f64,
    pub leisure_budget: f64,
    pub loans: Vec<LoanEntry>,
    pub assets: AssetBalances,
    pub short_term_goal: Option<GoalPlan>,
    pub long_term_goal: Option<LongTermGoal>,
    pub strategy: StrategySettings,
    pub overrides: AdvancedOverrides,
    pub monthly_available_override: Option<f64>,
    pub declared_annual_tax: f64,
}

impl AllocationContext {
    pub fn monthly_net_income(&self) -> f64 {
        // a 13th salary counts in full, but only in its payout month
        let month = self.reference_date.month();
        self.incomes
            .iter()
            .map(|entry| {
                let extra = if entry.thirteenth_salary && entry.thirteenth_month == month {
                    entry.monthly_net
                } else {
                    0.0
                };
                entry.monthly_net + extra
            })
            .sum()
    }

    pub fn reference_monthly_income(&self) -> f64 {
        // annualized: a 13th salary counts at one twelfth
        self.incomes
            .iter()
            .map(|entry| {
                if entry.thirteenth_salary {
                    entry.monthly_net * 13.0 / 12.0
                } else {
                    entry.monthly_net
                }
            })
            .sum()
    }

    pub fn debt_service(&self) -> f64 {
        self.loans.iter().map(|loan| loan.monthly_payment).sum()
    }

    pub fn current_account_target(&self) -> f64 {
        self.variable_expenses * self.strategy.min_current_account_months
    }

    pub fn savings_target(&self) -> f64 {
        self.reference_monthly_income() * self.strategy.precaution_income_months
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxReason {
    NoTax,
    AlreadyFunded,
    PayLaterMode,
    NoCapacity,
    UrgentCappedByHardLimit,
    CappedByHardLimit,
    UrgentCappedByRestePct,
    CappedByRestePct,
    PartialFunding,
    UrgentOnTrack,
    OnTrack,
    UrgentOnTrackWithBalanceTopup,
    OnTrackWithBalanceTopup,
    OnTrackWithPreemptiveTopup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxDiagnosis {
    pub reason: TaxReason,
    pub monthly_need: f64,
    pub monthly_target: f64,
    pub transferred: f64,
    pub shortfall: f64,
    pub gap_to_need: f64,
    pub months_remaining: u32,
    pub pressure: f64,
    pub topup_from_current: f64,
    pub topup_from_savings: f64,
    pub topup_eligible_current: f64,
    pub topup_eligible_savings: f64,
    pub preemptive_topup: f64,
}

impl Default for TaxDiagnosis {
    fn default() -> Self {
        TaxDiagnosis {
            reason: TaxReason::NoTax,
            monthly_need: 0.0,
            monthly_target: 0.0,
            transferred: 0.0,
            shortfall: 0.0,
            gap_to_need: 0.0,
            months_remaining: 0,
            pressure: 0.0,
            topup_from_current: 0.0,
            topup_from_savings: 0.0,
            topup_eligible_current: 0.0,
            topup_eligible_savings: 0.0,
            preemptive_topup: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThirdPillarStatus {
    pub annual_cap: f64,
    pub contributed_ytd: f64,
    pub contributed_this_run: f64,
    pub cap_reached: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub bucket: Bucket,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundedGoal {
    pub label: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtAction {
    pub label: String,
    pub amount: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Completed,
    SkipCurrentMonth,
    TaxBlocked,
}

// balances mirror the snapshot and move in lock-step with every credit
#[derive(Debug)]
pub struct AllocationState {
    pub surplus: f64,
    pub initial_surplus: f64,
    pub account_balance: f64,
    pub security_balance: f64,
    pub tax_balance: f64,
    pub pillar_contributed: f64,
    pub pillar_cap_reached: bool,
    pub allocations: BTreeMap<Bucket, f64>,
    pub transfers: Vec<Transfer>,
    pub funded_goals: Vec<FundedGoal>,
}

impl AllocationState {
    pub fn new(surplus: f64, assets: &AssetBalances) -> Self {
        AllocationState {
            surplus,
            initial_surplus: surplus,
            account_balance: assets.payment_account,
            security_balance: assets.security_savings,
            tax_balance: assets.tax_provision,
            pillar_contributed: 0.0,
            pillar_cap_reached: false,
            allocations: zeroed_bucket_map(),
            transfers: Vec::new(),
            funded_goals: Vec::new(),
        }
    }

    pub fn credit(&mut self, bucket: Bucket, amount: f64) -> f64 {
        let mut moved = round_money(amount.max(0.0).min(self.surplus));
        if moved > self.surplus + CENT_EPS {
            // rounding up would overdraw; truncate to whole cents instead
            moved = (self.surplus * 100.0).floor() / 100.0;
        }
        if moved <= 0.0 {
            return 0.0;
        }

        self.surplus -= moved;
        *self.allocations.entry(bucket).or_insert(0.0) += moved;
        self.transfers.push(Transfer {
            bucket,
            amount: moved,
        });

        match bucket {
            Bucket::CurrentAccount => self.account_balance += moved,
            Bucket::Security => self.security_balance += moved,
            Bucket::Tax => self.tax_balance += moved,
            Bucket::RetirementPillar => self.pillar_contributed += moved,
            _ => {}
        }

        moved
    }
}

pub fn zeroed_bucket_map() -> BTreeMap<Bucket, f64> {
    Bucket::ALL.iter().map(|bucket| (*bucket, 0.0)).collect()
}

// `allocations` carries the full bucket vocabulary, zero-filled
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationPlan {
    pub status: PlanStatus,
    pub initial_available: f64,
    pub allocations: BTreeMap<Bucket, f64>,
    pub transfers: Vec<Transfer>,
    pub funded_goals: Vec<FundedGoal>,
    pub debt_actions: Vec<DebtAction>,
    pub unallocated: f64,
    pub tax: TaxDiagnosis,
    pub pillar: ThirdPillarStatus,
}
