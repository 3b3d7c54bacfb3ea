use chrono::{Datelike, NaiveDate};

use super::types::{
    AllocationContext, AllocationState, Bucket, TaxDiagnosis, TaxFundingMode, TaxPriority,
    TaxReason, TopupOrder, round_money,
};

pub const FULFILLED_EPS: f64 = 0.005;

const DEFAULT_URGENT_MONTHS: u32 = 2;
const SOFT_URGENCY_EXTRA_MONTHS: u32 = 2;
const PRESSURE_TRIGGER: f64 = 0.5;
const SAVINGS_TOPUP_FLOOR_SHARE: f64 = 0.5;

pub trait FiscalNeedsProvider {
    fn fiscal_needs(&self, ctx: &AllocationContext) -> FiscalEstimate;
}

#[derive(Debug, Clone, Default)]
pub struct FiscalEstimate {
    pub annual_liability: f64,
    pub already_provisioned: f64,
    pub deadline: Option<NaiveDate>,
    pub monthly_need_override: Option<f64>,
    pub months_remaining_override: Option<u32>,
    pub remaining_override: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredFiscalNeeds;

impl FiscalNeedsProvider for DeclaredFiscalNeeds {
    fn fiscal_needs(&self, ctx: &AllocationContext) -> FiscalEstimate {
        FiscalEstimate {
            annual_liability: ctx.declared_annual_tax,
            already_provisioned: ctx.assets.tax_provision,
            deadline: ctx.strategy.tax.deadline,
            monthly_need_override: None,
            months_remaining_override: None,
            remaining_override: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StageOutcome {
    Continue,
    // nothing at all can move; the caller skips every later stage this month
    Blocked,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TopupSource {
    Current,
    Savings,
}

pub fn run_tax_stage(
    ctx: &AllocationContext,
    estimate: &FiscalEstimate,
    state: &mut AllocationState,
) -> (TaxDiagnosis, StageOutcome) {
    let settings = &ctx.strategy.tax;
    let mut diagnosis = TaxDiagnosis::default();

    let liability = estimate.annual_liability.max(0.0);
    if liability <= 0.0 {
        return (diagnosis, StageOutcome::Continue);
    }

    let remaining = estimate
        .remaining_override
        .unwrap_or(liability - estimate.already_provisioned)
        .max(0.0);
    if remaining <= FULFILLED_EPS {
        diagnosis.reason = TaxReason::AlreadyFunded;
        return (diagnosis, StageOutcome::Continue);
    }

    let months_remaining = estimate
        .months_remaining_override
        .unwrap_or_else(|| {
            let deadline = estimate
                .deadline
                .or(settings.deadline)
                .unwrap_or_else(|| year_end(ctx.reference_date));
            months_until_deadline(ctx.reference_date, deadline)
        })
        .max(1);

    let monthly_need = round_money(
        estimate
            .monthly_need_override
            .unwrap_or(remaining / months_remaining as f64)
            .clamp(0.0, remaining),
    );
    diagnosis.monthly_need = monthly_need;
    diagnosis.months_remaining = months_remaining;

    let surplus = state.surplus;
    diagnosis.pressure = if monthly_need <= 0.0 {
        0.0
    } else if surplus <= f64::EPSILON {
        1.0
    } else {
        (monthly_need / surplus).min(1.0)
    };

    if settings.mode == TaxFundingMode::PayLater {
        diagnosis.reason = TaxReason::PayLaterMode;
        diagnosis.shortfall = monthly_need;
        diagnosis.gap_to_need = monthly_need;
        return (diagnosis, StageOutcome::Continue);
    }

    // Hard urgency depends on the calendar alone. Pressure only widens the
    // soft band, which gates the pre-emptive top-up below.
    let urgent_months = urgent_threshold(settings.priority);
    let urgent = months_remaining <= urgent_months;
    let soft_urgent = !urgent
        && (months_remaining <= urgent_months + SOFT_URGENCY_EXTRA_MONTHS
            || diagnosis.pressure >= PRESSURE_TRIGGER);

    let share = if urgent {
        settings.urgent_surplus_share_cap
    } else {
        settings.surplus_share_cap
    };
    let mut desired = monthly_need.min(round_money(surplus * share));
    let pct_capped = desired + FULFILLED_EPS < monthly_need;
    let mut hard_capped = false;
    if let Some(ceiling) = settings.hard_monthly_ceiling {
        let ceiling = ceiling.max(0.0);
        if desired > ceiling {
            desired = ceiling;
            hard_capped = true;
        }
    }
    diagnosis.monthly_target = round_money(desired);
    diagnosis.gap_to_need = round_money((monthly_need - desired).max(0.0));

    if desired <= 0.0 {
        diagnosis.reason = TaxReason::NoCapacity;
        diagnosis.shortfall = monthly_need;
        return (diagnosis, StageOutcome::Blocked);
    }

    diagnosis.transferred = state.credit(Bucket::Tax, desired);
    let mut outstanding = (monthly_need - diagnosis.transferred).max(0.0);

    if settings.allow_balance_topups {
        diagnosis.topup_eligible_current =
            round_money((state.account_balance - ctx.current_account_target()).max(0.0));
        diagnosis.topup_eligible_savings = round_money(
            (state.security_balance - ctx.savings_target() * SAVINGS_TOPUP_FLOOR_SHARE).max(0.0),
        );

        if outstanding > FULFILLED_EPS {
            let (from_current, from_savings) =
                source_from_balances(ctx, state, outstanding, settings.topup_order);
            diagnosis.topup_from_current = from_current;
            diagnosis.topup_from_savings = from_savings;
            outstanding = (outstanding - from_current - from_savings).max(0.0);
        }

        // The month itself is covered, but the run rate until the deadline is
        // not: pull the projected shortfall forward while balances allow it.
        if soft_urgent && outstanding <= FULFILLED_EPS {
            let funded_now = diagnosis.transferred
                + diagnosis.topup_from_current
                + diagnosis.topup_from_savings;
            let affordable_future = settings.affordable_monthly_rate
                * state.initial_surplus
                * months_remaining.saturating_sub(1) as f64;
            let projected_shortfall = (remaining - funded_now - affordable_future).max(0.0);
            if projected_shortfall > FULFILLED_EPS {
                let (from_current, from_savings) =
                    source_from_balances(ctx, state, projected_shortfall, settings.topup_order);
                diagnosis.preemptive_topup = round_money(from_current + from_savings);
                diagnosis.topup_from_current =
                    round_money(diagnosis.topup_from_current + from_current);
                diagnosis.topup_from_savings =
                    round_money(diagnosis.topup_from_savings + from_savings);
            }
        }
    }

    diagnosis.shortfall = round_money(outstanding);
    let need_met = outstanding <= FULFILLED_EPS;
    let topped_up = diagnosis.topup_from_current + diagnosis.topup_from_savings > 0.0;

    diagnosis.reason = if need_met {
        if diagnosis.preemptive_topup > 0.0 {
            TaxReason::OnTrackWithPreemptiveTopup
        } else if topped_up {
            if urgent {
                TaxReason::UrgentOnTrackWithBalanceTopup
            } else {
                TaxReason::OnTrackWithBalanceTopup
            }
        } else if urgent {
            TaxReason::UrgentOnTrack
        } else {
            TaxReason::OnTrack
        }
    } else if topped_up {
        TaxReason::PartialFunding
    } else if hard_capped {
        if urgent {
            TaxReason::UrgentCappedByHardLimit
        } else {
            TaxReason::CappedByHardLimit
        }
    } else if pct_capped {
        if urgent {
            TaxReason::UrgentCappedByRestePct
        } else {
            TaxReason::CappedByRestePct
        }
    } else {
        TaxReason::PartialFunding
    };

    (diagnosis, StageOutcome::Continue)
}

pub fn tax_need_settled(diagnosis: &TaxDiagnosis) -> bool {
    // a deferred month keeps its shortfall on record but still counts as settled
    diagnosis.reason == TaxReason::PayLaterMode || diagnosis.shortfall <= FULFILLED_EPS
}

fn source_from_balances(
    ctx: &AllocationContext,
    state: &mut AllocationState,
    needed: f64,
    order: TopupOrder,
) -> (f64, f64) {
    let mut from_current = 0.0;
    let mut from_savings = 0.0;
    let mut left = needed;

    let sequence: [TopupSource; 2] = match order {
        TopupOrder::CurrentThenSavings => [TopupSource::Current, TopupSource::Savings],
        TopupOrder::SavingsThenCurrent => [TopupSource::Savings, TopupSource::Current],
    };

    for source in sequence {
        if left <= FULFILLED_EPS {
            break;
        }
        match source {
            TopupSource::Current => {
                let floor = ctx.current_account_target();
                let available = (state.account_balance - floor).max(0.0);
                let take = round_money(left.min(available));
                if take > 0.0 {
                    state.account_balance -= take;
                    state.tax_balance += take;
                    from_current += take;
                    left -= take;
                }
            }
            TopupSource::Savings => {
                let floor = ctx.savings_target() * SAVINGS_TOPUP_FLOOR_SHARE;
                let available = (state.security_balance - floor).max(0.0);
                let take = round_money(left.min(available));
                if take > 0.0 {
                    state.security_balance -= take;
                    state.tax_balance += take;
                    from_savings += take;
                    left -= take;
                }
            }
        }
    }

    (from_current, from_savings)
}

fn urgent_threshold(priority: TaxPriority) -> u32 {
    match priority {
        TaxPriority::Normal => DEFAULT_URGENT_MONTHS,
        TaxPriority::High => DEFAULT_URGENT_MONTHS + 1,
        TaxPriority::Critical => DEFAULT_URGENT_MONTHS + 2,
    }
}

fn year_end(reference: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(reference.year(), 12, 31).unwrap_or(reference)
}

// floored at 1: a passed deadline still demands the full remainder now
fn months_until_deadline(reference: NaiveDate, deadline: NaiveDate) -> u32 {
    let span = (deadline.year() - reference.year()) * 12 + deadline.month() as i32
        - reference.month() as i32;
    span.max(1) as u32
}
