use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use serde_json::Value;

use super::types::{
    AdvancedOverrides, AllocationContext, AssetBalances, EmploymentStatus, GoalPlan, IncomeEntry,
    InvestmentStrategy, LoanEntry, LoanKind, LongTermGoal, SavingsStrategy, StrategySettings,
    TaxFundingMode, TaxPriority, TaxSettings, TopupOrder,
};

// loose persisted form: every field optional, amounts as numbers or strings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HouseholdSnapshot {
    #[serde(alias = "revenus", alias = "incomeEntries")]
    pub incomes: Vec<IncomeRecord>,
    #[serde(alias = "depenses", alias = "expenseEntries")]
    pub expenses: Vec<ExpenseRecord>,
    #[serde(alias = "credits", alias = "loanEntries")]
    pub loans: Vec<LoanRecord>,
    #[serde(alias = "comptes", alias = "balances")]
    pub accounts: AccountRecord,
    #[serde(alias = "objectifCourtTerme", alias = "shortGoal")]
    pub short_term_goal: GoalRecord,
    #[serde(alias = "objectifLongTerme", alias = "longGoal")]
    pub long_term_goal: LongGoalRecord,
    #[serde(alias = "loisirs", alias = "lifestyleBudget")]
    pub leisure_budget: Option<Value>,
    #[serde(alias = "strategie")]
    pub strategy: StrategyRecord,
    #[serde(alias = "impots", alias = "taxSettings")]
    pub tax: TaxRecord,
    #[serde(alias = "options", alias = "overrides")]
    pub advanced: AdvancedRecord,
    #[serde(alias = "montantDisponible", alias = "disposableOverride")]
    pub monthly_available: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IncomeRecord {
    #[serde(alias = "name", alias = "libelle")]
    pub label: Option<String>,
    #[serde(alias = "montant", alias = "value")]
    pub amount: Option<Value>,
    #[serde(alias = "frequence", alias = "periodicity")]
    pub frequency: Option<String>,
    #[serde(alias = "basis", alias = "brutNet")]
    pub amount_kind: Option<String>,
    #[serde(alias = "statut", alias = "employment")]
    pub status: Option<String>,
    #[serde(alias = "treizieme", alias = "has13thSalary")]
    pub thirteenth_salary: Option<Value>,
    #[serde(alias = "moisTreizieme", alias = "month13")]
    pub thirteenth_month: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExpenseRecord {
    #[serde(alias = "name", alias = "libelle")]
    pub label: Option<String>,
    #[serde(alias = "montant", alias = "value")]
    pub amount: Option<Value>,
    #[serde(alias = "frequence", alias = "periodicity")]
    pub frequency: Option<String>,
    #[serde(alias = "group", alias = "categorie", alias = "type")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoanRecord {
    #[serde(alias = "name", alias = "libelle")]
    pub label: Option<String>,
    #[serde(alias = "mensualite", alias = "payment")]
    pub monthly_payment: Option<Value>,
    #[serde(alias = "solde", alias = "outstanding")]
    pub balance: Option<Value>,
    #[serde(alias = "type", alias = "categorie")]
    pub kind: Option<String>,
    #[serde(alias = "taux", alias = "rate")]
    pub interest_rate: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccountRecord {
    #[serde(alias = "compteCourant", alias = "checking", alias = "payment")]
    pub current: Option<Value>,
    #[serde(alias = "epargneSecurite", alias = "savings", alias = "epargne")]
    pub security_savings: Option<Value>,
    #[serde(alias = "provisionImpots", alias = "taxReserve")]
    pub tax_provision: Option<Value>,
    #[serde(alias = "troisiemePilier", alias = "pillar3a")]
    pub pillar_balance: Option<Value>,
    #[serde(alias = "versementsPilierAnnee", alias = "pillarYearToDate")]
    pub pillar_contributed_ytd: Option<Value>,
    #[serde(alias = "anneePilier", alias = "pillarYear")]
    pub pillar_ytd_year: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GoalRecord {
    #[serde(alias = "actif", alias = "active")]
    pub enabled: Option<Value>,
    #[serde(alias = "name", alias = "libelle")]
    pub label: Option<String>,
    #[serde(alias = "objectif", alias = "targetAmount")]
    pub target: Option<Value>,
    #[serde(alias = "horizon", alias = "dureeAnnees")]
    pub horizon_years: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LongGoalRecord {
    #[serde(alias = "type", alias = "categorie")]
    pub kind: Option<String>,
    #[serde(alias = "objectif", alias = "targetAmount")]
    pub target: Option<Value>,
    #[serde(alias = "horizon", alias = "dureeAnnees")]
    pub horizon_years: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StrategyRecord {
    #[serde(alias = "epargne", alias = "savingsProfile")]
    pub savings_strategy: Option<String>,
    #[serde(alias = "investissement", alias = "investmentProfile")]
    pub investment_strategy: Option<String>,
    #[serde(alias = "moisCompteCourant", alias = "currentAccountMonths")]
    pub min_current_account_months: Option<Value>,
    #[serde(alias = "moisPrecaution", alias = "precautionIncomeMonths")]
    pub precaution_months: Option<Value>,
    #[serde(alias = "partMaxInvestissement", alias = "maxInvestPercent")]
    pub invest_max_surplus_percent: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaxRecord {
    #[serde(alias = "impotAnnuel", alias = "estimatedAnnualTax", alias = "declaredTax")]
    pub annual_tax: Option<Value>,
    #[serde(alias = "modeProvision", alias = "funding")]
    pub mode: Option<String>,
    #[serde(alias = "priorite")]
    pub priority: Option<String>,
    #[serde(alias = "partPlafond", alias = "maxSurplusShare")]
    pub surplus_share: Option<Value>,
    #[serde(alias = "partPlafondUrgent", alias = "urgentSurplusShare")]
    pub urgent_surplus_share: Option<Value>,
    #[serde(alias = "plafondMensuel", alias = "hardMonthlyCap")]
    pub monthly_ceiling: Option<Value>,
    #[serde(alias = "pontageSoldes", alias = "allowTopups")]
    pub allow_balance_topups: Option<Value>,
    #[serde(alias = "ordrePontage", alias = "sourcingOrder")]
    pub topup_order: Option<String>,
    #[serde(alias = "tauxSupportable", alias = "affordableRate")]
    pub affordable_rate: Option<Value>,
    #[serde(alias = "echeance", alias = "dueDate")]
    pub deadline: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdvancedRecord {
    #[serde(alias = "passerMois", alias = "skipMonth")]
    pub skip_current_month: Option<Value>,
    #[serde(alias = "forcerRecalcul")]
    pub force_recompute: Option<Value>,
    #[serde(alias = "plafondInvestissementMensuel", alias = "investmentMonthlyCap")]
    pub monthly_investment_cap: Option<Value>,
}

const DEFAULT_PRECAUTION_MONTHS: f64 = 3.0;
const DEFAULT_SURPLUS_SHARE_CAP: f64 = 0.35;
const DEFAULT_URGENT_SURPLUS_SHARE_CAP: f64 = 0.85;
const DEFAULT_AFFORDABLE_RATE: f64 = 0.25;
const EMPLOYEE_NET_FACTOR: f64 = 0.86;
const SELF_EMPLOYED_NET_FACTOR: f64 = 0.75;

// never fails: unreadable amounts become 0, unknown spellings fall back, ranges clamp
pub fn normalize_snapshot(
    snapshot: &HouseholdSnapshot,
    reference_date: NaiveDate,
) -> AllocationContext {
    let incomes: Vec<IncomeEntry> = snapshot.incomes.iter().map(normalize_income).collect();

    let mut fixed = 0.0;
    let mut variable = 0.0;
    let mut exceptional = 0.0;
    for record in &snapshot.expenses {
        let monthly = monthly_equivalent(
            coerce_amount(record.amount.as_ref()),
            record.frequency.as_deref(),
        );
        match parse_expense_group(record.category.as_deref()) {
            ExpenseGroup::Fixed => fixed += monthly,
            ExpenseGroup::Variable => variable += monthly,
            ExpenseGroup::Exceptional => exceptional += monthly,
        }
    }

    let loans: Vec<LoanEntry> = snapshot.loans.iter().map(normalize_loan).collect();
    let assets = normalize_accounts(&snapshot.accounts, reference_date);

    AllocationContext {
        reference_date,
        incomes,
        fixed_expenses: fixed,
        variable_expenses: variable,
        exceptional_expenses: exceptional,
        leisure_budget: coerce_amount(snapshot.leisure_budget.as_ref()),
        loans,
        assets,
        short_term_goal: normalize_short_goal(&snapshot.short_term_goal),
        long_term_goal: normalize_long_goal(&snapshot.long_term_goal),
        strategy: normalize_strategy(&snapshot.strategy, &snapshot.tax),
        overrides: normalize_advanced(&snapshot.advanced),
        monthly_available_override: snapshot
            .monthly_available
            .as_ref()
            .map(|raw| coerce_number(Some(raw))),
        declared_annual_tax: coerce_amount(snapshot.tax.annual_tax.as_ref()),
    }
}

fn normalize_income(record: &IncomeRecord) -> IncomeEntry {
    let monthly = monthly_equivalent(
        coerce_amount(record.amount.as_ref()),
        record.frequency.as_deref(),
    );
    let status = parse_employment(record.status.as_deref());
    let net_factor = if is_gross_amount(record.amount_kind.as_deref()) {
        match status {
            EmploymentStatus::Employee => EMPLOYEE_NET_FACTOR,
            EmploymentStatus::SelfEmployed => SELF_EMPLOYED_NET_FACTOR,
        }
    } else {
        1.0
    };
    IncomeEntry {
        monthly_net: monthly * net_factor,
        status,
        thirteenth_salary: coerce_flag(record.thirteenth_salary.as_ref()),
        thirteenth_month: coerce_month(record.thirteenth_month.as_ref(), 12),
    }
}

fn normalize_loan(record: &LoanRecord) -> LoanEntry {
    LoanEntry {
        label: record.label.clone().unwrap_or_else(|| "loan".to_string()),
        monthly_payment: coerce_amount(record.monthly_payment.as_ref()),
        balance: coerce_amount(record.balance.as_ref()),
        kind: parse_loan_kind(record.kind.as_deref()),
        interest_rate: rate_fraction(coerce_number(record.interest_rate.as_ref())),
    }
}

fn normalize_accounts(record: &AccountRecord, reference_date: NaiveDate) -> AssetBalances {
    AssetBalances {
        payment_account: coerce_amount(record.current.as_ref()),
        security_savings: coerce_amount(record.security_savings.as_ref()),
        tax_provision: coerce_amount(record.tax_provision.as_ref()),
        pillar_balance: coerce_amount(record.pillar_balance.as_ref()),
        pillar_contributed_ytd: coerce_amount(record.pillar_contributed_ytd.as_ref()),
        pillar_ytd_year: record
            .pillar_ytd_year
            .as_ref()
            .map(|raw| coerce_number(Some(raw)) as i32)
            .unwrap_or_else(|| reference_date.year()),
    }
}

fn normalize_short_goal(record: &GoalRecord) -> Option<GoalPlan> {
    let target = coerce_amount(record.target.as_ref());
    let enabled = match record.enabled.as_ref() {
        Some(raw) => coerce_flag(Some(raw)),
        // legacy snapshots have no flag; a target alone activates the goal
        None => target > 0.0,
    };
    if !enabled || target <= 0.0 {
        return None;
    }
    Some(GoalPlan {
        label: record
            .label
            .clone()
            .unwrap_or_else(|| "short-term goal".to_string()),
        target_amount: target,
        horizon_years: horizon_or_one(record.horizon_years.as_ref()),
    })
}

fn normalize_long_goal(record: &LongGoalRecord) -> Option<LongTermGoal> {
    let target = coerce_amount(record.target.as_ref());
    if target <= 0.0 {
        return None;
    }
    Some(LongTermGoal {
        kind: record.kind.clone().unwrap_or_else(|| "other".to_string()),
        target_amount: target,
        horizon_years: horizon_or_one(record.horizon_years.as_ref()),
    })
}

fn horizon_or_one(raw: Option<&Value>) -> f64 {
    let years = coerce_number(raw);
    if years > 0.0 { years } else { 1.0 }
}

fn normalize_strategy(record: &StrategyRecord, tax: &TaxRecord) -> StrategySettings {
    StrategySettings {
        savings: parse_savings_strategy(record.savings_strategy.as_deref()),
        investment: parse_investment_strategy(record.investment_strategy.as_deref()),
        min_current_account_months: record
            .min_current_account_months
            .as_ref()
            .map(|raw| coerce_number(Some(raw)).clamp(1.0, 3.0))
            .unwrap_or(1.0),
        precaution_income_months: record
            .precaution_months
            .as_ref()
            .map(|raw| coerce_number(Some(raw)).clamp(1.0, 12.0))
            .unwrap_or(DEFAULT_PRECAUTION_MONTHS),
        invest_max_surplus_share: record
            .invest_max_surplus_percent
            .as_ref()
            .map(|raw| coerce_number(Some(raw)).clamp(0.0, 100.0) / 100.0)
            .unwrap_or(1.0),
        tax: normalize_tax(tax),
    }
}

fn normalize_tax(record: &TaxRecord) -> TaxSettings {
    let ceiling = record
        .monthly_ceiling
        .as_ref()
        .map(|raw| coerce_number(Some(raw)))
        .filter(|v| *v > 0.0);
    TaxSettings {
        mode: parse_tax_mode(record.mode.as_deref()),
        priority: parse_tax_priority(record.priority.as_deref()),
        surplus_share_cap: record
            .surplus_share
            .as_ref()
            .map(|raw| rate_fraction(coerce_number(Some(raw))))
            .unwrap_or(DEFAULT_SURPLUS_SHARE_CAP),
        urgent_surplus_share_cap: record
            .urgent_surplus_share
            .as_ref()
            .map(|raw| rate_fraction(coerce_number(Some(raw))))
            .unwrap_or(DEFAULT_URGENT_SURPLUS_SHARE_CAP),
        hard_monthly_ceiling: ceiling,
        allow_balance_topups: coerce_flag(record.allow_balance_topups.as_ref()),
        topup_order: parse_topup_order(record.topup_order.as_deref()),
        affordable_monthly_rate: record
            .affordable_rate
            .as_ref()
            .map(|raw| rate_fraction(coerce_number(Some(raw))))
            .unwrap_or(DEFAULT_AFFORDABLE_RATE),
        deadline: record.deadline.as_deref().and_then(parse_date),
    }
}

fn normalize_advanced(record: &AdvancedRecord) -> AdvancedOverrides {
    AdvancedOverrides {
        skip_current_month: coerce_flag(record.skip_current_month.as_ref()),
        force_recompute: coerce_flag(record.force_recompute.as_ref()),
        monthly_investment_cap: record
            .monthly_investment_cap
            .as_ref()
            .map(|raw| coerce_number(Some(raw)))
            .filter(|v| *v > 0.0),
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ExpenseGroup {
    Fixed,
    Variable,
    Exceptional,
}

fn parse_expense_group(raw: Option<&str>) -> ExpenseGroup {
    let text = normalized_text(raw);
    if text.contains("var") {
        ExpenseGroup::Variable
    } else if text.contains("excep") || text.contains("ponctuel") || text.contains("one-off") {
        ExpenseGroup::Exceptional
    } else {
        ExpenseGroup::Fixed
    }
}

fn parse_employment(raw: Option<&str>) -> EmploymentStatus {
    let text = normalized_text(raw);
    if text.contains("self")
        || text.contains("independant")
        || text.contains("indépendant")
        || text.contains("freelance")
    {
        EmploymentStatus::SelfEmployed
    } else {
        EmploymentStatus::Employee
    }
}

fn is_gross_amount(raw: Option<&str>) -> bool {
    let text = normalized_text(raw);
    text.contains("gross") || text.contains("brut")
}

fn parse_savings_strategy(raw: Option<&str>) -> SavingsStrategy {
    let text = normalized_text(raw);
    if text.contains("prudent") {
        SavingsStrategy::Prudent
    } else if text.contains("aggress") || text.contains("agress") || text.contains("dynami") {
        SavingsStrategy::Aggressive
    } else {
        SavingsStrategy::Balanced
    }
}

fn parse_investment_strategy(raw: Option<&str>) -> InvestmentStrategy {
    let text = normalized_text(raw);
    if text.contains("secur") || text.contains("sécur") {
        InvestmentStrategy::Securite
    } else if text.contains("aggress") || text.contains("agress") || text.contains("offensif") {
        InvestmentStrategy::Aggressif
    } else {
        InvestmentStrategy::Equilibre
    }
}

fn parse_loan_kind(raw: Option<&str>) -> LoanKind {
    let text = normalized_text(raw);
    if text.contains("mort") || text.contains("hypo") {
        LoanKind::Mortgage
    } else if text.contains("leas") {
        LoanKind::Leasing
    } else if text.contains("conso") || text.contains("consum") || text.contains("personal") {
        LoanKind::Consumer
    } else {
        LoanKind::Other
    }
}

fn parse_tax_mode(raw: Option<&str>) -> TaxFundingMode {
    let text = normalized_text(raw);
    if text.contains("later") || text.contains("diff") {
        TaxFundingMode::PayLater
    } else {
        TaxFundingMode::Provision
    }
}

fn parse_tax_priority(raw: Option<&str>) -> TaxPriority {
    let text = normalized_text(raw);
    if text.contains("crit") {
        TaxPriority::Critical
    } else if text.contains("high") || text.contains("haut") || text.contains("elev") || text.contains("élev") {
        TaxPriority::High
    } else {
        TaxPriority::Normal
    }
}

fn parse_topup_order(raw: Option<&str>) -> TopupOrder {
    let text = normalized_text(raw);
    if text.starts_with("savings") || text.starts_with("epargne") || text.starts_with("épargne") {
        TopupOrder::SavingsThenCurrent
    } else {
        TopupOrder::CurrentThenSavings
    }
}

fn normalized_text(raw: Option<&str>) -> String {
    raw.unwrap_or("").trim().to_lowercase()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Frequency {
    Monthly,
    Quarterly,
    Annual,
    Weekly,
}

fn parse_frequency(raw: Option<&str>) -> Frequency {
    let text = normalized_text(raw);
    if text.contains("ann") || text.contains("year") {
        Frequency::Annual
    } else if text.contains("quart") || text.contains("trimest") {
        Frequency::Quarterly
    } else if text.contains("week")
        || text.contains("hebdo")
        || text.contains("quinzaine")
        || text.contains("fortnight")
    {
        // bi-weekly entries use the weekly factor as well
        Frequency::Weekly
    } else {
        Frequency::Monthly
    }
}

fn monthly_equivalent(amount: f64, frequency: Option<&str>) -> f64 {
    match parse_frequency(frequency) {
        Frequency::Monthly => amount,
        Frequency::Quarterly => amount / 3.0,
        Frequency::Annual => amount / 12.0,
        Frequency::Weekly => amount * 52.0 / 12.0,
    }
}

// strings tolerate Swiss and French formatting; unreadable becomes 0
fn coerce_number(raw: Option<&Value>) -> f64 {
    match raw {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::String(s)) => parse_number_text(s).unwrap_or(0.0),
        Some(_) => 0.0,
    }
}

fn coerce_amount(raw: Option<&Value>) -> f64 {
    coerce_number(raw).max(0.0)
}

fn parse_number_text(text: &str) -> Option<f64> {
    let mut cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            // the later separator is the decimal one, the other groups thousands
            if dot > comma {
                cleaned.retain(|c| c != ',');
            } else {
                cleaned.retain(|c| c != '.');
                cleaned = cleaned.replace(',', ".");
            }
        }
        (None, Some(_)) => {
            let commas = cleaned.matches(',').count();
            let trailing = cleaned.rsplit(',').next().map(str::len).unwrap_or(0);
            if commas == 1 && trailing != 3 {
                cleaned = cleaned.replace(',', ".");
            } else {
                // several commas, or a lone comma followed by a full
                // thousands group: treat them as grouping
                cleaned.retain(|c| c != ',');
            }
        }
        (Some(_), None) => {
            if cleaned.matches('.').count() > 1 {
                cleaned.retain(|c| c != '.');
            }
        }
        (None, None) => {}
    }

    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn coerce_flag(raw: Option<&Value>) -> bool {
    match raw {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(Value::String(s)) => {
            matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "oui" | "on")
        }
        Some(_) => false,
    }
}

fn coerce_month(raw: Option<&Value>, default: u32) -> u32 {
    let value = coerce_number(raw);
    if !(1.0..=12.0).contains(&value) {
        return default;
    }
    value as u32
}

fn rate_fraction(raw: f64) -> f64 {
    // shares arrive as fractions (0.35) or percentages (35)
    if raw > 1.0 {
        (raw / 100.0).min(1.0)
    } else {
        raw.max(0.0)
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%d.%m.%Y"))
        .ok()
}
