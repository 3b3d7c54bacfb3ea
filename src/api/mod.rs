use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::core::{
    AllocationPlan, DeclaredFiscalNeeds, HouseholdSnapshot, normalize_snapshot, run_plan,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliSavingsStrategy {
    Prudent,
    Balanced,
    Aggressive,
}

impl CliSavingsStrategy {
    fn keyword(self) -> &'static str {
        match self {
            CliSavingsStrategy::Prudent => "prudent",
            CliSavingsStrategy::Balanced => "balanced",
            CliSavingsStrategy::Aggressive => "aggressive",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliInvestmentStrategy {
    Securite,
    Equilibre,
    Aggressif,
}

impl CliInvestmentStrategy {
    fn keyword(self) -> &'static str {
        match self {
            CliInvestmentStrategy::Securite => "securite",
            CliInvestmentStrategy::Equilibre => "equilibre",
            CliInvestmentStrategy::Aggressif => "aggressif",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliTaxMode {
    Provision,
    PayLater,
}

impl CliTaxMode {
    fn keyword(self) -> &'static str {
        match self {
            CliTaxMode::Provision => "provision",
            CliTaxMode::PayLater => "pay-later",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliTaxPriority {
    Normal,
    High,
    Critical,
}

impl CliTaxPriority {
    fn keyword(self) -> &'static str {
        match self {
            CliTaxPriority::Normal => "normal",
            CliTaxPriority::High => "high",
            CliTaxPriority::Critical => "critical",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliTopupOrder {
    CurrentThenSavings,
    SavingsThenCurrent,
}

impl CliTopupOrder {
    fn keyword(self) -> &'static str {
        match self {
            CliTopupOrder::CurrentThenSavings => "current-then-savings",
            CliTopupOrder::SavingsThenCurrent => "savings-then-current",
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "cascade",
    about = "Monthly surplus allocator (current account + security savings + tax + third pillar + investments)"
)]
struct PlanArgs {
    #[arg(
        long,
        help = "Monthly surplus to allocate; bypasses the income/expense arithmetic"
    )]
    monthly_available: Option<f64>,
    #[arg(long, default_value_t = 0.0, help = "Net monthly income")]
    monthly_income: f64,
    #[arg(long, help = "Pay a 13th salary in December")]
    thirteenth_salary: bool,
    #[arg(long, default_value_t = 0.0)]
    fixed_expenses: f64,
    #[arg(long, default_value_t = 0.0)]
    variable_expenses: f64,
    #[arg(long, default_value_t = 0.0)]
    leisure_budget: f64,
    #[arg(long, default_value_t = 0.0, help = "Payment account balance")]
    current_balance: f64,
    #[arg(long, default_value_t = 0.0, help = "Security savings balance")]
    savings_balance: f64,
    #[arg(long, default_value_t = 0.0, help = "Tax provision balance")]
    tax_balance: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Third pillar contributions already paid this calendar year"
    )]
    pillar_contributed: f64,
    #[arg(long, default_value_t = 0.0, help = "Declared annual tax liability")]
    annual_tax: f64,
    #[arg(long, value_enum, default_value_t = CliSavingsStrategy::Balanced)]
    savings_strategy: CliSavingsStrategy,
    #[arg(long, value_enum, default_value_t = CliInvestmentStrategy::Equilibre)]
    investment_strategy: CliInvestmentStrategy,
    #[arg(
        long,
        default_value_t = 1.0,
        help = "Current account target in months of variable spending"
    )]
    current_account_months: f64,
    #[arg(
        long,
        default_value_t = 3.0,
        help = "Security savings target in months of income"
    )]
    precaution_months: f64,
    #[arg(
        long,
        default_value_t = 100.0,
        help = "Largest share of the surplus that may be invested, in percent"
    )]
    invest_max_surplus_percent: f64,
    #[arg(long, value_enum, default_value_t = CliTaxMode::Provision)]
    tax_mode: CliTaxMode,
    #[arg(long, value_enum, default_value_t = CliTaxPriority::Normal)]
    tax_priority: CliTaxPriority,
    #[arg(
        long,
        help = "Quiet-month cap on the tax share of the surplus, in percent"
    )]
    tax_surplus_share_percent: Option<f64>,
    #[arg(
        long,
        help = "Urgent-month cap on the tax share of the surplus, in percent"
    )]
    tax_urgent_share_percent: Option<f64>,
    #[arg(long, help = "Absolute monthly ceiling on tax transfers")]
    tax_monthly_ceiling: Option<f64>,
    #[arg(
        long,
        help = "Tax deadline as YYYY-MM-DD; defaults to December 31st of the reference year"
    )]
    tax_deadline: Option<String>,
    #[arg(long, help = "Let an urgent tax month draw on account balances")]
    allow_balance_topups: bool,
    #[arg(long, value_enum, default_value_t = CliTopupOrder::CurrentThenSavings)]
    topup_order: CliTopupOrder,
    #[arg(long, help = "Short-term goal label")]
    goal_label: Option<String>,
    #[arg(long, help = "Short-term goal target amount")]
    goal_target: Option<f64>,
    #[arg(long, help = "Short-term goal horizon in years")]
    goal_horizon_years: Option<f64>,
    #[arg(long, help = "Reference date as YYYY-MM-DD; defaults to today")]
    reference_date: Option<String>,
    #[arg(long, help = "Produce an empty plan for the current month")]
    skip_current_month: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PlanPayload {
    #[serde(flatten)]
    snapshot: HouseholdSnapshot,
    #[serde(alias = "dateReference", alias = "date")]
    reference_date: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanResponse {
    reference_date: NaiveDate,
    #[serde(flatten)]
    plan: AllocationPlan,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/plan", get(plan_get_handler).post(plan_post_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!("surplus allocation API listening on http://{addr}");
    info!("local access: http://127.0.0.1:{port}/api/plan");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn plan_get_handler(Query(payload): Query<PlanPayload>) -> Response {
    plan_handler_impl(payload).await
}

async fn plan_post_handler(Json(payload): Json<PlanPayload>) -> Response {
    plan_handler_impl(payload).await
}

async fn plan_handler_impl(payload: PlanPayload) -> Response {
    match plan_response_from_payload(payload) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

fn plan_response_from_payload(payload: PlanPayload) -> Result<PlanResponse, String> {
    let reference_date = resolve_reference_date(payload.reference_date.as_deref())?;
    let ctx = normalize_snapshot(&payload.snapshot, reference_date);
    let plan = run_plan(&ctx, &DeclaredFiscalNeeds);
    debug!(%reference_date, status = ?plan.status, "allocation plan computed");
    Ok(PlanResponse {
        reference_date,
        plan,
    })
}

fn resolve_reference_date(raw: Option<&str>) -> Result<NaiveDate, String> {
    let Some(text) = raw else {
        return Ok(chrono::Local::now().date_naive());
    };
    let trimmed = text.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%d.%m.%Y"))
        .map_err(|_| format!("invalid reference date {trimmed:?}; expected YYYY-MM-DD"))
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

// flags cover the common knobs; multi-entry households go through the JSON API
fn snapshot_from_args(args: &PlanArgs) -> Result<HouseholdSnapshot, String> {
    let raw = serde_json::json!({
        "incomes": [ {
            "amount": args.monthly_income,
            "amountKind": "net",
            "thirteenthSalary": args.thirteenth_salary
        } ],
        "expenses": [
            { "amount": args.fixed_expenses, "category": "fixed" },
            { "amount": args.variable_expenses, "category": "variable" }
        ],
        "leisureBudget": args.leisure_budget,
        "accounts": {
            "current": args.current_balance,
            "securitySavings": args.savings_balance,
            "taxProvision": args.tax_balance,
            "pillarContributedYtd": args.pillar_contributed
        },
        "shortTermGoal": {
            "label": args.goal_label,
            "target": args.goal_target,
            "horizonYears": args.goal_horizon_years
        },
        "strategy": {
            "savingsStrategy": args.savings_strategy.keyword(),
            "investmentStrategy": args.investment_strategy.keyword(),
            "minCurrentAccountMonths": args.current_account_months,
            "precautionMonths": args.precaution_months,
            "investMaxSurplusPercent": args.invest_max_surplus_percent
        },
        "tax": {
            "annualTax": args.annual_tax,
            "mode": args.tax_mode.keyword(),
            "priority": args.tax_priority.keyword(),
            "surplusShare": args.tax_surplus_share_percent,
            "urgentSurplusShare": args.tax_urgent_share_percent,
            "monthlyCeiling": args.tax_monthly_ceiling,
            "allowBalanceTopups": args.allow_balance_topups,
            "topupOrder": args.topup_order.keyword(),
            "deadline": args.tax_deadline
        },
        "advanced": { "skipCurrentMonth": args.skip_current_month },
        "monthlyAvailable": args.monthly_available
    });
    serde_json::from_value(raw).map_err(|e| format!("snapshot assembly failed: {e}"))
}

pub fn run_plan_cli(args: &[String]) -> Result<(), String> {
    let parsed =
        PlanArgs::try_parse_from(std::iter::once("cascade").chain(args.iter().map(String::as_str)))
            .map_err(|e| e.to_string())?;
    let reference_date = resolve_reference_date(parsed.reference_date.as_deref())?;
    let snapshot = snapshot_from_args(&parsed)?;
    let ctx = normalize_snapshot(&snapshot, reference_date);
    let plan = run_plan(&ctx, &DeclaredFiscalNeeds);
    let response = PlanResponse {
        reference_date,
        plan,
    };
    let rendered = serde_json::to_string_pretty(&response).map_err(|e| e.to_string())?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
fn plan_response_from_json(json: &str) -> Result<PlanResponse, String> {
    let payload = serde_json::from_str::<PlanPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    plan_response_from_payload(payload)
}
