//! `loanserve case` subcommands (§4.12): operator CRUD over exception cases.

use clap::{Subcommand, ValueEnum};
use loanserve_core::exceptions::{Category, ExceptionCase};
use loanserve_core::returns::Severity;
use loanserve_storage::exceptions::ExceptionCaseRepository;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CategoryArg {
    AchReturn,
    Nsf,
    WireRecall,
    Duplicate,
    Dispute,
    ReconcileVariance,
}

impl From<CategoryArg> for Category {
    fn from(value: CategoryArg) -> Self {
        match value {
            CategoryArg::AchReturn => Category::AchReturn,
            CategoryArg::Nsf => Category::Nsf,
            CategoryArg::WireRecall => Category::WireRecall,
            CategoryArg::Duplicate => Category::Duplicate,
            CategoryArg::Dispute => Category::Dispute,
            CategoryArg::ReconcileVariance => Category::ReconcileVariance,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SeverityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<SeverityArg> for Severity {
    fn from(value: SeverityArg) -> Self {
        match value {
            SeverityArg::Low => Severity::Low,
            SeverityArg::Medium => Severity::Medium,
            SeverityArg::High => Severity::High,
            SeverityArg::Critical => Severity::Critical,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum CaseCommand {
    /// Open a new exception case
    Create {
        #[arg(long, value_enum)]
        category: CategoryArg,
        #[arg(long)]
        subcategory: String,
        #[arg(long, value_enum)]
        severity: SeverityArg,
        #[arg(long)]
        payment_id: Option<Ulid>,
        #[arg(long)]
        ingestion_id: Option<Ulid>,
    },
    /// Show a single case
    Get { id: Ulid },
    /// List cases (open/pending by default)
    List {
        #[arg(long)]
        all: bool,
    },
    /// Assign a case to an operator
    Assign { id: Ulid, assignee: String },
    /// Mark a case resolved
    Resolve {
        id: Ulid,
        #[arg(long)]
        note: Option<String>,
    },
    /// Mark a case cancelled
    Cancel { id: Ulid },
}

pub async fn run(command: CaseCommand, repo: &ExceptionCaseRepository) -> anyhow::Result<()> {
    match command {
        CaseCommand::Create { category, subcategory, severity, payment_id, ingestion_id } => {
            let mut case = ExceptionCase::open(category.into(), subcategory, severity.into());
            if let Some(payment_id) = payment_id {
                case = case.with_payment(payment_id);
            }
            if let Some(ingestion_id) = ingestion_id {
                case = case.with_ingestion(ingestion_id);
            }
            let mut tx = repo.pool().begin().await?;
            repo.insert(&mut tx, &case).await?;
            tx.commit().await?;
            println!("opened case {}", case.id);
        }
        CaseCommand::Get { id } => match repo.find(&id).await? {
            Some(case) => print_case(&case),
            None => println!("no such case: {id}"),
        },
        CaseCommand::List { all } => {
            let cases = if all { repo.list_all().await? } else { repo.list_open().await? };
            if cases.is_empty() {
                println!("no cases");
            }
            for case in &cases {
                print_case_summary(case);
            }
        }
        CaseCommand::Assign { id, assignee } => {
            let mut case = repo.find(&id).await?.ok_or_else(|| anyhow::anyhow!("no such case: {id}"))?;
            case.assignee = Some(assignee);
            repo.update(&case).await?;
            println!("assigned {id} to {}", case.assignee.unwrap());
        }
        CaseCommand::Resolve { id, note } => {
            let mut case = repo.find(&id).await?.ok_or_else(|| anyhow::anyhow!("no such case: {id}"))?;
            case.state = loanserve_core::exceptions::CaseState::Resolved;
            if let Some(note) = note {
                case.ai_recommendation = Some(note);
            }
            repo.update(&case).await?;
            println!("resolved {id}");
        }
        CaseCommand::Cancel { id } => {
            let mut case = repo.find(&id).await?.ok_or_else(|| anyhow::anyhow!("no such case: {id}"))?;
            case.state = loanserve_core::exceptions::CaseState::Cancelled;
            repo.update(&case).await?;
            println!("cancelled {id}");
        }
    }
    Ok(())
}

fn print_case_summary(case: &ExceptionCase) {
    println!(
        "{}  {:?}/{}  {:?}  {:?}",
        case.id, case.category, case.subcategory, case.severity, case.state
    );
}

fn print_case(case: &ExceptionCase) {
    println!("id:            {}", case.id);
    println!("category:      {:?}", case.category);
    println!("subcategory:   {}", case.subcategory);
    println!("severity:      {:?}", case.severity);
    println!("state:         {:?}", case.state);
    println!("payment_id:    {:?}", case.payment_id);
    println!("ingestion_id:  {:?}", case.ingestion_id);
    println!("assignee:      {:?}", case.assignee);
    println!("recommendation:{:?}", case.ai_recommendation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_arg_maps_to_its_domain_variant() {
        assert_eq!(Category::from(CategoryArg::AchReturn), Category::AchReturn);
        assert_eq!(Category::from(CategoryArg::Nsf), Category::Nsf);
        assert_eq!(Category::from(CategoryArg::WireRecall), Category::WireRecall);
        assert_eq!(Category::from(CategoryArg::Duplicate), Category::Duplicate);
        assert_eq!(Category::from(CategoryArg::Dispute), Category::Dispute);
        assert_eq!(
            Category::from(CategoryArg::ReconcileVariance),
            Category::ReconcileVariance
        );
    }

    #[test]
    fn every_severity_arg_maps_to_its_domain_variant() {
        assert_eq!(Severity::from(SeverityArg::Low), Severity::Low);
        assert_eq!(Severity::from(SeverityArg::Medium), Severity::Medium);
        assert_eq!(Severity::from(SeverityArg::High), Severity::High);
        assert_eq!(Severity::from(SeverityArg::Critical), Severity::Critical);
    }
}
