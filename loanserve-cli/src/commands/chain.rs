//! `loanserve chain verify` (§4.4): walk a payment's hash chain and report
//! the first broken link, if any.

use clap::Subcommand;
use loanserve_core::hash_chain::verify_chain;
use loanserve_storage::events::EventRepository;
use ulid::Ulid;

#[derive(Debug, Subcommand)]
pub enum ChainCommand {
    /// Verify the hash chain for one payment
    Verify { payment_id: Ulid },
}

pub async fn run(command: ChainCommand, repo: &EventRepository) -> anyhow::Result<()> {
    match command {
        ChainCommand::Verify { payment_id } => {
            let events = repo.chain_for(&payment_id).await?;
            match verify_chain(payment_id, &events) {
                Ok(()) => println!("chain OK ({} events)", events.len()),
                Err(err) => {
                    println!("chain BROKEN: {err}");
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}
