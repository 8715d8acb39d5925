use std::process::ExitCode;

fn main() -> ExitCode {
    match ers_reconcile::run() {
        Ok(batch) => {
            println!(
                "Batch {} complete: {} succeeded, {} failed, {} skipped",
                batch.batch_id, batch.succeeded, batch.failed, batch.skipped
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Reconciliation batch failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
