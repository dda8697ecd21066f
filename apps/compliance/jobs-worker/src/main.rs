//! Compliance Jobs Worker - Entry Point
//!
//! Background worker that processes queued jobs (email, document extraction,
//! AI completions).

#[tokio::main]
async fn main() -> eyre::Result<()> {
    compliance_jobs_worker::run().await
}
