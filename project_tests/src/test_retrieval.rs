//! # Retrieval Check
//!
//! Fetches EIDOs by reference id from a running notifier's retrieval route
//! and prints them. Useful for checking a deployment by hand:
//!
//! ```text
//! test_retrieval --base-url https://notifier:9443/incidents/eidos eido-1 eido-2
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use anyhow::Result;
use clap::Parser;

use eido_common::retrieve::EidoRetrievalClient;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the retrieval route
    #[clap(long, default_value = "http://127.0.0.1:9443/incidents/eidos")]
    base_url: String,

    /// Bearer token sent with each request
    #[clap(long, env = "EIDO_TOKEN")]
    token: Option<String>,

    /// Retries for transient failures
    #[clap(long, default_value_t = 3)]
    retries: u32,

    /// Reference ids to fetch
    #[clap(required = true)]
    ids: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = EidoRetrievalClient::new(&args.base_url, args.token, args.retries)?;

    let mut failures = 0;
    for id in &args.ids {
        match client.fetch(id).await {
            Ok(eido) => {
                println!("✅ {} (incident {:?})", id, eido.incident_id());
                println!("{}", serde_json::to_string_pretty(eido.as_value())?);
            }
            Err(e) => {
                failures += 1;
                println!("❌ {}: {}", id, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} retrieval(s) failed", failures, args.ids.len());
    }
    Ok(())
}
