//! Transfer Example
//!
//! Funds a fresh key on a running `kestrel-sandbox`, sends 1.5 tez and waits
//! for two confirmations.

use std::sync::Arc;

use kestrel_sdk::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let url = std::env::var("KESTREL_RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8732".to_string());
    let signer = Arc::new(Ed25519Signer::generate());
    let address = signer.address();

    // The sandbox credits any address through its admin route.
    reqwest::Client::new()
        .post(format!("{url}/sandbox/fund"))
        .json(&serde_json::json!({ "address": address, "amount": "100" }))
        .send()
        .await
        .map_err(|e| KestrelError::Rpc(e.to_string()))?;

    let client = Client::connect(ClientConfig::new(url), signer).await?;
    println!("Sending from {address}");

    let handle = client
        .transfer(&TransferParams::new("tz1burnburnburnburnburnburnburjAYjjX", "1.5"))
        .await?;
    println!("Injected {}", handle.hash());

    match handle.confirmation(2).await? {
        ConfirmationState::Confirmed { level, confirmations, .. } => {
            println!("Confirmed at level {level} ({confirmations} confirmations)");
        }
        other => println!("Stopped in state {other:?}"),
    }

    Ok(())
}
