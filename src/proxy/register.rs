use super::server::{SipServerRef, SourceInfo};
use anyhow::Result;
use rsipstack::transaction::transaction::Transaction;
use tracing::info;

/// REGISTER is absorbed at the edge, never forwarded. A routing failure
/// counts as a failed authentication attempt against the source IP.
pub async fn handle_register(
    inner: &SipServerRef,
    tx: &mut Transaction,
    source: Option<SourceInfo>,
) -> Result<()> {
    let contact = source.as_ref().map(|source| source.contact.as_str());

    match inner.routing.route(&tx.original, contact).await {
        Ok(_) => {
            crate::metrics::sip::response("REGISTER", "200");
            tx.reply(rsip::StatusCode::OK).await.ok();
        }
        Err(e) => {
            if let Some(ref source) = source {
                inner.firewall.record_failed_auth(source.ip);
            }
            info!(error = %e, "registration rejected");
            crate::metrics::sip::response("REGISTER", "401");
            tx.reply(rsip::StatusCode::Unauthorized).await.ok();
        }
    }
    Ok(())
}
