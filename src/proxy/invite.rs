use super::forward::{self, reply_error};
use super::server::SipServerRef;
use crate::routing::RouteTarget;
use anyhow::Result;
use rsip::headers::UntypedHeader;
use rsip::prelude::HeadersExt;
use rsipstack::transaction::transaction::Transaction;
use rsipstack::transport::SipAddr;
use tracing::{debug, info, warn};

/// The INVITE leg of the proxy: open a client transaction toward the
/// resolved next hop and relay its responses until the first final one.
///
/// Provisionals pass through verbatim apart from the Via pop. A 2xx
/// marks the call answered before it is relayed, so billing can never
/// start after the caller already holds the answer. A CANCEL from the
/// caller aborts the outbound leg; the 487 that follows is relayed like
/// any other final.
pub async fn handle_invite(
    inner: &SipServerRef,
    tx: &mut Transaction,
    tenant_id: &str,
) -> Result<()> {
    tx.send_trying().await.ok();

    let call_id = tx
        .original
        .call_id_header()
        .map(|header| header.value().to_string())
        .unwrap_or_default();
    let from = tx
        .original
        .from_header()
        .and_then(|from| from.uri())
        .map(|uri| uri.to_string())
        .unwrap_or_default();
    let to = tx
        .original
        .to_header()
        .and_then(|to| to.uri())
        .map(|uri| uri.to_string())
        .unwrap_or_default();

    let next_hop = match inner.routing.route(&tx.original, None).await {
        Ok(RouteTarget::NextHop(next_hop)) => next_hop,
        Ok(RouteTarget::Registered) => {
            tx.reply(rsip::StatusCode::ServerInternalError).await.ok();
            return Ok(());
        }
        Err(e) => {
            info!(%call_id, error = %e, "INVITE routing failed");
            reply_error(tx, &e, "INVITE").await;
            return Ok(());
        }
    };

    let session_id = inner
        .call_control
        .start_call(&from, &to, &call_id, tenant_id);
    info!(%call_id, %session_id, %next_hop, "INVITE routed");

    let target = match forward::parse_next_hop(&next_hop) {
        Ok(target) => target,
        Err(e) => {
            warn!(%call_id, %next_hop, error = %e, "unusable next hop");
            inner.call_control.end_call(&call_id);
            reply_error(tx, &e, "INVITE").await;
            return Ok(());
        }
    };

    let record_route = inner.record_route_value();
    let out_request = match forward::prepare_forward_request(
        &inner.endpoint,
        &tx.original,
        &next_hop,
        record_route.as_deref(),
    ) {
        Ok(request) => request,
        Err(e) => {
            inner.call_control.end_call(&call_id);
            reply_error(tx, &e, "INVITE").await;
            return Ok(());
        }
    };

    let mut client_tx =
        match forward::start_client_transaction(&inner.endpoint, out_request.clone(), target.clone())
            .await
        {
            Ok(client_tx) => client_tx,
            Err(e) => {
                warn!(%call_id, error = %e, "failed to open client transaction");
                inner.call_control.end_call(&call_id);
                reply_error(tx, &e, "INVITE").await;
                return Ok(());
            }
        };

    let cancelled = inner.register_pending_invite(&call_id);
    let answered = relay_responses(
        inner,
        tx,
        &mut client_tx,
        &call_id,
        &out_request,
        target,
        cancelled,
    )
    .await;
    inner.clear_pending_invite(&call_id);

    if !answered {
        inner.call_control.end_call(&call_id);
    }
    Ok(())
}

async fn relay_responses(
    inner: &SipServerRef,
    tx: &mut Transaction,
    client_tx: &mut Transaction,
    call_id: &str,
    out_request: &rsip::Request,
    target: SipAddr,
    cancelled: tokio_util::sync::CancellationToken,
) -> bool {
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            _ = cancelled.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                debug!(%call_id, "caller cancelled, aborting outbound leg");
                if let Err(e) = forward::send_cancel(&inner.endpoint, out_request, target.clone()).await {
                    warn!(%call_id, error = %e, "failed to send CANCEL to next hop");
                }
                // keep relaying: the 487 arrives as the final response
            }
            message = client_tx.receive() => {
                let Some(message) = message else {
                    // transaction ended with no final response
                    crate::metrics::sip::response("INVITE", "408");
                    tx.reply(rsip::StatusCode::RequestTimeout).await.ok();
                    return false;
                };
                let rsip::SipMessage::Response(mut response) = message else {
                    continue;
                };
                forward::strip_top_via(&mut response);
                let status = response.status_code.clone();

                if status.kind() == rsip::StatusCodeKind::Provisional {
                    if status == rsip::StatusCode::Ringing {
                        inner.call_control.on_ringing(call_id);
                    }
                    tx.respond(response).await.ok();
                    continue;
                }

                let answered = status.kind() == rsip::StatusCodeKind::Successful;
                if answered {
                    inner.call_control.on_answer(call_id);
                }
                crate::metrics::sip::response("INVITE", &status.to_string());
                tx.respond(response).await.ok();
                debug!(%call_id, %status, "final response relayed");
                return answered;
            }
        }
    }
}

/// CANCEL arrives as its own server transaction; pair it with the
/// pending INVITE and answer the CANCEL itself right away.
pub async fn handle_cancel(inner: &SipServerRef, tx: &mut Transaction) -> Result<()> {
    let call_id = tx
        .original
        .call_id_header()
        .map(|header| header.value().to_string())
        .unwrap_or_default();

    if inner.cancel_pending_invite(&call_id) {
        debug!(%call_id, "CANCEL matched a pending INVITE");
    } else {
        debug!(%call_id, "CANCEL without a pending INVITE");
    }
    tx.reply(rsip::StatusCode::OK).await.ok();
    Ok(())
}
