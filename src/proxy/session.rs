use super::forward::{self, reply_error};
use super::server::SipServerRef;
use crate::callcontrol::ActiveCall;
use crate::error::Error;
use crate::routing::RouteTarget;
use anyhow::Result;
use rsip::headers::UntypedHeader;
use rsip::prelude::HeadersExt;
use rsipstack::transaction::random_text;
use rsipstack::transaction::transaction::Transaction;
use tracing::{debug, info, warn};

/// BYE tears the call state down no matter what happens on the wire,
/// and the caller always gets a final response.
pub async fn handle_bye(inner: &SipServerRef, tx: &mut Transaction) -> Result<()> {
    let call_id = tx
        .original
        .call_id_header()
        .map(|header| header.value().to_string())
        .unwrap_or_default();
    inner.call_control.end_call(&call_id);

    let next_hop = match inner.routing.route(&tx.original, None).await {
        Ok(RouteTarget::NextHop(next_hop)) => next_hop,
        _ => {
            debug!(%call_id, "no route for BYE, answering locally");
            crate::metrics::sip::response("BYE", "200");
            tx.reply(rsip::StatusCode::OK).await.ok();
            return Ok(());
        }
    };

    match relay_single_final(inner, tx, &next_hop, "BYE").await {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            crate::metrics::sip::response("BYE", "200");
            tx.reply(rsip::StatusCode::OK).await.ok();
        }
    }
    Ok(())
}

pub async fn handle_message(inner: &SipServerRef, tx: &mut Transaction) -> Result<()> {
    match inner.routing.route(&tx.original, None).await {
        Ok(RouteTarget::NextHop(next_hop)) => {
            match relay_single_final(inner, tx, &next_hop, "MESSAGE").await {
                Ok(true) => {}
                Ok(false) => {
                    crate::metrics::sip::response("MESSAGE", "408");
                    tx.reply(rsip::StatusCode::RequestTimeout).await.ok();
                }
                Err(e) => reply_error(tx, &e, "MESSAGE").await,
            }
        }
        Ok(RouteTarget::Registered) => {
            tx.reply(rsip::StatusCode::ServerInternalError).await.ok();
        }
        Err(e) => {
            info!(error = %e, "MESSAGE routing failed");
            reply_error(tx, &e, "MESSAGE").await;
        }
    }
    Ok(())
}

pub async fn handle_options(tx: &mut Transaction) -> Result<()> {
    let headers = vec![rsip::Header::Other(
        "Allow".to_string(),
        "INVITE, ACK, CANCEL, BYE, REGISTER, OPTIONS, MESSAGE".to_string(),
    )];
    crate::metrics::sip::response("OPTIONS", "200");
    tx.reply_with(rsip::StatusCode::OK, headers, None).await.ok();
    Ok(())
}

/// Standalone ACK (a 2xx ACK is end-to-end): re-target it at the next
/// hop and fire it off without waiting for anything back.
pub async fn handle_ack(inner: &SipServerRef, tx: &mut Transaction) -> Result<()> {
    let next_hop = match inner.routing.route(&tx.original, None).await {
        Ok(RouteTarget::NextHop(next_hop)) => next_hop,
        _ => return Ok(()),
    };
    let target = match forward::parse_next_hop(&next_hop) {
        Ok(target) => target,
        Err(_) => return Ok(()),
    };
    let request =
        match forward::prepare_forward_request(&inner.endpoint, &tx.original, &next_hop, None) {
            Ok(request) => request,
            Err(_) => return Ok(()),
        };
    match forward::start_client_transaction(&inner.endpoint, request, target).await {
        Ok(mut client_tx) => {
            debug!(%next_hop, "ACK relayed");
            tokio::spawn(async move { while client_tx.receive().await.is_some() {} });
        }
        Err(e) => debug!(%next_hop, error = %e, "failed to relay ACK"),
    }
    Ok(())
}

/// Forward a non-INVITE request and relay upstream responses until the
/// first final one. `Ok(false)` means the transaction ended silently.
async fn relay_single_final(
    inner: &SipServerRef,
    tx: &mut Transaction,
    next_hop: &str,
    method: &str,
) -> Result<bool, Error> {
    let target = forward::parse_next_hop(next_hop)?;
    let request =
        forward::prepare_forward_request(&inner.endpoint, &tx.original, next_hop, None)?;
    let mut client_tx =
        forward::start_client_transaction(&inner.endpoint, request, target).await?;

    while let Some(message) = client_tx.receive().await {
        let rsip::SipMessage::Response(mut response) = message else {
            continue;
        };
        forward::strip_top_via(&mut response);
        let status = response.status_code.clone();
        tx.respond(response).await.ok();
        if status.kind() != rsip::StatusCodeKind::Provisional {
            crate::metrics::sip::response(method, &status.to_string());
            return Ok(true);
        }
    }
    Ok(false)
}

/// Force-terminate teardown: one BYE toward each dialog end, routed
/// through the same registration fan-out as any in-dialog request.
pub async fn send_dialog_byes(inner: &SipServerRef, call: &ActiveCall) {
    let legs = [
        (call.from.as_str(), call.to.as_str()),
        (call.to.as_str(), call.from.as_str()),
    ];
    for (from, to) in legs {
        if let Err(e) = send_bye(inner, from, to, &call.call_id).await {
            warn!(call_id = %call.call_id, %to, error = %e, "could not send teardown BYE");
        }
    }
}

async fn send_bye(
    inner: &SipServerRef,
    from: &str,
    to: &str,
    call_id: &str,
) -> Result<(), Error> {
    let request = build_bye(from, to, call_id)?;
    let next_hop = match inner.routing.route(&request, None).await {
        Ok(RouteTarget::NextHop(next_hop)) => next_hop,
        _ => return Err(Error::NotRegistered),
    };
    let target = forward::parse_next_hop(&next_hop)?;
    let request = forward::prepare_forward_request(&inner.endpoint, &request, &next_hop, None)?;
    let mut client_tx = forward::start_client_transaction(&inner.endpoint, request, target).await?;
    tokio::spawn(async move { while client_tx.receive().await.is_some() {} });
    Ok(())
}

fn build_bye(from: &str, to: &str, call_id: &str) -> Result<rsip::Request, Error> {
    let from_uri = rsip::Uri::try_from(from).map_err(Error::parse)?;
    let to_uri = rsip::Uri::try_from(to).map_err(Error::parse)?;

    let headers: Vec<rsip::Header> = vec![
        rsip::typed::From {
            display_name: None,
            uri: from_uri,
            params: vec![rsip::Param::Tag(rsip::param::Tag::new(random_text(8)))],
        }
        .into(),
        rsip::typed::To {
            display_name: None,
            uri: to_uri.clone(),
            params: vec![],
        }
        .into(),
        rsip::headers::CallId::new(call_id).into(),
        rsip::typed::CSeq {
            seq: 2u32.into(),
            method: rsip::Method::Bye,
        }
        .into(),
        rsip::Header::MaxForwards(rsip::headers::MaxForwards::from(70u32)),
        rsip::Header::ContentLength(rsip::headers::ContentLength::from(0u32)),
    ];

    Ok(rsip::Request {
        method: rsip::Method::Bye,
        uri: to_uri,
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    })
}
