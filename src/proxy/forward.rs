use crate::error::Error;
use rsip::headers::UntypedHeader;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsipstack::transaction::key::{TransactionKey, TransactionRole};
use rsipstack::transaction::transaction::Transaction;
use rsipstack::transaction::Endpoint;
use rsipstack::transport::SipAddr;

const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Parse a stored contact (`host[:port][;transport=…]`) into a transport
/// destination.
pub fn parse_next_hop(contact: &str) -> Result<SipAddr, Error> {
    let raw = contact
        .trim()
        .trim_start_matches("sips:")
        .trim_start_matches("sip:");
    let (host_port, params) = match raw.split_once(';') {
        Some((host_port, params)) => (host_port, Some(params)),
        None => (raw, None),
    };
    if host_port.is_empty() {
        return Err(Error::Parse(format!("empty destination in '{}'", contact)));
    }

    let transport = params.and_then(|params| {
        params
            .split(';')
            .filter_map(|param| param.split_once('='))
            .find(|(name, _)| name.eq_ignore_ascii_case("transport"))
            .and_then(|(_, value)| parse_transport_token(value))
    });

    let addr = rsip::HostWithPort::try_from(host_port)
        .map_err(|e| Error::Parse(format!("'{}': {}", contact, e)))?;
    Ok(SipAddr {
        r#type: transport,
        addr,
    })
}

pub fn parse_transport_token(value: &str) -> Option<rsip::Transport> {
    match value.to_ascii_lowercase().as_str() {
        "udp" => Some(rsip::Transport::Udp),
        "tcp" => Some(rsip::Transport::Tcp),
        "tls" => Some(rsip::Transport::Tls),
        "ws" => Some(rsip::Transport::Ws),
        "wss" => Some(rsip::Transport::Wss),
        _ => None,
    }
}

/// Build the outbound copy of a request: Request-URI re-targeted at the
/// next hop, Max-Forwards decremented, and the proxy's own Via stacked
/// on top with a fresh branch. From, To, Call-ID, CSeq, Contact,
/// Content-Type and the body ride along untouched.
pub fn prepare_forward_request(
    endpoint: &Endpoint,
    original: &rsip::Request,
    next_hop: &str,
    record_route: Option<&str>,
) -> Result<rsip::Request, Error> {
    let mut request = original.clone();

    let max_forwards = request
        .headers
        .iter()
        .find_map(|header| match header {
            rsip::Header::MaxForwards(mf) => mf.value().trim().parse::<u32>().ok(),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_FORWARDS);
    if max_forwards <= 1 {
        return Err(Error::TooManyHops);
    }
    request
        .headers
        .retain(|header| !matches!(header, rsip::Header::MaxForwards(_)));
    request.headers.push(rsip::Header::MaxForwards(
        rsip::headers::MaxForwards::from(max_forwards - 1),
    ));

    let uri_str = if next_hop.starts_with("sip:") || next_hop.starts_with("sips:") {
        next_hop.to_string()
    } else {
        format!("sip:{}", next_hop)
    };
    request.uri = rsip::Uri::try_from(uri_str.as_str()).map_err(Error::parse)?;

    let via_addr = endpoint.get_addrs().first().cloned();
    let via = endpoint
        .inner
        .get_via(via_addr, None)
        .map_err(Error::transport)?;
    let mut headers: Vec<rsip::Header> = request.headers.iter().cloned().collect();
    headers.insert(0, rsip::Header::Via(via.into()));
    if let Some(record_route) = record_route {
        headers.insert(
            1,
            rsip::Header::RecordRoute(rsip::headers::RecordRoute::new(format!(
                "<{}>",
                record_route
            ))),
        );
    }
    request.headers = headers.into();

    Ok(request)
}

/// Pop the Via this proxy pushed before relaying a response upstream.
pub fn strip_top_via(response: &mut rsip::Response) {
    let mut stripped = false;
    let headers: Vec<rsip::Header> = response
        .headers
        .iter()
        .cloned()
        .filter(|header| {
            if !stripped && matches!(header, rsip::Header::Via(_)) {
                stripped = true;
                false
            } else {
                true
            }
        })
        .collect();
    response.headers = headers.into();
}

pub async fn start_client_transaction(
    endpoint: &Endpoint,
    request: rsip::Request,
    target: SipAddr,
) -> Result<Transaction, Error> {
    let key =
        TransactionKey::from_request(&request, TransactionRole::Client).map_err(Error::transport)?;
    let mut tx = Transaction::new_client(key, request, endpoint.inner.clone(), None);
    tx.destination = Some(target);
    tx.send().await.map_err(Error::transport)?;
    Ok(tx)
}

/// Abort a forwarded INVITE: same Via, From, To, Call-ID and CSeq
/// number, method swapped to CANCEL, no body. The 487 comes back on the
/// INVITE transaction, so the CANCEL's own responses are just drained.
pub async fn send_cancel(
    endpoint: &Endpoint,
    invite: &rsip::Request,
    target: SipAddr,
) -> Result<(), Error> {
    let mut cancel = invite.clone();
    cancel.method = rsip::Method::Cancel;
    cancel.body.clear();
    cancel
        .headers
        .unique_push(rsip::Header::ContentLength(rsip::headers::ContentLength::from(0u32)));

    let seq = cancel
        .cseq_header()
        .and_then(|cseq| cseq.typed())
        .map_err(Error::parse)?
        .seq;
    cancel.headers.unique_push(rsip::Header::CSeq(
        rsip::typed::CSeq {
            seq,
            method: rsip::Method::Cancel,
        }
        .into(),
    ));

    let mut tx = start_client_transaction(endpoint, cancel, target).await?;
    tokio::spawn(async move { while tx.receive().await.is_some() {} });
    Ok(())
}

/// Convert a handler failure to its SIP response and count it.
pub(crate) async fn reply_error(tx: &mut Transaction, error: &Error, method: &str) {
    let status = error.status_code();
    crate::metrics::sip::response(method, &status.to_string());
    tx.reply(status).await.ok();
}
