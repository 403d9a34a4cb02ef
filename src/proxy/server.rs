use super::{invite, register, session};
use crate::callcontrol::{ActiveCall, CallControl};
use crate::config::{Config, SipProtocol};
use crate::firewall::Firewall;
use crate::routing::RoutingEngine;
use anyhow::{anyhow, Result};
use rsip::prelude::HeadersExt;
use rsipstack::transaction::{Endpoint, TransactionReceiver};
use rsipstack::transport::{udp::UdpConnection, SipConnection, TcpListenerConnection, TransportLayer};
use rsipstack::EndpointBuilder;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a request physically came from: the admission IP plus the
/// socket rendered as a contact string. Registrations pin to this
/// socket rather than the Contact header, so replies traverse whatever
/// path the user agent actually reached us on.
pub struct SourceInfo {
    pub ip: IpAddr,
    pub contact: String,
}

pub struct SipServerInner {
    pub cancel_token: CancellationToken,
    pub config: Arc<Config>,
    pub routing: Arc<RoutingEngine>,
    pub firewall: Arc<Firewall>,
    pub call_control: Arc<CallControl>,
    pub endpoint: Endpoint,
    pending_invites: Mutex<HashMap<String, CancellationToken>>,
}

pub type SipServerRef = Arc<SipServerInner>;

impl SipServerInner {
    /// Track an in-flight INVITE so a later CANCEL can abort it.
    pub fn register_pending_invite(&self, call_id: &str) -> CancellationToken {
        let token = self.cancel_token.child_token();
        self.pending_invites
            .lock()
            .unwrap()
            .insert(call_id.to_string(), token.clone());
        token
    }

    pub fn clear_pending_invite(&self, call_id: &str) {
        self.pending_invites.lock().unwrap().remove(call_id);
    }

    pub fn cancel_pending_invite(&self, call_id: &str) -> bool {
        match self.pending_invites.lock().unwrap().get(call_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Record-Route value advertised on forwarded requests, when enabled.
    pub fn record_route_value(&self) -> Option<String> {
        if !self.config.record_route {
            return None;
        }
        self.endpoint
            .get_addrs()
            .first()
            .map(|addr| format!("sip:{};lr", addr.addr))
    }
}

pub struct SipServer {
    pub inner: SipServerRef,
}

pub struct SipServerBuilder {
    config: Arc<Config>,
    cancel_token: Option<CancellationToken>,
    routing: Option<Arc<RoutingEngine>>,
    firewall: Option<Arc<Firewall>>,
    call_control: Option<Arc<CallControl>>,
    terminations: Option<mpsc::UnboundedReceiver<ActiveCall>>,
}

impl SipServerBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            cancel_token: None,
            routing: None,
            firewall: None,
            call_control: None,
            terminations: None,
        }
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_routing(mut self, routing: Arc<RoutingEngine>) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_firewall(mut self, firewall: Arc<Firewall>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    pub fn with_call_control(
        mut self,
        call_control: Arc<CallControl>,
        terminations: mpsc::UnboundedReceiver<ActiveCall>,
    ) -> Self {
        self.call_control = Some(call_control);
        self.terminations = Some(terminations);
        self
    }

    pub async fn build(self) -> Result<SipServer> {
        let config = self.config;
        let cancel_token = self.cancel_token.unwrap_or_default();
        let routing = self.routing.ok_or_else(|| anyhow!("routing engine not set"))?;
        let firewall = self.firewall.ok_or_else(|| anyhow!("firewall not set"))?;
        let call_control = self
            .call_control
            .ok_or_else(|| anyhow!("call control not set"))?;
        let terminations = self
            .terminations
            .ok_or_else(|| anyhow!("termination channel not set"))?;

        let local_ip = config
            .addr
            .parse::<IpAddr>()
            .map_err(|e| anyhow!("failed to parse listen address: {}", e))?;
        let local_addr = SocketAddr::new(local_ip, config.sip_port);

        let transport_layer = TransportLayer::new(cancel_token.clone());
        match config.sip_protocol {
            SipProtocol::Udp => {
                let conn = UdpConnection::create_connection(
                    local_addr,
                    None,
                    Some(cancel_token.child_token()),
                )
                .await
                .map_err(|e| anyhow!("failed to bind UDP listener {}: {}", local_addr, e))?;
                transport_layer.add_transport(conn.into());
            }
            SipProtocol::Tcp => {
                let conn = TcpListenerConnection::new(local_addr.into(), None)
                    .await
                    .map_err(|e| anyhow!("failed to bind TCP listener {}: {}", local_addr, e))?;
                transport_layer.add_transport(conn.into());
            }
            SipProtocol::Tls => {
                // TLS termination is delegated to the edge in front of us
                return Err(anyhow!(
                    "sip_protocol=tls is not served directly; terminate TLS upstream and listen with udp or tcp"
                ));
            }
        }
        info!("SIP listener on {} ({:?})", local_addr, config.sip_protocol);

        let mut endpoint_builder = EndpointBuilder::new();
        if let Some(ref useragent) = config.useragent {
            endpoint_builder.with_user_agent(useragent.as_str());
        }
        let endpoint = endpoint_builder
            .with_cancel_token(cancel_token.clone())
            .with_transport_layer(transport_layer)
            .build();

        let inner = Arc::new(SipServerInner {
            cancel_token,
            config,
            routing,
            firewall,
            call_control,
            endpoint,
            pending_invites: Mutex::new(HashMap::new()),
        });

        tokio::spawn(Self::terminate_loop(inner.clone(), terminations));

        Ok(SipServer { inner })
    }

    /// Consume force-terminate events from the billing workers and send
    /// BYE toward both dialog ends.
    async fn terminate_loop(
        inner: SipServerRef,
        mut terminations: mpsc::UnboundedReceiver<ActiveCall>,
    ) {
        loop {
            let call = tokio::select! {
                _ = inner.cancel_token.cancelled() => break,
                call = terminations.recv() => match call {
                    Some(call) => call,
                    None => break,
                },
            };
            info!(call_id = %call.call_id, "tearing down call after failed deduction");
            session::send_dialog_byes(&inner, &call).await;
        }
    }
}

impl SipServer {
    pub async fn serve(&self) -> Result<()> {
        let incoming = self.inner.endpoint.incoming_transactions()?;
        let cancel_token = self.inner.cancel_token.clone();
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("cancelled");
            }
            _ = self.inner.endpoint.serve() => {
                info!("endpoint finished");
            }
            _ = self.handle_incoming(incoming) => {
                info!("incoming transactions stopped");
            }
        };
        info!("stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.cancel_token.cancel();
    }

    async fn handle_incoming(&self, mut incoming: TransactionReceiver) -> Result<()> {
        while let Some(mut tx) = incoming.recv().await {
            debug!(key = %tx.key, "received transaction");
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_transaction(inner, &mut tx).await {
                    warn!(key = %tx.key, "failed to process transaction: {}", e);
                }
            });
        }
        Ok(())
    }
}

/// The per-method skeleton every request goes through: admission,
/// accounting, then dispatch.
pub async fn handle_transaction(
    inner: SipServerRef,
    tx: &mut rsipstack::transaction::transaction::Transaction,
) -> Result<()> {
    let source = observed_source(tx);

    if let Some(ref source) = source {
        if !inner.firewall.is_allowed(&source.ip) {
            // no response at all, a reply would be an amplification vector
            crate::metrics::firewall::blocked();
            debug!(ip = %source.ip, method = %tx.original.method, "dropping request from blacklisted source");
            return Ok(());
        }
    }

    let tenant_id = tenant_id(&tx.original);
    crate::metrics::sip::request(&tx.original.method.to_string(), &tenant_id);

    match tx.original.method {
        rsip::Method::Register => register::handle_register(&inner, tx, source).await,
        rsip::Method::Invite => invite::handle_invite(&inner, tx, &tenant_id).await,
        rsip::Method::Cancel => invite::handle_cancel(&inner, tx).await,
        rsip::Method::Bye => session::handle_bye(&inner, tx).await,
        rsip::Method::Message => session::handle_message(&inner, tx).await,
        rsip::Method::Options => session::handle_options(tx).await,
        rsip::Method::Ack => session::handle_ack(&inner, tx).await,
        _ => {
            tx.reply(rsip::StatusCode::MethodNotAllowed).await.ok();
            Ok(())
        }
    }
}

/// Tenant label for metrics, read from `X-Tenant-ID`.
pub fn tenant_id(request: &rsip::Request) -> String {
    request
        .headers
        .iter()
        .find_map(|header| match header {
            rsip::Header::Other(name, value) if name.eq_ignore_ascii_case("X-Tenant-ID") => {
                Some(value.trim().to_string())
            }
            _ => None,
        })
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

pub fn observed_source(
    tx: &rsipstack::transaction::transaction::Transaction,
) -> Option<SourceInfo> {
    let via = tx.original.via_header().ok()?;
    let target = SipConnection::parse_target_from_via(via).ok()?;
    let ip: IpAddr = target.1.host.clone().try_into().ok()?;
    let port = target.1.port.map(|p| *p.value()).unwrap_or(5060);
    let transport = tx
        .connection
        .as_ref()
        .map(|conn| conn.get_addr().r#type)
        .flatten()
        .unwrap_or(rsip::Transport::Udp);
    Some(SourceInfo {
        ip,
        contact: format!(
            "{}:{};transport={}",
            ip,
            port,
            transport.to_string().to_lowercase()
        ),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::billing::MemoryLedger;
    use crate::callcontrol::CallControlOptions;
    use crate::location::{Locator, MemoryLocator};
    use rsip::headers::UntypedHeader;
    use rsipstack::transaction::endpoint::EndpointInner;
    use rsipstack::transaction::key::{TransactionKey, TransactionRole};
    use rsipstack::transaction::random_text;
    use rsipstack::transaction::transaction::Transaction;
    use rsipstack::transport::channel::ChannelConnection;
    use rsipstack::transport::SipAddr;
    use std::time::Duration;

    /// A server with memory backends and no live sockets, enough to
    /// exercise the handler paths.
    pub async fn test_server() -> (SipServerRef, Arc<MemoryLocator>, Arc<MemoryLedger>) {
        let config = Arc::new(Config::default());
        let locator = Arc::new(MemoryLocator::new());
        let ledger = Arc::new(MemoryLedger::new());
        let routing = Arc::new(RoutingEngine::new(
            locator.clone(),
            ledger.clone(),
            &config,
        ));
        let firewall = Arc::new(Firewall::new(config.fw_threshold));
        let cancel_token = CancellationToken::new();
        let (call_control, _terminations) = CallControl::new(
            ledger.clone(),
            CallControlOptions::from(config.as_ref()),
            cancel_token.child_token(),
        );

        let endpoint = EndpointBuilder::new().build();
        let inner = Arc::new(SipServerInner {
            cancel_token,
            config,
            routing,
            firewall,
            call_control,
            endpoint,
            pending_invites: Mutex::new(HashMap::new()),
        });
        (inner, locator, ledger)
    }

    /// A server transaction over a channel transport, the same harness
    /// shape rsipstack integration tests use.
    pub async fn test_transaction(request: rsip::Request) -> Transaction {
        let mock_addr = SipAddr {
            r#type: Some(rsip::Transport::Udp),
            addr: rsip::HostWithPort {
                host: "127.0.0.1".parse().unwrap(),
                port: Some(5060.into()),
            },
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = ChannelConnection::create_connection(receiver, sender, mock_addr, None)
            .await
            .expect("channel connection");
        let transport_layer = TransportLayer::new(CancellationToken::new());
        transport_layer.add_transport(connection.into());

        let endpoint_inner = EndpointInner::new(
            "sipedge test".to_string(),
            transport_layer,
            CancellationToken::new(),
            Some(Duration::from_millis(20)),
            vec![rsip::Method::Invite, rsip::Method::Register],
            None,
            None,
            None,
            None,
        );

        let key = TransactionKey::from_request(&request, TransactionRole::Server).unwrap();
        Transaction::new_server(key, request, endpoint_inner, None)
    }

    pub fn test_request(
        method: rsip::Method,
        from: &str,
        to: &str,
        source_ip: &str,
        extra_headers: Vec<rsip::Header>,
    ) -> rsip::Request {
        let from_uri: rsip::Uri = from.try_into().unwrap();
        let to_uri: rsip::Uri = to.try_into().unwrap();
        let via = rsip::headers::Via::new(format!(
            "SIP/2.0/UDP {}:5060;branch=z9hG4bK{}",
            source_ip,
            random_text(8)
        ));
        let mut headers: Vec<rsip::Header> = vec![
            via.into(),
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
            rsip::headers::CallId::new(random_text(12)).into(),
            rsip::typed::CSeq {
                seq: 1u32.into(),
                method,
            }
            .into(),
            rsip::Header::MaxForwards(70.into()),
        ];
        headers.extend(extra_headers);

        rsip::Request {
            method,
            uri: to_uri,
            version: rsip::Version::V2,
            headers: headers.into(),
            body: vec![],
        }
    }

    #[test]
    fn tenant_defaults_without_header() {
        let request = test_request(
            rsip::Method::Invite,
            "sip:100@ua.example",
            "sip:200@ua.example",
            "10.0.0.7",
            vec![],
        );
        assert_eq!(tenant_id(&request), "default");
    }

    #[test]
    fn tenant_reads_custom_header() {
        let request = test_request(
            rsip::Method::Invite,
            "sip:100@ua.example",
            "sip:200@ua.example",
            "10.0.0.7",
            vec![rsip::Header::Other(
                "X-Tenant-ID".to_string(),
                "acme".to_string(),
            )],
        );
        assert_eq!(tenant_id(&request), "acme");
    }

    #[tokio::test]
    async fn source_is_read_from_via() {
        let request = test_request(
            rsip::Method::Register,
            "sip:100@ua.example",
            "sip:100@ua.example",
            "10.0.0.7",
            vec![],
        );
        let tx = test_transaction(request).await;
        let source = observed_source(&tx).expect("source");
        assert_eq!(source.ip, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(source.contact, "10.0.0.7:5060;transport=udp");
    }

    #[tokio::test]
    async fn blacklisted_source_is_dropped_silently() {
        let (inner, locator, _) = test_server().await;
        let attacker: IpAddr = "203.0.113.9".parse().unwrap();
        for _ in 0..5 {
            inner.firewall.record_failed_auth(attacker);
        }

        let request = test_request(
            rsip::Method::Register,
            "sip:100@ua.example",
            "sip:100@ua.example",
            "203.0.113.9",
            vec![],
        );
        let mut tx = test_transaction(request).await;
        handle_transaction(inner, &mut tx).await.unwrap();

        // dropped before routing: nothing was stored
        assert!(locator.lookup("sip:100@localhost").await.is_err());
        assert!(tx.last_response.is_none());
    }
}
