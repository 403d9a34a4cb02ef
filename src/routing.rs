use crate::billing::{Ledger, LedgerError};
use crate::config::Config;
use crate::error::Error;
use crate::location::{LocationError, Locator};
use rsip::headers::UntypedHeader;
use rsip::prelude::HeadersExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    /// REGISTER absorbed locally, nothing to forward
    Registered,
    /// Contact string of the next hop, `host[:port][;transport=…]`
    NextHop(String),
}

/// Maps an admitted request to a next-hop contact.
///
/// Registrations are fanned out under every dial-plan variant of the AOR
/// up front, so the hot dial path is a plain first-hit key scan instead
/// of a search.
pub struct RoutingEngine {
    locator: Arc<dyn Locator>,
    ledger: Arc<dyn Ledger>,
    reg_ttl: Duration,
    country_codes: Vec<String>,
}

impl RoutingEngine {
    pub fn new(locator: Arc<dyn Locator>, ledger: Arc<dyn Ledger>, config: &Config) -> Self {
        let mut country_codes = config.country_codes.clone();
        // longest match must win regardless of configured order
        country_codes.sort_by(|a, b| b.len().cmp(&a.len()));
        Self {
            locator,
            ledger,
            reg_ttl: Duration::from_secs(config.reg_ttl),
            country_codes,
        }
    }

    /// `source` is the observed transport source of the request, rendered
    /// as a contact string; REGISTER pins the stored contact to it.
    pub async fn route(
        &self,
        request: &rsip::Request,
        source: Option<&str>,
    ) -> Result<RouteTarget, Error> {
        match request.method {
            rsip::Method::Register => self.handle_register(request, source).await,
            _ => self.handle_generic(request).await,
        }
    }

    async fn handle_register(
        &self,
        request: &rsip::Request,
        source: Option<&str>,
    ) -> Result<RouteTarget, Error> {
        let from_uri = request
            .from_header()
            .and_then(|from| from.uri())
            .map_err(Error::parse)?;
        let keys = self.registration_keys(&from_uri);

        let expires = request
            .expires_header()
            .and_then(|header| header.value().parse::<u32>().ok());
        if expires == Some(0) {
            for key in &keys {
                self.locator.unregister(key).await.ok();
            }
            info!(aor = %from_uri, "registration removed");
            return Ok(RouteTarget::Registered);
        }

        let contact = source
            .filter(|contact| !contact.is_empty())
            .ok_or_else(|| Error::Parse("no observed source".to_string()))?;
        for key in &keys {
            self.locator
                .register(key, contact, self.reg_ttl)
                .await
                .map_err(Error::transport)?;
        }
        info!(aor = %from_uri, %contact, keys = keys.len(), "registration stored");
        Ok(RouteTarget::Registered)
    }

    async fn handle_generic(&self, request: &rsip::Request) -> Result<RouteTarget, Error> {
        if matches!(request.method, rsip::Method::Invite | rsip::Method::Message) {
            let from = request
                .from_header()
                .and_then(|from| from.uri())
                .map_err(Error::parse)?
                .to_string();
            let to = request
                .to_header()
                .and_then(|to| to.uri())
                .map_err(Error::parse)?
                .to_string();
            match self.ledger.can_call(&from, &to) {
                Ok(true) => {}
                Ok(false) => return Err(Error::InsufficientBalance),
                Err(LedgerError::InsufficientFunds) => return Err(Error::InsufficientBalance),
                Err(e) => {
                    warn!(%from, error = %e, "ledger unavailable, permitting call");
                }
            }
        }

        let to_uri = request
            .to_header()
            .and_then(|to| to.uri())
            .map_err(Error::parse)?;
        for key in self.lookup_keys(&to_uri) {
            match self.locator.lookup(&key).await {
                Ok(contact) => {
                    debug!(%key, %contact, "next hop resolved");
                    return Ok(RouteTarget::NextHop(contact));
                }
                Err(LocationError::NotFound) => continue,
                Err(e) => {
                    warn!(%key, error = %e, "location store lookup failed, trying next key");
                    continue;
                }
            }
        }
        Err(Error::NotRegistered)
    }

    /// Keys a registration is stored under, deduplicated in order.
    fn registration_keys(&self, aor: &rsip::Uri) -> Vec<String> {
        let user = aor.user().unwrap_or_default();
        let stripped = self.strip_dial_prefix(user);
        let domain = aor.host().to_string();

        let mut keys = vec![
            aor.to_string(),
            format!("sip:{}@localhost", user),
            format!("sip:{}@localhost", stripped),
        ];
        if !domain.is_empty() {
            keys.push(format!("sip:{}@{}", stripped, domain));
            keys.push(format!("sip:0{}@{}", stripped, domain));
            keys.push(format!("sip:0{}@localhost", stripped));
        }
        dedup_in_order(keys)
    }

    /// Candidate lookup keys for a dialed destination; first hit wins.
    fn lookup_keys(&self, target: &rsip::Uri) -> Vec<String> {
        let user = target.user().unwrap_or_default();
        let stripped = self.strip_dial_prefix(user);
        let domain = target.host().to_string();

        let keys = vec![
            target.to_string(),
            format!("sip:{}@{}", user, domain),
            format!("sip:{}@{}", stripped, domain),
            format!("sip:0{}@{}", stripped, domain),
            format!("sip:{}@localhost", user),
            format!("sip:{}@localhost", stripped),
            format!("sip:0{}@localhost", stripped),
        ];
        dedup_in_order(keys)
    }

    /// Reduce a dialed number to its national core: drop `+`, then a
    /// known country code when at least three digits follow it, then one
    /// optional leading zero.
    fn strip_dial_prefix(&self, user: &str) -> String {
        let digits = user.strip_prefix('+').unwrap_or(user);
        for code in &self.country_codes {
            if let Some(rest) = digits.strip_prefix(code.as_str()) {
                if rest.len() >= 3 {
                    return rest.strip_prefix('0').unwrap_or(rest).to_string();
                }
            }
        }
        digits.strip_prefix('0').unwrap_or(digits).to_string()
    }
}

fn dedup_in_order(keys: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::MemoryLedger;
    use crate::location::MemoryLocator;

    fn engine() -> (RoutingEngine, Arc<MemoryLocator>, Arc<MemoryLedger>) {
        let locator = Arc::new(MemoryLocator::new());
        let ledger = Arc::new(MemoryLedger::new());
        let engine = RoutingEngine::new(
            locator.clone(),
            ledger.clone(),
            &Config::default(),
        );
        (engine, locator, ledger)
    }

    fn request(method: rsip::Method, from: &str, to: &str) -> rsip::Request {
        let from_uri: rsip::Uri = from.try_into().unwrap();
        let to_uri: rsip::Uri = to.try_into().unwrap();
        let headers: Vec<rsip::Header> = vec![
            rsip::typed::From {
                display_name: None,
                uri: from_uri,
                params: vec![rsip::Param::Tag(rsip::param::Tag::new("tag-a"))],
            }
            .into(),
            rsip::typed::To {
                display_name: None,
                uri: to_uri.clone(),
                params: vec![],
            }
            .into(),
            rsip::headers::CallId::new("test-call-id").into(),
            rsip::typed::CSeq {
                seq: 1u32.into(),
                method,
            }
            .into(),
        ];
        rsip::Request {
            method,
            uri: to_uri,
            version: rsip::Version::V2,
            headers: headers.into(),
            body: vec![],
        }
    }

    #[test]
    fn dial_prefix_stripping() {
        let (engine, _, _) = engine();
        assert_eq!(engine.strip_dial_prefix("+972528123456"), "528123456");
        assert_eq!(engine.strip_dial_prefix("972528123456"), "528123456");
        // optional zero after the country code
        assert_eq!(engine.strip_dial_prefix("9720528123456"), "528123456");
        assert_eq!(engine.strip_dial_prefix("07911123456"), "7911123456");
        // too few digits after a match leaves the number alone
        assert_eq!(engine.strip_dial_prefix("100"), "100");
        assert_eq!(engine.strip_dial_prefix("4401"), "4401");
    }

    #[test]
    fn longest_code_wins_regardless_of_config_order() {
        let locator = Arc::new(MemoryLocator::new());
        let ledger = Arc::new(MemoryLedger::new());
        let mut config = Config::default();
        config.country_codes = vec!["9".to_string(), "972".to_string(), "97".to_string()];
        let engine = RoutingEngine::new(locator, ledger, &config);
        assert_eq!(engine.strip_dial_prefix("972528123456"), "528123456");
    }

    #[test]
    fn stripping_is_idempotent() {
        let (engine, _, _) = engine();
        for number in ["0528123456", "+972528123456", "100", "7911123456"] {
            let once = engine.strip_dial_prefix(number);
            let twice = engine.strip_dial_prefix(&once);
            assert_eq!(once, twice, "stripping {} twice diverged", number);
        }
    }

    #[tokio::test]
    async fn register_fans_out_keys() {
        let (engine, locator, _) = engine();
        let req = request(
            rsip::Method::Register,
            "sip:100@ua.example",
            "sip:100@ua.example",
        );
        let target = engine
            .route(&req, Some("10.0.0.7:5060;transport=tcp"))
            .await
            .unwrap();
        assert_eq!(target, RouteTarget::Registered);

        for key in ["sip:100@ua.example", "sip:100@localhost"] {
            assert_eq!(
                locator.lookup(key).await.unwrap(),
                "10.0.0.7:5060;transport=tcp",
                "missing fan-out key {}",
                key
            );
        }
    }

    #[tokio::test]
    async fn register_twice_is_observably_identical() {
        let (engine, locator, _) = engine();
        let req = request(
            rsip::Method::Register,
            "sip:100@ua.example",
            "sip:100@ua.example",
        );
        engine.route(&req, Some("10.0.0.7:5060")).await.unwrap();
        engine.route(&req, Some("10.0.0.7:5060")).await.unwrap();
        assert_eq!(
            locator.lookup("sip:100@localhost").await.unwrap(),
            "10.0.0.7:5060"
        );
    }

    #[tokio::test]
    async fn register_with_zero_expires_unregisters() {
        let (engine, locator, _) = engine();
        let req = request(
            rsip::Method::Register,
            "sip:100@ua.example",
            "sip:100@ua.example",
        );
        engine.route(&req, Some("10.0.0.7:5060")).await.unwrap();

        let mut dereg = request(
            rsip::Method::Register,
            "sip:100@ua.example",
            "sip:100@ua.example",
        );
        dereg.headers.push(rsip::Header::Expires(0.into()));

        engine.route(&dereg, Some("10.0.0.7:5060")).await.unwrap();
        assert!(locator.lookup("sip:100@localhost").await.is_err());
        assert!(locator.lookup("sip:100@ua.example").await.is_err());
    }

    #[tokio::test]
    async fn invite_routes_to_registered_callee() {
        let (engine, _, _) = engine();
        let reg = request(
            rsip::Method::Register,
            "sip:200@ua.example",
            "sip:200@ua.example",
        );
        engine.route(&reg, Some("10.0.0.9:5070;transport=udp")).await.unwrap();

        let invite = request(
            rsip::Method::Invite,
            "sip:100@ua.example",
            "sip:200@ua.example",
        );
        let target = engine.route(&invite, None).await.unwrap();
        assert_eq!(
            target,
            RouteTarget::NextHop("10.0.0.9:5070;transport=udp".to_string())
        );
    }

    #[tokio::test]
    async fn invite_tolerates_dial_plan_variants() {
        let (engine, _, _) = engine();
        // callee registers under the international form
        let reg = request(
            rsip::Method::Register,
            "sip:+972528123456@ua.example",
            "sip:+972528123456@ua.example",
        );
        engine.route(&reg, Some("10.0.0.9:5070")).await.unwrap();

        // caller dials the local form with the leading zero
        let invite = request(
            rsip::Method::Invite,
            "sip:100@ua.example",
            "sip:0528123456@other.example",
        );
        let target = engine.route(&invite, None).await.unwrap();
        assert_eq!(target, RouteTarget::NextHop("10.0.0.9:5070".to_string()));
    }

    #[tokio::test]
    async fn invite_to_unknown_user_is_not_registered() {
        let (engine, _, _) = engine();
        let invite = request(rsip::Method::Invite, "sip:100@ua.example", "sip:999@x");
        assert!(matches!(
            engine.route(&invite, None).await,
            Err(Error::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn invite_without_balance_is_refused() {
        let (engine, _, ledger) = engine();
        ledger.set_balance("sip:100@localhost", 0.0);
        let invite = request(
            rsip::Method::Invite,
            "sip:100@ua.example",
            "sip:200@ua.example",
        );
        assert!(matches!(
            engine.route(&invite, None).await,
            Err(Error::InsufficientBalance)
        ));
    }

    #[tokio::test]
    async fn bye_is_not_billing_gated() {
        let (engine, _, ledger) = engine();
        ledger.set_balance("sip:100@localhost", 0.0);
        let reg = request(
            rsip::Method::Register,
            "sip:200@ua.example",
            "sip:200@ua.example",
        );
        engine.route(&reg, Some("10.0.0.9:5070")).await.unwrap();

        let bye = request(rsip::Method::Bye, "sip:100@ua.example", "sip:200@ua.example");
        assert!(engine.route(&bye, None).await.is_ok());
    }

    #[tokio::test]
    async fn first_key_hit_wins() {
        let (engine, locator, _) = engine();
        locator
            .register("sip:200@ua.example", "10.0.0.1:5060", Duration::from_secs(60))
            .await
            .unwrap();
        locator
            .register("sip:200@localhost", "10.0.0.2:5060", Duration::from_secs(60))
            .await
            .unwrap();

        let invite = request(
            rsip::Method::Invite,
            "sip:100@ua.example",
            "sip:200@ua.example",
        );
        // exact key precedes the localhost variants
        assert_eq!(
            engine.route(&invite, None).await.unwrap(),
            RouteTarget::NextHop("10.0.0.1:5060".to_string())
        );
    }
}
