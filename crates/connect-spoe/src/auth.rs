//! The `check-intentions` responder.
//!
//! For each new mesh connection the proxy hands over the caller's DER
//! certificate; the responder derives the caller's identity from the
//! first URI SAN and asks the mesh whether that identity may connect to
//! this service. Two caches keep the hot path cheap:
//!
//! - a decode cache for parsed certificates (60 s TTL, 128 entries)
//! - a single-flight decision cache per caller URI (1 s TTL): the first
//!   lookup launches the fetch, every concurrent lookup waits on the
//!   same completion signal, and nobody waits longer than 1 s
//!
//! A failed fetch is recorded as "not authorized" with a zero stamp, so
//! the next lookup retries immediately: fail closed, recover fast.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use connect_core::{Error, Result};
use connect_mesh::api::AuthorizeRequest;
use connect_mesh::MeshClient;
use tokio::sync::watch;
use tracing::{debug, error};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::agent::MessageHandler;
use crate::frame::{Action, Message, TypedData, VarScope};

/// How long one authorization decision stays fresh.
const DECISION_TTL: Duration = Duration::from_secs(1);
/// How long a caller may wait for a decision.
const DECISION_DEADLINE: Duration = Duration::from_secs(1);
/// Decode cache tuning.
const CERT_CACHE_TTL: Duration = Duration::from_secs(60);
const CERT_CACHE_CAPACITY: usize = 128;

/// The message name this handler answers.
pub const MESSAGE_NAME: &str = "check-intentions";

/// Identity extracted from a caller certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallerIdentity {
    /// The first URI SAN, verbatim.
    uri: String,
    /// Lowercase hex serial.
    serial_hex: String,
    /// Service name parsed from the URI path (empty if not a service).
    service: String,
}

/// Handler answering `check-intentions` messages.
pub struct IntentionsHandler {
    client: Arc<dyn MeshClient>,
    /// The authorization target; follows the watcher's resolved name.
    target: Arc<RwLock<String>>,
    cert_cache: Mutex<CertCache>,
    decisions: Mutex<HashMap<String, Arc<DecisionEntry>>>,
}

struct DecisionEntry {
    /// `(authorized, stamped_at)`; a `None` stamp forces the next lookup
    /// to refetch.
    result: Mutex<(bool, Option<Instant>)>,
    done: watch::Sender<bool>,
}

impl IntentionsHandler {
    /// Create a handler asking `client` about connections to `target`.
    pub fn new(client: Arc<dyn MeshClient>, target: Arc<RwLock<String>>) -> Self {
        Self {
            client,
            target,
            cert_cache: Mutex::new(CertCache::new(CERT_CACHE_CAPACITY, CERT_CACHE_TTL)),
            decisions: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether `uri` may connect, with single-flight fetching and
    /// the 1 s wait deadline.
    async fn is_authorized(&self, identity: &CallerIdentity) -> Result<bool> {
        let entry = {
            let mut decisions = self.decisions.lock().expect("decision lock poisoned");
            let now = Instant::now();
            let reusable = decisions.get(&identity.uri).and_then(|entry| {
                let result = entry.result.lock().expect("entry lock poisoned");
                match result.1 {
                    Some(at) if now.duration_since(at) <= DECISION_TTL => {
                        Some(entry.clone())
                    }
                    _ => None,
                }
            });
            match reusable {
                Some(entry) => entry,
                None => {
                    let entry = Arc::new(DecisionEntry {
                        result: Mutex::new((false, Some(now))),
                        done: watch::channel(false).0,
                    });
                    decisions.insert(identity.uri.clone(), entry.clone());
                    self.spawn_fetch(identity.clone(), entry.clone());
                    entry
                }
            }
        };

        let mut done = entry.done.subscribe();
        let completed =
            tokio::time::timeout(DECISION_DEADLINE, done.wait_for(|done| *done)).await;
        match completed {
            Ok(_) => {
                let result = entry.result.lock().expect("entry lock poisoned");
                Ok(result.0)
            }
            // The in-flight fetch keeps running and completes the entry
            // for later callers.
            Err(_) => Err(Error::AuthzTimeout {
                waited: DECISION_DEADLINE,
            }),
        }
    }

    fn spawn_fetch(&self, identity: CallerIdentity, entry: Arc<DecisionEntry>) {
        let client = self.client.clone();
        let target = self.target.read().expect("target lock poisoned").clone();
        tokio::spawn(async move {
            let request = AuthorizeRequest {
                target,
                client_cert_uri: identity.uri.clone(),
                client_cert_serial: identity.serial_hex.clone(),
            };
            let fetched = client.authorize(&request).await;

            {
                let mut result = entry.result.lock().expect("entry lock poisoned");
                match fetched {
                    Ok(response) => {
                        debug!(
                            uri = %identity.uri,
                            authorized = response.authorized,
                            reason = %response.reason,
                            "authorization decision"
                        );
                        result.0 = response.authorized;
                    }
                    Err(err) => {
                        error!(uri = %identity.uri, %err, "authorization fetch failed");
                        result.0 = false;
                        // Zero stamp: the next lookup refetches.
                        result.1 = None;
                    }
                }
            }
            // send_replace: the completion must land even if no waiter
            // has subscribed yet.
            entry.done.send_replace(true);
        });
    }

    fn decode_certificate(&self, der: &[u8]) -> Result<CallerIdentity> {
        if let Some(identity) = self
            .cert_cache
            .lock()
            .expect("cert cache lock poisoned")
            .get(der)
        {
            return Ok(identity);
        }

        let (_, cert) = X509Certificate::from_der(der).map_err(|e| {
            Error::InvalidCertificate {
                reason: e.to_string(),
            }
        })?;

        let uri = first_uri_san(&cert).ok_or_else(|| Error::InvalidCertificate {
            reason: "certificate has no URI SAN".to_string(),
        })?;

        let identity = CallerIdentity {
            serial_hex: hex_encode(cert.raw_serial()),
            service: spiffe_service(&uri).unwrap_or_default(),
            uri,
        };

        self.cert_cache
            .lock()
            .expect("cert cache lock poisoned")
            .put(der.to_vec(), identity.clone());
        Ok(identity)
    }
}

#[async_trait]
impl MessageHandler for IntentionsHandler {
    async fn handle(&self, message: &Message) -> Vec<Action> {
        if message.name != MESSAGE_NAME {
            return Vec::new();
        }

        let der = match message.arg("cert") {
            Some(TypedData::Binary(der)) => der,
            Some(other) => {
                error!(got = ?other, "cert argument has wrong type");
                return Vec::new();
            }
            None => {
                error!("cert argument is required");
                return Vec::new();
            }
        };

        let identity = match self.decode_certificate(der) {
            Ok(identity) => identity,
            Err(err) => {
                error!(%err, "could not decode caller certificate");
                return Vec::new();
            }
        };

        let authorized = match self.is_authorized(&identity).await {
            Ok(authorized) => authorized,
            Err(err) => {
                error!(uri = %identity.uri, %err, "authorization lookup failed");
                false
            }
        };

        vec![
            Action::SetVar {
                scope: VarScope::Session,
                name: "auth".to_string(),
                value: TypedData::Int32(i32::from(authorized)),
            },
            Action::SetVar {
                scope: VarScope::Session,
                name: "source_app".to_string(),
                value: TypedData::String(identity.service.clone()),
            },
        ]
    }
}

fn first_uri_san(cert: &X509Certificate<'_>) -> Option<String> {
    let san = cert.subject_alternative_name().ok().flatten()?;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::URI(uri) => Some((*uri).to_string()),
        _ => None,
    })
}

/// Service component of a mesh identity URI
/// (`spiffe://<domain>/ns/<ns>/dc/<dc>/svc/<service>`).
fn spiffe_service(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("spiffe://")?;
    let path = rest.split_once('/')?.1;
    let mut segments = path.split('/');
    loop {
        match segments.next() {
            Some("svc") => {
                let service = segments.next()?;
                return (!service.is_empty()).then(|| service.to_string());
            }
            Some(_) => continue,
            None => return None,
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Fixed-capacity decode cache with per-entry TTL and LRU eviction.
struct CertCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<Vec<u8>, (Instant, CallerIdentity)>,
    order: VecDeque<Vec<u8>>,
}

impl CertCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<CallerIdentity> {
        let (stored_at, identity) = self.entries.get(key)?;
        if stored_at.elapsed() > self.ttl {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        let identity = identity.clone();
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_vec());
        Some(identity)
    }

    fn put(&mut self, key: Vec<u8>, identity: CallerIdentity) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        self.order.retain(|k| k != &key);
        self.order.push_back(key.clone());
        self.entries.insert(key, (Instant::now(), identity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_mesh::api::{
        AgentService, AuthorizeResponse, CaRootList, LeafCertificate, ServiceEntry,
    };
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Self-signed test certificate with
    /// URI SAN `spiffe://…/ns/default/dc/dc1/svc/web` and serial
    /// `0f:a1:b2:c3:d4`.
    const TEST_CERT_HEX: &str = "\
308201c030820165a00302010202050fa1b2c3d4300a06082a8648ce3d040302\
300e310c300a06035504030c03776562301e170d323630383032303534323230\
5a170d3336303733303035343232305a300e310c300a06035504030c03776562\
3059301306072a8648ce3d020106082a8648ce3d030107034200040dec955cb8\
82ac0050d03b977c9abd506d3840ba4d41a2d383c18e1d0b1d6b744e49f788a5\
ce00cb145c29abbb7e9ff800cc787521276116e631a006ffad3ca5a381af3081\
ac301d0603551d0e04160414fba52bf9fa9ac255475a683147503d736107d3f9\
301f0603551d23041830168014fba52bf9fa9ac255475a683147503d736107d3\
f9300f0603551d130101ff040530030101ff30590603551d1104523050864e73\
70696666653a2f2f31313131313131312d323232322d333333332d343434342d\
3535353535353535353535352e636f6e73756c2f6e732f64656661756c742f64\
632f6463312f7376632f776562300a06082a8648ce3d04030203490030460221\
00dddf12064f4facbdf3da26008162ee74d253a4b7795a795df026cf25b788bb\
eb022100f943f79ab1c8a4e9f1678f880be76f69fd7c26c9a85331e5ee6e61ab\
21eec330";

    const TEST_URI: &str =
        "spiffe://11111111-2222-3333-4444-555555555555.consul/ns/default/dc/dc1/svc/web";

    fn test_cert_der() -> Vec<u8> {
        let hex: String = TEST_CERT_HEX.chars().filter(|c| !c.is_whitespace()).collect();
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("hex fixture"))
            .collect()
    }

    /// Authorizer with scriptable latency and failures.
    struct MockAuthorizer {
        calls: AtomicU32,
        fail_first: AtomicU32,
        release: Notify,
        hold: std::sync::atomic::AtomicBool,
    }

    impl MockAuthorizer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first: AtomicU32::new(0),
                release: Notify::new(),
                hold: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl MeshClient for MockAuthorizer {
        async fn agent_services(
            &self,
        ) -> connect_core::Result<StdHashMap<String, AgentService>> {
            unimplemented!("not used by the responder")
        }
        async fn agent_service(
            &self,
            _: &str,
            _: &str,
        ) -> connect_core::Result<(AgentService, String)> {
            unimplemented!("not used by the responder")
        }
        async fn ca_roots(&self, _: u64) -> connect_core::Result<(CaRootList, u64)> {
            unimplemented!("not used by the responder")
        }
        async fn leaf_certificate(
            &self,
            _: &str,
            _: u64,
        ) -> connect_core::Result<(LeafCertificate, u64)> {
            unimplemented!("not used by the responder")
        }
        async fn service_health(
            &self,
            _: &str,
            _: &str,
            _: u64,
        ) -> connect_core::Result<(Vec<ServiceEntry>, u64)> {
            unimplemented!("not used by the responder")
        }
        async fn execute_prepared_query(
            &self,
            _: &str,
            _: &str,
        ) -> connect_core::Result<Vec<ServiceEntry>> {
            unimplemented!("not used by the responder")
        }

        async fn authorize(
            &self,
            request: &AuthorizeRequest,
        ) -> connect_core::Result<AuthorizeResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hold.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Authz {
                    reason: "scripted failure".to_string(),
                });
            }
            assert_eq!(request.target, "web");
            assert_eq!(request.client_cert_serial, "0fa1b2c3d4");
            Ok(AuthorizeResponse {
                authorized: true,
                reason: "allowed".to_string(),
            })
        }
    }

    fn handler(mock: Arc<MockAuthorizer>) -> Arc<IntentionsHandler> {
        Arc::new(IntentionsHandler::new(
            mock,
            Arc::new(RwLock::new("web".to_string())),
        ))
    }

    fn check_message() -> Message {
        Message {
            name: MESSAGE_NAME.to_string(),
            args: vec![("cert".to_string(), TypedData::Binary(test_cert_der()))],
        }
    }

    fn auth_value(actions: &[Action]) -> i32 {
        match actions
            .iter()
            .find(|a| matches!(a, Action::SetVar { name, .. } if name == "auth"))
        {
            Some(Action::SetVar {
                value: TypedData::Int32(v),
                ..
            }) => *v,
            other => panic!("no auth action: {other:?}"),
        }
    }

    #[test]
    fn spiffe_service_extraction() {
        assert_eq!(spiffe_service(TEST_URI).as_deref(), Some("web"));
        assert_eq!(
            spiffe_service("spiffe://dom.consul/ns/x/dc/y/svc/db").as_deref(),
            Some("db")
        );
        assert_eq!(spiffe_service("spiffe://dom.consul/agent/client"), None);
        assert_eq!(spiffe_service("https://not-spiffe/svc/web"), None);
    }

    #[tokio::test]
    async fn authorized_caller_sets_auth_and_source_app() {
        let mock = MockAuthorizer::new();
        let handler = handler(mock.clone());

        let actions = handler.handle(&check_message()).await;
        assert_eq!(auth_value(&actions), 1);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetVar { name, value: TypedData::String(s), .. }
                if name == "source_app" && s == "web"
        )));
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let mock = MockAuthorizer::new();
        mock.hold.store(true, Ordering::SeqCst);
        let handler = handler(mock.clone());

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle(&check_message()).await })
            })
            .collect();

        // Give every task time to join the in-flight entry.
        tokio::time::sleep(Duration::from_millis(100)).await;
        mock.release.notify_waiters();

        for task in tasks {
            let actions = task.await.expect("join");
            assert_eq!(auth_value(&actions), 1);
        }
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_decision_is_reused_and_stale_refetched() {
        let mock = MockAuthorizer::new();
        let handler = handler(mock.clone());

        handler.handle(&check_message()).await;
        handler.handle(&check_message()).await;
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1, "within TTL");

        tokio::time::sleep(DECISION_TTL + Duration::from_millis(200)).await;
        handler.handle(&check_message()).await;
        assert_eq!(mock.calls.load(Ordering::SeqCst), 2, "after TTL");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backend_answers_within_deadline() {
        let mock = MockAuthorizer::new();
        mock.hold.store(true, Ordering::SeqCst);
        let handler = handler(mock.clone());

        let started = tokio::time::Instant::now();
        let actions = handler.handle(&check_message()).await;
        assert_eq!(auth_value(&actions), 0);
        assert!(started.elapsed() >= DECISION_DEADLINE);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_authorized_and_refetches() {
        let mock = MockAuthorizer::new();
        mock.fail_first.store(1, Ordering::SeqCst);
        let handler = handler(mock.clone());

        let actions = handler.handle(&check_message()).await;
        assert_eq!(auth_value(&actions), 0, "fail closed");

        // The zero stamp forces an immediate refetch, which succeeds.
        let actions = handler.handle(&check_message()).await;
        assert_eq!(auth_value(&actions), 1);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unrelated_message_is_ignored() {
        let mock = MockAuthorizer::new();
        let handler = handler(mock.clone());

        let actions = handler
            .handle(&Message {
                name: "something-else".to_string(),
                args: Vec::new(),
            })
            .await;
        assert!(actions.is_empty());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn garbage_certificate_yields_no_actions() {
        let mock = MockAuthorizer::new();
        let handler = handler(mock.clone());

        let actions = handler
            .handle(&Message {
                name: MESSAGE_NAME.to_string(),
                args: vec![("cert".to_string(), TypedData::Binary(vec![0xde, 0xad]))],
            })
            .await;
        assert!(actions.is_empty());
    }

    #[test]
    fn cert_cache_lru_eviction() {
        let identity = CallerIdentity {
            uri: "u".to_string(),
            serial_hex: "00".to_string(),
            service: "s".to_string(),
        };
        let mut cache = CertCache::new(2, Duration::from_secs(60));
        cache.put(vec![1], identity.clone());
        cache.put(vec![2], identity.clone());
        assert!(cache.get(&[1]).is_some()); // touch 1; 2 becomes LRU
        cache.put(vec![3], identity);
        assert!(cache.get(&[2]).is_none());
        assert!(cache.get(&[1]).is_some());
        assert!(cache.get(&[3]).is_some());
    }
}
