use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

/// Observes which node currently holds control-plane leadership. Leadership
/// comes from the replicated SQL store's own consensus; the control plane
/// never runs its own election.
pub trait LeadershipMonitor: Send + Sync {
    fn watch(&self) -> watch::Receiver<bool>;

    fn is_leader(&self) -> bool {
        *self.watch().borrow()
    }
}

/// Fixed leadership for tests and single-node deployments.
pub struct StaticLeadership {
    tx: watch::Sender<bool>,
}

impl StaticLeadership {
    #[must_use]
    pub fn new(leader: bool) -> Self {
        let (tx, _) = watch::channel(leader);
        Self { tx }
    }

    /// Flip leadership at runtime.
    pub fn set(&self, leader: bool) {
        self.tx.send_replace(leader);
    }
}

impl LeadershipMonitor for StaticLeadership {
    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Polls the replicated store's status endpoint and reports whether this
/// node's SQL instance is the store leader.
pub struct StoreLeadership {
    tx: watch::Sender<bool>,
}

impl StoreLeadership {
    /// Start the poll loop. `self_addr` is the address the local store
    /// instance advertises to its consensus peers.
    #[must_use]
    pub fn spawn(endpoints: Vec<String>, self_addr: String) -> (Self, JoinHandle<()>) {
        let (tx, _) = watch::channel(false);
        let monitor = Self { tx: tx.clone() };

        let handle = tokio::spawn(async move {
            let http = reqwest::Client::new();
            loop {
                let leader_addr = Self::query_leader(&http, &endpoints).await;
                let is_leader = leader_addr.as_deref() == Some(self_addr.as_str());
                let changed = tx.send_if_modified(|current| {
                    if *current == is_leader {
                        false
                    } else {
                        *current = is_leader;
                        true
                    }
                });
                if changed {
                    info!(is_leader, leader = ?leader_addr, "leadership changed");
                }
                sleep(orama_config::timeouts::probe_interval()).await;
            }
        });

        (monitor, handle)
    }

    async fn query_leader(http: &reqwest::Client, endpoints: &[String]) -> Option<String> {
        for endpoint in endpoints {
            let url = format!("{}/status", endpoint.trim_end_matches('/'));
            match http.get(&url).send().await {
                Ok(response) => {
                    let Ok(body) = response.json::<Value>().await else {
                        continue;
                    };
                    let leader = body
                        .pointer("/store/leader/addr")
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned);
                    if leader.is_some() {
                        return leader;
                    }
                    debug!(%url, "status response carried no leader");
                }
                Err(err) => {
                    warn!(%url, error = %err, "leadership status unreachable");
                }
            }
        }
        None
    }
}

impl LeadershipMonitor for StoreLeadership {
    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
