pub mod client;
pub mod schema;

use std::sync::Arc;

use async_trait::async_trait;
use orama_config::{HostId, PlanTier};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info};

use self::client::{Row, SqlClient, Statement};
use crate::{
    model::{
        ClusterId, ClusterRecord, ClusterState, DeploymentId, DeploymentKind, DeploymentRecord,
        NamespaceId, NamespaceName, NamespaceRecord, Placement, PortReservation, Role, ServiceKind,
        unix_ts,
    },
    store::{RegistryError, RegistryResult, RegistryStore},
};

/// Registry backend over the platform's own replicated SQL store.
///
/// Change notification: the store has no push channel to this process, so a
/// background ticker bumps the watch at the route-refresh interval and
/// readers re-query on each bump.
pub struct SqlStore {
    client: SqlClient,
    changes_tx: Arc<watch::Sender<u64>>,
}

impl SqlStore {
    #[must_use]
    pub fn new(endpoints: Vec<String>) -> Self {
        let (changes_tx, _) = watch::channel(0);
        let changes_tx = Arc::new(changes_tx);

        let ticker_tx = Arc::clone(&changes_tx);
        tokio::spawn(async move {
            let interval = orama_config::timeouts::route_refresh_interval();
            loop {
                tokio::time::sleep(interval).await;
                ticker_tx.send_modify(|version| *version += 1);
            }
        });

        Self {
            client: SqlClient::new(endpoints),
            changes_tx,
        }
    }

    /// Apply the registry DDL. Safe to run from every node.
    pub async fn ensure_schema(&self) -> RegistryResult<()> {
        let statements: Vec<Statement> = schema::ALL
            .iter()
            .map(|ddl| Statement::new(*ddl, vec![]))
            .collect();
        self.client.execute(&statements).await?;
        info!("registry schema ensured");
        Ok(())
    }

    async fn cluster_rows(&self, statement: Statement) -> RegistryResult<Vec<ClusterRecord>> {
        let rows = self.client.query(statement).await?;
        rows.iter().map(|row| decode_cluster(&row)).collect()
    }
}

const CLUSTER_COLUMNS: &str =
    "id, namespace_id, state, reason, checkpoint, dns_ready, created_at, ready_at";
const NAMESPACE_COLUMNS: &str = "id, name, wallet, plan, created_at, deleted_at";
const PLACEMENT_COLUMNS: &str =
    "cluster_id, host_id, role, base_port, sql_ready, cache_ready, gateway_ready, orphaned";

fn decode_namespace(row: &Row<'_>) -> RegistryResult<NamespaceRecord> {
    let plan = row.text(3)?;
    Ok(NamespaceRecord {
        id: NamespaceId::from_string(row.text(0)?),
        name: NamespaceName::parse(row.text(1)?).map_err(|err| RegistryError::Backend {
            message: format!("corrupt namespace row: {err}"),
        })?,
        wallet: row.text(2)?,
        plan: match plan.as_str() {
            "pro" => PlanTier::Pro,
            "enterprise" => PlanTier::Enterprise,
            _ => PlanTier::Free,
        },
        created_at: row.integer(4)? as u64,
        deleted_at: row.opt_integer(5).map(|ts| ts as u64),
    })
}

fn decode_cluster(row: &Row<'_>) -> RegistryResult<ClusterRecord> {
    let state = row.text(2)?;
    Ok(ClusterRecord {
        id: ClusterId::from_string(row.text(0)?),
        namespace_id: NamespaceId::from_string(row.text(1)?),
        state: ClusterState::parse(&state).ok_or_else(|| RegistryError::Backend {
            message: format!("unknown cluster state '{state}'"),
        })?,
        reason: row.opt_text(3),
        checkpoint: row.opt_text(4),
        dns_ready: row.boolean(5)?,
        created_at: row.integer(6)? as u64,
        ready_at: row.opt_integer(7).map(|ts| ts as u64),
    })
}

fn decode_placement(row: &Row<'_>) -> RegistryResult<Placement> {
    let role = row.text(2)?;
    Ok(Placement {
        cluster_id: ClusterId::from_string(row.text(0)?),
        host_id: HostId::new(row.text(1)?),
        role: if role == "leader" {
            Role::Leader
        } else {
            Role::Follower
        },
        base_port: row.integer(3)? as u16,
        sql_ready: row.boolean(4)?,
        cache_ready: row.boolean(5)?,
        gateway_ready: row.boolean(6)?,
        orphaned: row.boolean(7)?,
    })
}

fn decode_deployment(row: &Row<'_>) -> RegistryResult<DeploymentRecord> {
    Ok(DeploymentRecord {
        id: DeploymentId::from_string(row.text(0)?),
        namespace_id: NamespaceId::from_string(row.text(1)?),
        name: row.text(2)?,
        subdomain: row.text(3)?,
        content_id: row.text(4)?,
        kind: if row.text(5)? == "server-rendered" {
            DeploymentKind::ServerRendered
        } else {
            DeploymentKind::Static
        },
    })
}

fn is_unique_violation(err: &RegistryError, token: &str) -> bool {
    match err {
        RegistryError::Backend { message } => {
            let lowered = message.to_ascii_lowercase();
            lowered.contains("unique") && lowered.contains(token)
        }
        _ => false,
    }
}

#[async_trait]
impl RegistryStore for SqlStore {
    async fn create_namespace(&self, record: NamespaceRecord) -> RegistryResult<()> {
        let statements = [
            Statement::new(
                "DELETE FROM namespaces WHERE name = ? AND deleted_at IS NOT NULL",
                vec![json!(record.name.as_str())],
            ),
            Statement::new(
                "INSERT INTO namespaces (id, name, wallet, plan, created_at, deleted_at) \
                 VALUES (?, ?, ?, ?, ?, NULL)",
                vec![
                    json!(record.id.as_str()),
                    json!(record.name.as_str()),
                    json!(record.wallet),
                    json!(record.plan.as_str()),
                    json!(record.created_at),
                ],
            ),
        ];
        self.client.execute(&statements).await.map_err(|err| {
            if is_unique_violation(&err, "namespaces") {
                RegistryError::NamespaceExists {
                    name: record.name.clone(),
                }
            } else {
                err
            }
        })?;
        debug!(namespace = %record.name, "namespace created");
        Ok(())
    }

    async fn namespace_by_name(
        &self,
        name: &NamespaceName,
    ) -> RegistryResult<Option<NamespaceRecord>> {
        let rows = self
            .client
            .query(Statement::new(
                format!(
                    "SELECT {NAMESPACE_COLUMNS} FROM namespaces \
                     WHERE name = ? AND deleted_at IS NULL"
                ),
                vec![json!(name.as_str())],
            ))
            .await?;
        rows.first().map(|row| decode_namespace(&row)).transpose()
    }

    async fn namespace_by_id(&self, id: &NamespaceId) -> RegistryResult<Option<NamespaceRecord>> {
        let rows = self
            .client
            .query(Statement::new(
                format!("SELECT {NAMESPACE_COLUMNS} FROM namespaces WHERE id = ?"),
                vec![json!(id.as_str())],
            ))
            .await?;
        rows.first().map(|row| decode_namespace(&row)).transpose()
    }

    async fn soft_delete_namespace(&self, id: &NamespaceId) -> RegistryResult<()> {
        let affected = self
            .client
            .execute(&[Statement::new(
                "UPDATE namespaces SET deleted_at = ? WHERE id = ?",
                vec![json!(unix_ts()), json!(id.as_str())],
            )])
            .await?;
        if affected == 0 {
            return Err(RegistryError::NotFound {
                entity: "namespace",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_cluster(&self, record: ClusterRecord) -> RegistryResult<()> {
        let insert = Statement::new(
            "INSERT INTO clusters \
             (id, namespace_id, state, reason, checkpoint, dns_ready, created_at, ready_at) \
             VALUES (?, ?, ?, NULL, NULL, 0, ?, NULL)",
            vec![
                json!(record.id.as_str()),
                json!(record.namespace_id.as_str()),
                json!(record.state.as_str()),
                json!(record.created_at),
            ],
        );
        match self.client.execute(&[insert]).await {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err, "clusters") => {
                // Lost the partial-unique-index race; surface the winner.
                let existing = self
                    .live_cluster_for_namespace(&record.namespace_id)
                    .await?
                    .ok_or(err)?;
                Err(RegistryError::ClusterConflict {
                    namespace_id: record.namespace_id,
                    existing: Box::new(existing),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn cluster(&self, id: &ClusterId) -> RegistryResult<Option<ClusterRecord>> {
        let rows = self
            .client
            .query(Statement::new(
                format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = ?"),
                vec![json!(id.as_str())],
            ))
            .await?;
        rows.first().map(|row| decode_cluster(&row)).transpose()
    }

    async fn live_cluster_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<Option<ClusterRecord>> {
        let rows = self
            .client
            .query(Statement::new(
                format!(
                    "SELECT {CLUSTER_COLUMNS} FROM clusters \
                     WHERE namespace_id = ? AND state NOT IN ('gone', 'failed')"
                ),
                vec![json!(namespace_id.as_str())],
            ))
            .await?;
        rows.first().map(|row| decode_cluster(&row)).transpose()
    }

    async fn latest_cluster_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<Option<ClusterRecord>> {
        let rows = self
            .client
            .query(Statement::new(
                format!(
                    "SELECT {CLUSTER_COLUMNS} FROM clusters \
                     WHERE namespace_id = ? ORDER BY created_at DESC LIMIT 1"
                ),
                vec![json!(namespace_id.as_str())],
            ))
            .await?;
        rows.first().map(|row| decode_cluster(&row)).transpose()
    }

    async fn update_cluster_state(
        &self,
        id: &ClusterId,
        state: ClusterState,
    ) -> RegistryResult<()> {
        let current = self.cluster(id).await?.ok_or_else(|| RegistryError::NotFound {
            entity: "cluster",
            id: id.to_string(),
        })?;
        if !current.state.can_transition_to(state) {
            return Err(RegistryError::IllegalTransition {
                cluster_id: id.clone(),
                from: current.state,
                to: state,
            });
        }
        // Guard on the observed state so a raced transition cannot be
        // overwritten silently.
        let affected = self
            .client
            .execute(&[Statement::new(
                "UPDATE clusters SET state = ? WHERE id = ? AND state = ?",
                vec![
                    json!(state.as_str()),
                    json!(id.as_str()),
                    json!(current.state.as_str()),
                ],
            )])
            .await?;
        if affected == 0 && current.state != state {
            return Err(RegistryError::IllegalTransition {
                cluster_id: id.clone(),
                from: current.state,
                to: state,
            });
        }
        debug!(cluster = %id, from = %current.state, to = %state, "cluster state transition");
        Ok(())
    }

    async fn save_checkpoint(&self, id: &ClusterId, checkpoint: &str) -> RegistryResult<()> {
        let affected = self
            .client
            .execute(&[Statement::new(
                "UPDATE clusters SET checkpoint = ? WHERE id = ?",
                vec![json!(checkpoint), json!(id.as_str())],
            )])
            .await?;
        if affected == 0 {
            return Err(RegistryError::NotFound {
                entity: "cluster",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_failure_reason(&self, id: &ClusterId, reason: &str) -> RegistryResult<()> {
        self.client
            .execute(&[Statement::new(
                "UPDATE clusters SET reason = ? WHERE id = ?",
                vec![json!(reason), json!(id.as_str())],
            )])
            .await
            .map(|_| ())
    }

    async fn set_dns_ready(&self, id: &ClusterId, ready: bool) -> RegistryResult<()> {
        self.client
            .execute(&[Statement::new(
                "UPDATE clusters SET dns_ready = ? WHERE id = ?",
                vec![json!(i64::from(ready)), json!(id.as_str())],
            )])
            .await
            .map(|_| ())
    }

    async fn mark_ready(&self, id: &ClusterId) -> RegistryResult<()> {
        let affected = self
            .client
            .execute(&[Statement::new(
                "UPDATE clusters SET state = 'ready', ready_at = ? \
                 WHERE id = ? AND state IN ('provisioning', 'ready')",
                vec![json!(unix_ts()), json!(id.as_str())],
            )])
            .await?;
        if affected == 0 {
            let current = self.cluster(id).await?.ok_or_else(|| RegistryError::NotFound {
                entity: "cluster",
                id: id.to_string(),
            })?;
            return Err(RegistryError::IllegalTransition {
                cluster_id: id.clone(),
                from: current.state,
                to: ClusterState::Ready,
            });
        }
        Ok(())
    }

    async fn clusters_in_state(&self, state: ClusterState) -> RegistryResult<Vec<ClusterRecord>> {
        self.cluster_rows(Statement::new(
            format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE state = ?"),
            vec![json!(state.as_str())],
        ))
        .await
    }

    async fn insert_placements(&self, placements: Vec<Placement>) -> RegistryResult<()> {
        let statements: Vec<Statement> = placements
            .iter()
            .map(|p| {
                Statement::new(
                    "INSERT OR REPLACE INTO placements \
                     (cluster_id, host_id, role, base_port, \
                      sql_ready, cache_ready, gateway_ready, orphaned) \
                     VALUES (?, ?, ?, ?, 0, 0, 0, 0)",
                    vec![
                        json!(p.cluster_id.as_str()),
                        json!(p.host_id.as_str()),
                        json!(p.role.as_str()),
                        json!(p.base_port),
                    ],
                )
            })
            .collect();
        self.client.execute(&statements).await.map(|_| ())
    }

    async fn placements(&self, cluster_id: &ClusterId) -> RegistryResult<Vec<Placement>> {
        let rows = self
            .client
            .query(Statement::new(
                format!(
                    "SELECT {PLACEMENT_COLUMNS} FROM placements \
                     WHERE cluster_id = ? ORDER BY role DESC, host_id"
                ),
                vec![json!(cluster_id.as_str())],
            ))
            .await?;
        rows.iter().map(|row| decode_placement(&row)).collect()
    }

    async fn set_service_ready(
        &self,
        cluster_id: &ClusterId,
        host_id: &HostId,
        service: ServiceKind,
        ready: bool,
    ) -> RegistryResult<()> {
        let column = match service {
            ServiceKind::Sql => "sql_ready",
            ServiceKind::Cache => "cache_ready",
            ServiceKind::Gateway => "gateway_ready",
        };
        let affected = self
            .client
            .execute(&[Statement::new(
                format!("UPDATE placements SET {column} = ? WHERE cluster_id = ? AND host_id = ?"),
                vec![
                    json!(i64::from(ready)),
                    json!(cluster_id.as_str()),
                    json!(host_id.as_str()),
                ],
            )])
            .await?;
        if affected == 0 {
            return Err(RegistryError::NotFound {
                entity: "placement",
                id: format!("{cluster_id}/{host_id}"),
            });
        }
        Ok(())
    }

    async fn mark_placement_orphan(
        &self,
        cluster_id: &ClusterId,
        host_id: &HostId,
    ) -> RegistryResult<()> {
        self.client
            .execute(&[Statement::new(
                "UPDATE placements SET orphaned = 1 WHERE cluster_id = ? AND host_id = ?",
                vec![json!(cluster_id.as_str()), json!(host_id.as_str())],
            )])
            .await
            .map(|_| ())
    }

    async fn delete_placements(&self, cluster_id: &ClusterId) -> RegistryResult<()> {
        self.client
            .execute(&[Statement::new(
                "DELETE FROM placements WHERE cluster_id = ? AND orphaned = 0",
                vec![json!(cluster_id.as_str())],
            )])
            .await
            .map(|_| ())
    }

    async fn insert_reservation(&self, reservation: PortReservation) -> RegistryResult<()> {
        let insert = Statement::new(
            "INSERT INTO port_reservations (host_id, base_port, block_size, cluster_id) \
             VALUES (?, ?, ?, ?)",
            vec![
                json!(reservation.host_id.as_str()),
                json!(reservation.base_port),
                json!(reservation.block_size),
                json!(reservation.cluster_id.as_str()),
            ],
        );
        self.client.execute(&[insert]).await.map_err(|err| {
            if is_unique_violation(&err, "port_reservations") {
                RegistryError::DuplicateReservation {
                    host_id: reservation.host_id.clone(),
                    base_port: reservation.base_port,
                }
            } else {
                err
            }
        })?;
        Ok(())
    }

    async fn release_reservation(&self, host_id: &HostId, base_port: u16) -> RegistryResult<()> {
        self.client
            .execute(&[Statement::new(
                "DELETE FROM port_reservations WHERE host_id = ? AND base_port = ?",
                vec![json!(host_id.as_str()), json!(base_port)],
            )])
            .await
            .map(|_| ())
    }

    async fn reservations_for_host(
        &self,
        host_id: &HostId,
    ) -> RegistryResult<Vec<PortReservation>> {
        let rows = self
            .client
            .query(Statement::new(
                "SELECT host_id, base_port, block_size, cluster_id \
                 FROM port_reservations WHERE host_id = ? ORDER BY base_port",
                vec![json!(host_id.as_str())],
            ))
            .await?;
        rows.iter()
            .map(|row| {
                Ok(PortReservation {
                    host_id: HostId::new(row.text(0)?),
                    base_port: row.integer(1)? as u16,
                    block_size: row.integer(2)? as u16,
                    cluster_id: ClusterId::from_string(row.text(3)?),
                })
            })
            .collect()
    }

    async fn release_reservations_for_cluster(
        &self,
        cluster_id: &ClusterId,
    ) -> RegistryResult<()> {
        self.client
            .execute(&[Statement::new(
                "DELETE FROM port_reservations WHERE cluster_id = ?",
                vec![json!(cluster_id.as_str())],
            )])
            .await
            .map(|_| ())
    }

    async fn insert_deployment(&self, record: DeploymentRecord) -> RegistryResult<()> {
        let insert = Statement::new(
            "INSERT INTO deployments (id, namespace_id, name, subdomain, content_id, kind) \
             VALUES (?, ?, ?, ?, ?, ?)",
            vec![
                json!(record.id.as_str()),
                json!(record.namespace_id.as_str()),
                json!(record.name),
                json!(record.subdomain),
                json!(record.content_id),
                json!(record.kind.as_str()),
            ],
        );
        self.client.execute(&[insert]).await.map_err(|err| {
            if is_unique_violation(&err, "deployments") {
                RegistryError::DuplicateSubdomain {
                    subdomain: record.subdomain.clone(),
                }
            } else {
                err
            }
        })?;
        Ok(())
    }

    async fn deployment_by_subdomain(
        &self,
        subdomain: &str,
    ) -> RegistryResult<Option<DeploymentRecord>> {
        let rows = self
            .client
            .query(Statement::new(
                "SELECT id, namespace_id, name, subdomain, content_id, kind \
                 FROM deployments WHERE subdomain = ?",
                vec![json!(subdomain)],
            ))
            .await?;
        rows.first().map(|row| decode_deployment(&row)).transpose()
    }

    async fn deployments_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<Vec<DeploymentRecord>> {
        let rows = self
            .client
            .query(Statement::new(
                "SELECT id, namespace_id, name, subdomain, content_id, kind \
                 FROM deployments WHERE namespace_id = ?",
                vec![json!(namespace_id.as_str())],
            ))
            .await?;
        rows.iter().map(|row| decode_deployment(&row)).collect()
    }

    async fn all_deployments(&self) -> RegistryResult<Vec<DeploymentRecord>> {
        let rows = self
            .client
            .query(Statement::new(
                "SELECT id, namespace_id, name, subdomain, content_id, kind FROM deployments",
                vec![],
            ))
            .await?;
        rows.iter().map(|row| decode_deployment(&row)).collect()
    }

    async fn delete_deployments_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<()> {
        self.client
            .execute(&[Statement::new(
                "DELETE FROM deployments WHERE namespace_id = ?",
                vec![json!(namespace_id.as_str())],
            )])
            .await
            .map(|_| ())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.changes_tx.subscribe()
    }
}
