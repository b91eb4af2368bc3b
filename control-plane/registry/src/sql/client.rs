use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::store::{RegistryError, RegistryResult};

/// One parameterized SQL statement in the store's wire form.
#[derive(Clone, Debug)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    #[must_use]
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    fn encode(&self) -> Value {
        let mut parts = vec![json!(self.sql)];
        parts.extend(self.params.iter().cloned());
        Value::Array(parts)
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteEnvelope {
    results: Vec<ExecuteResult>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResult {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    rows_affected: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct QueryEnvelope {
    results: Vec<QueryResult>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResult {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    values: Option<Vec<Vec<Value>>>,
}

/// Decoded result rows of one query.
#[derive(Clone, Debug, Default)]
pub struct Rows(Vec<Vec<Value>>);

impl Rows {
    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> {
        self.0.iter().map(|values| Row { values })
    }

    #[must_use]
    pub fn first(&self) -> Option<Row<'_>> {
        self.0.first().map(|values| Row { values })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Positional accessor over one result row.
#[derive(Clone, Copy, Debug)]
pub struct Row<'a> {
    values: &'a [Value],
}

impl Row<'_> {
    pub fn text(&self, index: usize) -> RegistryResult<String> {
        self.values
            .get(index)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| RegistryError::Backend {
                message: format!("expected text at column {index}"),
            })
    }

    #[must_use]
    pub fn opt_text(&self, index: usize) -> Option<String> {
        self.values
            .get(index)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    }

    pub fn integer(&self, index: usize) -> RegistryResult<i64> {
        self.values
            .get(index)
            .and_then(Value::as_i64)
            .ok_or_else(|| RegistryError::Backend {
                message: format!("expected integer at column {index}"),
            })
    }

    #[must_use]
    pub fn opt_integer(&self, index: usize) -> Option<i64> {
        self.values.get(index).and_then(Value::as_i64)
    }

    pub fn boolean(&self, index: usize) -> RegistryResult<bool> {
        Ok(self.integer(index)? != 0)
    }
}

/// HTTP client for the platform's replicated SQL store. Every endpoint is
/// tried in order; the first reachable one serves the call.
pub struct SqlClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl SqlClient {
    #[must_use]
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints,
        }
    }

    /// Run statements inside a single transaction.
    pub async fn execute(&self, statements: &[Statement]) -> RegistryResult<u64> {
        let body = Value::Array(statements.iter().map(Statement::encode).collect());
        let envelope: ExecuteEnvelope = self.post("/db/execute?transaction", &body).await?;

        let mut affected = 0;
        for result in envelope.results {
            if let Some(error) = result.error {
                return Err(map_backend_error(error));
            }
            affected += result.rows_affected.unwrap_or(0);
        }
        Ok(affected)
    }

    /// Run one strongly consistent read.
    pub async fn query(&self, statement: Statement) -> RegistryResult<Rows> {
        let body = Value::Array(vec![statement.encode()]);
        let envelope: QueryEnvelope = self.post("/db/query?level=strong", &body).await?;

        let result = envelope.results.into_iter().next().unwrap_or_default();
        if let Some(error) = result.error {
            return Err(map_backend_error(error));
        }
        Ok(Rows(result.values.unwrap_or_default()))
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> RegistryResult<T> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            let url = format!("{}{path}", endpoint.trim_end_matches('/'));
            debug!(%url, "registry sql call");
            match self.http.post(&url).json(body).send().await {
                Ok(response) => {
                    let response = response
                        .error_for_status()
                        .map_err(|source| RegistryError::Transport { source })?;
                    let raw = response
                        .bytes()
                        .await
                        .map_err(|source| RegistryError::Transport { source })?;
                    return serde_json::from_slice(&raw)
                        .map_err(|source| RegistryError::Decode { source });
                }
                Err(source) => {
                    warn!(%url, error = %source, "registry endpoint unreachable, trying next");
                    last_error = Some(source);
                }
            }
        }
        Err(last_error.map_or_else(
            || RegistryError::Backend {
                message: "no registry endpoints configured".to_owned(),
            },
            |source| RegistryError::Transport { source },
        ))
    }
}

/// Map the store's error strings onto typed registry errors. Constraint names
/// come from the schema in [`crate::sql::schema`].
fn map_backend_error(message: String) -> RegistryError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("not leader") || lowered.contains("leadership") {
        return RegistryError::LeadershipLost;
    }
    RegistryError::Backend { message }
}
