use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info, instrument};

use crate::agents::AgentRepository;
use crate::config::DatabaseConfig;
use crate::coordination::RiskEventSink;
use crate::domain::{AgentId, AgentRecord, AgentStatus};
use crate::error::{FleetError, Result};
use crate::persistence::{AgentTelemetry, BulkInsert, Candle};

/// Postgres binds at most 65535 parameters per statement
const MAX_BIND_PARAMS: usize = 65_535;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

/// Persisted breaker trip
#[derive(Debug, Clone)]
pub struct RiskEventRow {
    pub id: i64,
    pub entity_id: String,
    pub event_type: String,
    pub description: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::new(&config.url, config.max_connections).await
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==================== Agents ====================

    /// Insert or fully overwrite an agent record
    #[instrument(skip(self, agent), fields(agent_id = %agent.id))]
    pub async fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (
                id, user_id, symbol, exchange, status, initial_balance, current_balance,
                realized_pnl, stop_loss_order_id, take_profit_order_id, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                symbol = EXCLUDED.symbol,
                exchange = EXCLUDED.exchange,
                status = EXCLUDED.status,
                initial_balance = EXCLUDED.initial_balance,
                current_balance = EXCLUDED.current_balance,
                realized_pnl = EXCLUDED.realized_pnl,
                stop_loss_order_id = EXCLUDED.stop_loss_order_id,
                take_profit_order_id = EXCLUDED.take_profit_order_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(agent.id.as_str())
        .bind(&agent.user_id)
        .bind(&agent.symbol)
        .bind(&agent.exchange)
        .bind(agent.status.as_str())
        .bind(agent.initial_balance)
        .bind(agent.current_balance)
        .bind(agent.realized_pnl)
        .bind(&agent.stop_loss_order_id)
        .bind(&agent.take_profit_order_id)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, symbol, exchange, status, initial_balance, current_balance,
                   realized_pnl, stop_loss_order_id, take_profit_order_id, updated_at
            FROM agents WHERE id = $1
            "#,
        )
        .bind(agent_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| agent_from_row(&r)).transpose()
    }

    /// Change the desired status; recovery passes pick it up
    pub async fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE agents SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(agent_id.as_str())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== Risk Events ====================

    pub async fn recent_risk_events(&self, entity_id: &str, limit: i64) -> Result<Vec<RiskEventRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_id, event_type, description, data, created_at
            FROM risk_events
            WHERE entity_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(entity_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| RiskEventRow {
                id: r.get("id"),
                entity_id: r.get("entity_id"),
                event_type: r.get("event_type"),
                description: r.get("description"),
                data: r.get("data"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

fn agent_from_row(r: &PgRow) -> Result<AgentRecord> {
    let status: String = r.get("status");
    Ok(AgentRecord {
        id: AgentId::new(r.get::<String, _>("id")),
        user_id: r.get("user_id"),
        symbol: r.get("symbol"),
        exchange: r.get("exchange"),
        status: AgentStatus::try_from(status.as_str()).map_err(FleetError::Validation)?,
        initial_balance: r.get("initial_balance"),
        current_balance: r.get("current_balance"),
        realized_pnl: r.get("realized_pnl"),
        stop_loss_order_id: r.get("stop_loss_order_id"),
        take_profit_order_id: r.get("take_profit_order_id"),
        updated_at: r.get("updated_at"),
    })
}

#[async_trait]
impl AgentRepository for PostgresStore {
    async fn list_running_agents(&self) -> Result<Vec<AgentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, symbol, exchange, status, initial_balance, current_balance,
                   realized_pnl, stop_loss_order_id, take_profit_order_id, updated_at
            FROM agents
            WHERE status = 'running'
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(agent_from_row).collect()
    }

    /// Persist the trading state owned by the runtime; identity fields and
    /// desired status are left to the control plane.
    async fn save_agent_state(&self, agent: &AgentRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE agents SET
                current_balance = $2,
                realized_pnl = $3,
                stop_loss_order_id = $4,
                take_profit_order_id = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(agent.id.as_str())
        .bind(agent.current_balance)
        .bind(agent.realized_pnl)
        .bind(&agent.stop_loss_order_id)
        .bind(&agent.take_profit_order_id)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::Persistence(format!("agent {} not found", agent.id)));
        }
        debug!(agent_id = %agent.id, "Agent state saved");
        Ok(())
    }
}

#[async_trait]
impl RiskEventSink for PostgresStore {
    async fn log_risk_event(
        &self,
        entity_id: &str,
        event_type: &str,
        description: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_events (entity_id, event_type, description, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entity_id)
        .bind(event_type)
        .bind(description)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BulkInsert<Candle> for PostgresStore {
    async fn bulk_insert(&self, rows: Vec<Candle>) -> Result<u64> {
        const COLUMNS: usize = 8;
        let rows = Candle::latest_per_bar(rows);
        let mut written = 0;

        for chunk in rows.chunks(MAX_BIND_PARAMS / COLUMNS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO candles (symbol, interval, open_time, open, high, low, close, volume) ",
            );
            qb.push_values(chunk, |mut b, c| {
                b.push_bind(&c.symbol)
                    .push_bind(&c.interval)
                    .push_bind(c.open_time)
                    .push_bind(c.open)
                    .push_bind(c.high)
                    .push_bind(c.low)
                    .push_bind(c.close)
                    .push_bind(c.volume);
            });
            qb.push(
                r#" ON CONFLICT (symbol, interval, open_time) DO UPDATE SET
                    high = EXCLUDED.high,
                    low = EXCLUDED.low,
                    close = EXCLUDED.close,
                    volume = EXCLUDED.volume"#,
            );

            written += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }
}

#[async_trait]
impl BulkInsert<AgentTelemetry> for PostgresStore {
    async fn bulk_insert(&self, rows: Vec<AgentTelemetry>) -> Result<u64> {
        const COLUMNS: usize = 4;
        let mut written = 0;

        for chunk in rows.chunks(MAX_BIND_PARAMS / COLUMNS) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO agent_telemetry (agent_id, kind, payload, recorded_at) ");
            qb.push_values(chunk, |mut b, t| {
                b.push_bind(t.agent_id.as_str())
                    .push_bind(t.kind.as_str())
                    .push_bind(&t.payload)
                    .push_bind(t.recorded_at);
            });

            written += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }
}
