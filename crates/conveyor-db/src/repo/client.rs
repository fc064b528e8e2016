//! Worker client repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::job::Client;
use conveyor_core::{ClientStatus, ResourceId};

use super::PgStore;
use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct ClientRecord {
    id: uuid::Uuid,
    name: String,
    address: String,
    status: String,
    status_message: String,
    last_seen: DateTime<Utc>,
}

impl TryFrom<ClientRecord> for Client {
    type Error = DbError;

    fn try_from(r: ClientRecord) -> DbResult<Self> {
        Ok(Client {
            id: ResourceId::from_uuid(r.id),
            name: r.name,
            address: r.address,
            status: r.status.parse()?,
            status_message: r.status_message,
            last_seen: r.last_seen,
        })
    }
}

#[async_trait]
pub trait ClientRepo: Send + Sync {
    /// Look up a client by name and address, registering it on first
    /// contact. Either way its `last_seen` is refreshed.
    async fn get_or_create_client(&self, name: &str, address: &str) -> DbResult<Client>;

    async fn get_client(&self, id: ResourceId) -> DbResult<Client>;

    async fn set_client_status(
        &self,
        id: ResourceId,
        status: ClientStatus,
        message: &str,
    ) -> DbResult<()>;
}

#[async_trait]
impl ClientRepo for PgStore {
    async fn get_or_create_client(&self, name: &str, address: &str) -> DbResult<Client> {
        sqlx::query_as::<_, ClientRecord>(
            r#"
            INSERT INTO clients (id, name, address, status, status_message, last_seen)
            VALUES ($1, $2, $3, 'idle', '', NOW())
            ON CONFLICT (name, address) DO UPDATE SET last_seen = NOW()
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(name)
        .bind(address)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    async fn get_client(&self, id: ResourceId) -> DbResult<Client> {
        sqlx::query_as::<_, ClientRecord>("SELECT * FROM clients WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("client {}", id)))?
            .try_into()
    }

    async fn set_client_status(
        &self,
        id: ResourceId,
        status: ClientStatus,
        message: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE clients SET status = $2, status_message = $3, last_seen = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.to_string())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
