//! Postgres implementations of the store traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager, ManagerConfig},
    AsyncPgConnection, RunQueryDsl,
};
use shared_types::{FineTuningJob, JobStatus};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{AccountRow, ActiveModelRow, JobChanges, JobRow, NewJob};
use crate::store::{
    apply_transition, AccountStore, ActiveModel, JobStore, JobTransition, MailAccount, UserStore,
    CLAIM_PROGRESS, CLAIM_STEP,
};

pub type DbPool = Pool<AsyncPgConnection>;

/// Attempts at a compare-and-swap write before giving up with `Conflict`.
const CAS_ATTEMPTS: usize = 3;

const TERMINAL_STATUSES: [&str; 3] = ["COMPLETED", "FAILED", "CANCELLED"];

async fn establish_tls_connection(config: String) -> diesel::ConnectionResult<AsyncPgConnection> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

    let (client, connection) = tokio_postgres::connect(&config, tls)
        .await
        .map_err(|e| diesel::ConnectionError::BadConnection(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    AsyncPgConnection::try_from(client).await
}

pub fn establish_connection_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let mut manager_config = ManagerConfig::default();
    manager_config.custom_setup =
        Box::new(|url| Box::pin(establish_tls_connection(url.to_string())));

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new_with_config(
        database_url,
        manager_config,
    );
    let pool = Pool::builder(config).build()?;

    Ok(pool)
}

/// Job, user and account stores backed by one connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

// Fine-tuning job operations
pub mod jobs {
    use super::*;

    pub async fn create(
        conn: &mut AsyncPgConnection,
        owner: &str,
        model: &str,
    ) -> Result<FineTuningJob, StoreError> {
        use crate::schema::fine_tuning_jobs::dsl::*;

        let row = diesel::insert_into(fine_tuning_jobs)
            .values(&NewJob {
                user_id: owner,
                status: JobStatus::Pending.as_str(),
                progress: 0,
                base_model: model,
            })
            .returning(JobRow::as_returning())
            .get_result::<JobRow>(conn)
            .await?;

        row.try_into()
    }

    pub async fn get(
        conn: &mut AsyncPgConnection,
        job_id: Uuid,
    ) -> Result<Option<FineTuningJob>, StoreError> {
        use crate::schema::fine_tuning_jobs::dsl::*;

        fine_tuning_jobs
            .filter(id.eq(job_id))
            .select(JobRow::as_select())
            .first::<JobRow>(conn)
            .await
            .optional()?
            .map(FineTuningJob::try_from)
            .transpose()
    }

    /// Oldest PENDING job whose owner has no other claimed, non-terminal
    /// job. A busy user's queued job must not hide other users' work.
    pub async fn oldest_pending(
        conn: &mut AsyncPgConnection,
    ) -> Result<Option<FineTuningJob>, StoreError> {
        diesel::sql_query(
            "SELECT job.* FROM fine_tuning_jobs AS job \
             WHERE job.status = 'PENDING' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM fine_tuning_jobs AS other \
                   WHERE other.user_id = job.user_id \
                     AND other.id <> job.id \
                     AND other.status NOT IN ('PENDING', 'COMPLETED', 'FAILED', 'CANCELLED') \
               ) \
             ORDER BY job.created_at ASC \
             LIMIT 1",
        )
        .get_result::<JobRow>(conn)
        .await
        .optional()?
        .map(FineTuningJob::try_from)
        .transpose()
    }

    pub async fn list_in_progress(
        conn: &mut AsyncPgConnection,
    ) -> Result<Vec<FineTuningJob>, StoreError> {
        use crate::schema::fine_tuning_jobs::dsl::*;

        let rows = fine_tuning_jobs
            .filter(status.ne(JobStatus::Pending.as_str()))
            .filter(status.ne_all(TERMINAL_STATUSES))
            .order_by(updated_at.asc())
            .select(JobRow::as_select())
            .load::<JobRow>(conn)
            .await?;

        rows.into_iter().map(FineTuningJob::try_from).collect()
    }

    /// Conditional PENDING -> EXTRACTING_DATA update. The row is only taken
    /// when it is still PENDING and the owner has no other claimed job.
    pub async fn claim(
        conn: &mut AsyncPgConnection,
        job_id: Uuid,
    ) -> Result<Option<FineTuningJob>, StoreError> {
        use diesel::sql_types::{Int4, Text, Uuid as SqlUuid};

        let result = diesel::sql_query(
            "UPDATE fine_tuning_jobs AS job \
             SET status = 'EXTRACTING_DATA', \
                 progress = GREATEST(job.progress, $2), \
                 current_step = $3, \
                 updated_at = NOW() \
             WHERE job.id = $1 \
               AND job.status = 'PENDING' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM fine_tuning_jobs AS other \
                   WHERE other.user_id = job.user_id \
                     AND other.id <> job.id \
                     AND other.status NOT IN ('PENDING', 'COMPLETED', 'FAILED', 'CANCELLED') \
               ) \
             RETURNING job.*",
        )
        .bind::<SqlUuid, _>(job_id)
        .bind::<Int4, _>(CLAIM_PROGRESS)
        .bind::<Text, _>(CLAIM_STEP)
        .get_result::<JobRow>(conn)
        .await;

        match result {
            Ok(row) => Ok(Some(row.try_into()?)),
            Err(DieselError::NotFound) => Ok(None),
            // Lost a race against a concurrent claim for the same user.
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write guarded on the status and `updated_at` that were read.
    pub async fn transition(
        conn: &mut AsyncPgConnection,
        job_id: Uuid,
        change: &JobTransition,
    ) -> Result<FineTuningJob, StoreError> {
        use crate::schema::fine_tuning_jobs::dsl::*;

        for _ in 0..CAS_ATTEMPTS {
            let current = get(conn, job_id)
                .await?
                .ok_or_else(|| StoreError::not_found("Job", job_id))?;
            let next = apply_transition(&current, change, Utc::now())?;

            let written = diesel::update(
                fine_tuning_jobs
                    .filter(id.eq(job_id))
                    .filter(status.eq(current.status.as_str()))
                    .filter(updated_at.eq(current.updated_at)),
            )
            .set(&JobChanges::from(&next))
            .returning(JobRow::as_returning())
            .get_result::<JobRow>(conn)
            .await
            .optional()?;

            match written {
                Some(row) => return row.try_into(),
                None => {
                    tracing::debug!(job_id = %job_id, "Job changed underneath transition, retrying");
                }
            }
        }

        Err(StoreError::Conflict(job_id))
    }
}

// User active-model pointer operations
pub mod users {
    use super::*;

    pub async fn active_model(
        conn: &mut AsyncPgConnection,
        user: &str,
    ) -> Result<Option<ActiveModel>, StoreError> {
        use crate::schema::users::dsl::*;

        let row = users
            .filter(id.eq(user))
            .select(ActiveModelRow::as_select())
            .first::<ActiveModelRow>(conn)
            .await
            .optional()?;

        Ok(row.map(ActiveModel::from))
    }

    pub async fn set_active_model(
        conn: &mut AsyncPgConnection,
        user: &str,
        model: &ActiveModel,
    ) -> Result<(), StoreError> {
        use crate::schema::users::dsl::*;

        let updated = diesel::update(users.filter(id.eq(user)))
            .set(&ActiveModelRow::from(model))
            .execute(conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::not_found("User", user));
        }
        Ok(())
    }
}

// Connected mail account operations
pub mod accounts {
    use super::*;

    pub const GOOGLE_PROVIDER: &str = "google";

    pub async fn for_user(
        conn: &mut AsyncPgConnection,
        owner: &str,
    ) -> Result<Option<MailAccount>, StoreError> {
        use crate::schema::accounts::dsl::*;

        let row = accounts
            .filter(user_id.eq(owner))
            .filter(provider.eq(GOOGLE_PROVIDER))
            .select(AccountRow::as_select())
            .first::<AccountRow>(conn)
            .await
            .optional()?;

        Ok(row.map(MailAccount::from))
    }

    pub async fn update_access_token(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
        token: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        use crate::schema::accounts::dsl::*;

        let updated = diesel::update(accounts.filter(id.eq(account_id)))
            .set((access_token.eq(Some(token)), expires_at.eq(Some(expiry))))
            .execute(conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::not_found("Account", account_id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create(&self, user_id: &str, base_model: &str) -> Result<FineTuningJob, StoreError> {
        let mut conn = self.pool.get().await?;
        jobs::create(&mut conn, user_id, base_model).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<FineTuningJob>, StoreError> {
        let mut conn = self.pool.get().await?;
        jobs::get(&mut conn, job_id).await
    }

    async fn oldest_pending(&self) -> Result<Option<FineTuningJob>, StoreError> {
        let mut conn = self.pool.get().await?;
        jobs::oldest_pending(&mut conn).await
    }

    async fn list_in_progress(&self) -> Result<Vec<FineTuningJob>, StoreError> {
        let mut conn = self.pool.get().await?;
        jobs::list_in_progress(&mut conn).await
    }

    async fn claim(&self, job_id: Uuid) -> Result<Option<FineTuningJob>, StoreError> {
        let mut conn = self.pool.get().await?;
        jobs::claim(&mut conn, job_id).await
    }

    async fn transition(
        &self,
        job_id: Uuid,
        change: JobTransition,
    ) -> Result<FineTuningJob, StoreError> {
        let mut conn = self.pool.get().await?;
        jobs::transition(&mut conn, job_id, &change).await
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn active_model(&self, user_id: &str) -> Result<Option<ActiveModel>, StoreError> {
        let mut conn = self.pool.get().await?;
        users::active_model(&mut conn, user_id).await
    }

    async fn set_active_model(
        &self,
        user_id: &str,
        model: &ActiveModel,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        users::set_active_model(&mut conn, user_id, model).await
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn mail_account(&self, user_id: &str) -> Result<Option<MailAccount>, StoreError> {
        let mut conn = self.pool.get().await?;
        accounts::for_user(&mut conn, user_id).await
    }

    async fn update_access_token(
        &self,
        account_id: Uuid,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        accounts::update_access_token(&mut conn, account_id, access_token, expires_at).await
    }
}
