//! PostgreSQL snippet store
//!
//! Uses sqlx with a connection pool. Workflow writes run inside a database
//! transaction; budget writes go straight to the pool so they commit on their
//! own.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Executor, PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use time::OffsetDateTime;
use tracing::{debug, info};
use typsnip::{
    BudgetLedger, BudgetState, NewSnippet, PackageRef, PackageUsage, Snippet, SnippetError,
    TagSummary, User, VersionRecord,
};

use super::{Authenticator, SnippetStore, SnippetTransaction, hash_token};
use crate::error::{RepoError, Result};
use crate::query::{SnippetPage, SnippetQuery, SortBy, SortOrder};

/// Tables used by the store
const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        public_id TEXT NOT NULL UNIQUE,
        username TEXT NOT NULL,
        computation_time BIGINT NOT NULL DEFAULT 60000,
        computation_time_reset TIMESTAMPTZ NOT NULL DEFAULT now(),
        abilities TEXT[] NOT NULL DEFAULT '{}',
        deleted_at TIMESTAMPTZ
    );

    CREATE TABLE IF NOT EXISTS access_tokens (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        token_hash TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS snippets (
        id BIGSERIAL PRIMARY KEY,
        public_id TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        description TEXT,
        content TEXT NOT NULL,
        image TEXT,
        is_public BOOLEAN NOT NULL DEFAULT TRUE,
        author TEXT,
        copy_recommendation TEXT,
        created_by_id BIGINT NOT NULL REFERENCES users(id),
        deleted_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS versions (
        id BIGSERIAL PRIMARY KEY,
        snippet_id BIGINT NOT NULL REFERENCES snippets(id) ON DELETE CASCADE,
        version TEXT NOT NULL,
        success BOOLEAN NOT NULL,
        deleted_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (snippet_id, version)
    );

    CREATE TABLE IF NOT EXISTS tags (
        id BIGSERIAL PRIMARY KEY,
        public_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS snippet_tag (
        snippet_id BIGINT NOT NULL REFERENCES snippets(id) ON DELETE CASCADE,
        tag_id BIGINT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        PRIMARY KEY (snippet_id, tag_id)
    );

    CREATE TABLE IF NOT EXISTS packages (
        id BIGSERIAL PRIMARY KEY,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        UNIQUE (namespace, name)
    );

    CREATE TABLE IF NOT EXISTS package_snippet_relation (
        snippet_id BIGINT NOT NULL REFERENCES snippets(id) ON DELETE CASCADE,
        package_id BIGINT NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
        version TEXT NOT NULL,
        PRIMARY KEY (snippet_id, package_id)
    );

    CREATE INDEX IF NOT EXISTS idx_snippets_created_by ON snippets(created_by_id);
    CREATE INDEX IF NOT EXISTS idx_snippets_title ON snippets(lower(title));
    CREATE INDEX IF NOT EXISTS idx_versions_snippet ON versions(snippet_id);
"#;

const SNIPPET_COLUMNS: &str = "s.id, s.public_id, s.title, s.description, s.content, s.image, \
     s.is_public, s.author, s.copy_recommendation, s.created_by_id, s.deleted_at, \
     s.created_at, s.updated_at";

const USER_COLUMNS: &str = "u.id, u.public_id, u.username, u.computation_time, \
     u.computation_time_reset, u.abilities, u.deleted_at";

fn snippet_from_row(row: &PgRow) -> Result<Snippet> {
    Ok(Snippet {
        id: row.try_get("id")?,
        public_id: row.try_get("public_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        content: row.try_get("content")?,
        image: row.try_get("image")?,
        is_public: row.try_get("is_public")?,
        author: row.try_get("author")?,
        copy_recommendation: row.try_get("copy_recommendation")?,
        created_by_id: row.try_get("created_by_id")?,
        versions: Vec::new(),
        packages: Vec::new(),
        tags: Vec::new(),
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<VersionRecord> {
    Ok(VersionRecord {
        id: row.try_get("id")?,
        snippet_id: row.try_get("snippet_id")?,
        version: row.try_get("version")?,
        success: row.try_get("success")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        public_id: row.try_get("public_id")?,
        username: row.try_get("username")?,
        computation_time: row.try_get("computation_time")?,
        computation_time_reset: row.try_get("computation_time_reset")?,
        capabilities: row.try_get("abilities")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

async fn select_versions(conn: &mut PgConnection, snippet_id: i64) -> Result<Vec<VersionRecord>> {
    let rows = sqlx::query(
        "SELECT id, snippet_id, version, success, deleted_at, created_at, updated_at
         FROM versions WHERE snippet_id = $1 AND deleted_at IS NULL ORDER BY id",
    )
    .bind(snippet_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(version_from_row).collect()
}

/// Fill versions, tags and packages of a snippet row
async fn load_relations(conn: &mut PgConnection, snippet: &mut Snippet) -> Result<()> {
    snippet.versions = select_versions(conn, snippet.id).await?;

    let tag_rows = sqlx::query(
        "SELECT t.public_id, t.name FROM tags t
         JOIN snippet_tag st ON st.tag_id = t.id
         WHERE st.snippet_id = $1 ORDER BY t.name",
    )
    .bind(snippet.id)
    .fetch_all(&mut *conn)
    .await?;
    snippet.tags = tag_rows
        .iter()
        .map(|row| -> Result<TagSummary> {
            Ok(TagSummary {
                public_id: row.try_get("public_id")?,
                name: row.try_get("name")?,
            })
        })
        .collect::<Result<_>>()?;

    let package_rows = sqlx::query(
        "SELECT p.namespace, p.name, r.version FROM packages p
         JOIN package_snippet_relation r ON r.package_id = p.id
         WHERE r.snippet_id = $1 ORDER BY p.namespace, p.name",
    )
    .bind(snippet.id)
    .fetch_all(&mut *conn)
    .await?;
    snippet.packages = package_rows
        .iter()
        .map(|row| -> Result<PackageUsage> {
            Ok(PackageUsage {
                namespace: row.try_get("namespace")?,
                name: row.try_get("name")?,
                version: row.try_get("version")?,
            })
        })
        .collect::<Result<_>>()?;

    Ok(())
}

/// Append the WHERE clause of `query` to `builder`
fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &SnippetQuery) {
    builder.push(" WHERE TRUE");

    if !query.with_trashed {
        builder.push(" AND s.deleted_at IS NULL");
    }

    match query.viewer_id {
        Some(viewer) => {
            builder
                .push(" AND (s.is_public OR s.created_by_id = ")
                .push_bind(viewer)
                .push(")");
        }
        None => {
            builder.push(" AND s.is_public");
        }
    }

    if let Some(owner) = query.owner_id {
        builder.push(" AND s.created_by_id = ").push_bind(owner);
    }

    for tag in &query.tags {
        builder
            .push(
                " AND EXISTS (SELECT 1 FROM snippet_tag st JOIN tags t ON t.id = st.tag_id \
                 WHERE st.snippet_id = s.id AND t.public_id = ",
            )
            .push_bind(tag.clone())
            .push(")");
    }

    if let Some(engine_version) = &query.engine_version {
        builder
            .push(
                " AND EXISTS (SELECT 1 FROM versions v WHERE v.snippet_id = s.id \
                 AND v.success AND v.deleted_at IS NULL AND v.version = ",
            )
            .push_bind(engine_version.clone())
            .push(")");
    }

    if let Some(package) = &query.package {
        builder
            .push(
                " AND EXISTS (SELECT 1 FROM package_snippet_relation r \
                 JOIN packages p ON p.id = r.package_id WHERE r.snippet_id = s.id AND p.namespace = ",
            )
            .push_bind(package.namespace.clone())
            .push(" AND p.name = ")
            .push_bind(package.name.clone());
        if let Some(version) = &package.version {
            builder.push(" AND r.version = ").push_bind(version.clone());
        }
        builder.push(")");
    }

    if let Some(search) = &query.search {
        let pattern = format!("%{}%", search);
        builder
            .push(" AND (s.title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR s.description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

/// PostgreSQL-backed snippet store
#[derive(Clone)]
pub struct PostgresSnippetStore {
    pool: PgPool,
}

impl PostgresSnippetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `database_url`
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they don't exist
    pub async fn migrate(&self) -> Result<()> {
        (&self.pool).execute(SCHEMA_SQL).await?;
        info!("Snippet schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SnippetStore for PostgresSnippetStore {
    async fn begin(&self) -> Result<Box<dyn SnippetTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }

    async fn find_snippet(&self, public_id: &str, with_trashed: bool) -> Result<Option<Snippet>> {
        let mut conn = self.pool.acquire().await?;

        let sql = format!(
            "SELECT {} FROM snippets s WHERE s.public_id = $1 AND ($2 OR s.deleted_at IS NULL)",
            SNIPPET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(public_id)
            .bind(with_trashed)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => {
                let mut snippet = snippet_from_row(&row)?;
                load_relations(&mut conn, &mut snippet).await?;
                Ok(Some(snippet))
            }
            None => Ok(None),
        }
    }

    async fn title_taken(&self, title: &str, excluding: Option<i64>) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1 FROM snippets
                WHERE lower(title) = lower($1) AND deleted_at IS NULL
                  AND ($2::BIGINT IS NULL OR id <> $2)
            )",
        )
        .bind(title)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await?;
        Ok(taken)
    }

    async fn list_snippets(&self, query: &SnippetQuery) -> Result<SnippetPage> {
        let mut conn = self.pool.acquire().await?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM snippets s");
        push_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&mut *conn).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM snippets s", SNIPPET_COLUMNS));
        push_filters(&mut select, query);
        select.push(match query.sort_by {
            SortBy::CreatedAt => " ORDER BY s.created_at",
            SortBy::UpdatedAt => " ORDER BY s.updated_at",
        });
        select.push(match query.order {
            SortOrder::Asc => " ASC, s.id ASC",
            SortOrder::Desc => " DESC, s.id DESC",
        });
        select
            .push(" LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows = select.build().fetch_all(&mut *conn).await?;
        let mut snippets = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut snippet = snippet_from_row(row)?;
            load_relations(&mut conn, &mut snippet).await?;
            snippets.push(snippet);
        }

        Ok(SnippetPage {
            snippets,
            total: u64::try_from(total).unwrap_or(0),
            page: query.page,
            limit: query.limit,
        })
    }

    async fn purge_owner(&self, owner_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM snippets WHERE created_by_id = $1")
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BudgetLedger for PostgresSnippetStore {
    async fn refill_if_due(
        &self,
        user_id: i64,
        allotment: i64,
        now: OffsetDateTime,
        next_reset: OffsetDateTime,
    ) -> typsnip::Result<BudgetState> {
        // both CASE arms see the row as it was before the update
        let row = sqlx::query(
            "UPDATE users SET
                computation_time = CASE WHEN computation_time_reset <= $2 THEN $1 ELSE computation_time END,
                computation_time_reset = CASE WHEN computation_time_reset <= $2 THEN $3 ELSE computation_time_reset END
             WHERE id = $4
             RETURNING computation_time, computation_time_reset",
        )
        .bind(allotment)
        .bind(now)
        .bind(next_reset)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepoError::from)?
        .ok_or_else(|| SnippetError::not_found("user"))?;

        Ok(BudgetState {
            computation_time: row.try_get("computation_time").map_err(RepoError::from)?,
            computation_time_reset: row.try_get("computation_time_reset").map_err(RepoError::from)?,
        })
    }

    async fn charge(&self, user_id: i64, amount: i64) -> typsnip::Result<i64> {
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET computation_time = GREATEST(computation_time - $1, 0)
             WHERE id = $2
             RETURNING computation_time",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepoError::from)?;
        balance.ok_or_else(|| SnippetError::not_found("user"))
    }

    async fn balance(&self, user_id: i64) -> typsnip::Result<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT computation_time FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(RepoError::from)?;
        balance.ok_or_else(|| SnippetError::not_found("user"))
    }
}

#[async_trait]
impl Authenticator for PostgresSnippetStore {
    async fn authenticate(&self, token: &str) -> Result<Option<User>> {
        let sql = format!(
            "SELECT {} FROM access_tokens t JOIN users u ON u.id = t.user_id
             WHERE t.token_hash = $1 AND u.deleted_at IS NULL",
            USER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(hash_token(token))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }
}

struct PostgresTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(RepoError::TransactionFinished)
    }
}

#[async_trait]
impl SnippetTransaction for PostgresTransaction {
    async fn insert_snippet(&mut self, snippet: &NewSnippet) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO snippets (public_id, title, description, content, is_public, author,
                                   copy_recommendation, created_by_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(&snippet.public_id)
        .bind(&snippet.title)
        .bind(&snippet.description)
        .bind(&snippet.content)
        .bind(snippet.is_public)
        .bind(&snippet.author)
        .bind(&snippet.copy_recommendation)
        .bind(snippet.created_by_id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(id)
    }

    async fn update_snippet(&mut self, snippet: &Snippet) -> Result<()> {
        let result = sqlx::query(
            "UPDATE snippets SET title = $1, description = $2, content = $3, image = $4,
                                 is_public = $5, author = $6, copy_recommendation = $7,
                                 deleted_at = $8, updated_at = now()
             WHERE id = $9",
        )
        .bind(&snippet.title)
        .bind(&snippet.description)
        .bind(&snippet.content)
        .bind(&snippet.image)
        .bind(snippet.is_public)
        .bind(&snippet.author)
        .bind(&snippet.copy_recommendation)
        .bind(snippet.deleted_at)
        .bind(snippet.id)
        .execute(self.conn()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("snippet {}", snippet.public_id)));
        }
        Ok(())
    }

    async fn sync_tags(&mut self, snippet_id: i64, tag_public_ids: &[String]) -> Result<()> {
        let conn = self.conn()?;
        sqlx::query("DELETE FROM snippet_tag WHERE snippet_id = $1")
            .bind(snippet_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            "INSERT INTO snippet_tag (snippet_id, tag_id)
             SELECT $1, id FROM tags WHERE public_id = ANY($2)",
        )
        .bind(snippet_id)
        .bind(tag_public_ids.to_vec())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn find_package(&mut self, package: &PackageRef) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM packages WHERE namespace = $1 AND name = $2")
            .bind(&package.namespace)
            .bind(&package.name)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(id)
    }

    async fn sync_packages(&mut self, snippet_id: i64, packages: &[(i64, String)]) -> Result<()> {
        let conn = self.conn()?;
        sqlx::query("DELETE FROM package_snippet_relation WHERE snippet_id = $1")
            .bind(snippet_id)
            .execute(&mut *conn)
            .await?;

        for (package_id, version) in packages {
            sqlx::query(
                "INSERT INTO package_snippet_relation (snippet_id, package_id, version)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (snippet_id, package_id) DO UPDATE SET version = EXCLUDED.version",
            )
            .bind(snippet_id)
            .bind(*package_id)
            .bind(version)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn list_versions(&mut self, snippet_id: i64) -> Result<Vec<VersionRecord>> {
        select_versions(self.conn()?, snippet_id).await
    }

    async fn upsert_version(&mut self, snippet_id: i64, version: &str, success: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO versions (snippet_id, version, success)
             VALUES ($1, $2, $3)
             ON CONFLICT (snippet_id, version) DO UPDATE
             SET success = EXCLUDED.success, deleted_at = NULL, updated_at = now()",
        )
        .bind(snippet_id)
        .bind(version)
        .bind(success)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn delete_version(&mut self, version_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM versions WHERE id = $1")
            .bind(version_id)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(RepoError::TransactionFinished)?;
        tx.commit().await?;
        debug!("Committed snippet transaction");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(RepoError::TransactionFinished)?;
        tx.rollback().await?;
        debug!("Rolled back snippet transaction");
        Ok(())
    }
}
