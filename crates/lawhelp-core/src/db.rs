use anyhow::{bail, Context, Result};
use deadpool_postgres::{ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};

use crate::signing::SignatureRecord;
use crate::types::{Document, NewDocument, SettingsPatch, UserSettings};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

const DOCUMENT_COLUMNS: &str = "id, title, content, user_id, created_at, signer_name, \
     signature_url, signature_hash, signed_pdf_url";

const SETTINGS_COLUMNS: &str = "user_id, openai_model, theme, api_key, supabase_url, updated_at";

pub struct Db {
    pool: Pool,
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_document(row: &Row) -> Result<Document, tokio_postgres::Error> {
    Ok(Document {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        signer_name: row.try_get("signer_name")?,
        signature_url: row.try_get("signature_url")?,
        signature_hash: row.try_get("signature_hash")?,
        signed_pdf_url: row.try_get("signed_pdf_url")?,
    })
}

fn row_to_settings(row: &Row) -> Result<UserSettings, tokio_postgres::Error> {
    Ok(UserSettings {
        user_id: row.try_get("user_id")?,
        openai_model: row.try_get("openai_model")?,
        theme: row.try_get("theme")?,
        api_key: row.try_get("api_key")?,
        supabase_url: row.try_get("supabase_url")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    /// Build a connection pool. Connections are opened lazily, so this
    /// succeeds even while the database is still starting.
    pub fn connect(url: &str, max_size: usize) -> Result<Self> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(max_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("failed to create Postgres pool")?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .context("failed to acquire Postgres connection")
    }

    pub async fn migrate(&self) -> Result<()> {
        let conn = self.conn().await?;
        conn.batch_execute(SCHEMA_SQL)
            .await
            .context("failed to apply schema migrations")?;
        // Columns added after the first deployment.
        let alters = ["ALTER TABLE documents ADD COLUMN IF NOT EXISTS signed_pdf_url TEXT"];
        for sql in alters {
            conn.batch_execute(sql)
                .await
                .with_context(|| format!("migration failed: {sql}"))?;
        }
        Ok(())
    }

    // ── Documents ─────────────────────────────────────────────────────────

    pub async fn insert_document(&self, doc: &NewDocument) -> Result<i64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO documents (title, content, user_id) VALUES ($1, $2, $3) RETURNING id",
                &[&doc.title, &doc.content, &doc.user_id],
            )
            .await
            .context("insert_document")?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1");
        let row = conn.query_opt(sql.as_str(), &[&id]).await.context("get_document")?;
        Ok(row.as_ref().map(row_to_document).transpose()?)
    }

    /// Store the signer, both object URLs and the image hash in one write.
    pub async fn set_signature(&self, id: i64, record: &SignatureRecord) -> Result<()> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE documents SET signer_name = $2, signature_url = $3, \
                 signature_hash = $4, signed_pdf_url = $5 WHERE id = $1",
                &[
                    &id,
                    &record.signer_name,
                    &record.signature_url,
                    &record.signature_hash,
                    &record.signed_pdf_url,
                ],
            )
            .await
            .context("set_signature")?;
        if updated == 0 {
            bail!("document {id} no longer exists");
        }
        Ok(())
    }

    // ── User Settings ─────────────────────────────────────────────────────

    /// Fetch settings for a user, creating the default row on first access.
    pub async fn get_or_create_settings(&self, user_id: &str) -> Result<UserSettings> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO user_settings (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
            &[&user_id],
        )
        .await
        .context("get_or_create_settings insert")?;
        let sql = format!("SELECT {SETTINGS_COLUMNS} FROM user_settings WHERE user_id = $1");
        let row = conn
            .query_one(sql.as_str(), &[&user_id])
            .await
            .context("get_or_create_settings select")?;
        Ok(row_to_settings(&row)?)
    }

    /// Apply a partial update, creating the row first if needed. Only
    /// non-blank fields of the patch overwrite stored values; `updated_at`
    /// always moves forward.
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<UserSettings> {
        let patch = patch.normalized();
        let user_id = patch.user_id().to_string();
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO user_settings (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
            &[&user_id],
        )
        .await
        .context("update_settings insert")?;
        let sql = format!(
            "UPDATE user_settings SET \
               openai_model = COALESCE($2, openai_model), \
               theme = COALESCE($3, theme), \
               api_key = COALESCE($4, api_key), \
               supabase_url = COALESCE($5, supabase_url), \
               updated_at = now() \
             WHERE user_id = $1 \
             RETURNING {SETTINGS_COLUMNS}"
        );
        let row = conn
            .query_one(
                sql.as_str(),
                &[
                    &user_id,
                    &patch.openai_model,
                    &patch.theme,
                    &patch.api_key,
                    &patch.supabase_url,
                ],
            )
            .await
            .context("update_settings")?;
        Ok(row_to_settings(&row)?)
    }
}
