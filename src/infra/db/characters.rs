use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{CharactersRepo, RepoError, UpdateTokensParams};
use crate::domain::entities::CharacterRecord;

use super::{PostgresRepositories, map_sqlx_error};

const CHARACTER_COLUMNS: &str = "character_id, name, refresh_token_enc, access_token, \
     token_expires_at, reauth_required, updated_at";

#[derive(sqlx::FromRow)]
struct CharacterRow {
    character_id: i64,
    name: String,
    refresh_token_enc: String,
    access_token: Option<String>,
    token_expires_at: OffsetDateTime,
    reauth_required: bool,
    updated_at: OffsetDateTime,
}

impl From<CharacterRow> for CharacterRecord {
    fn from(row: CharacterRow) -> Self {
        Self {
            character_id: row.character_id,
            name: row.name,
            refresh_token_enc: row.refresh_token_enc,
            access_token: row.access_token,
            token_expires_at: row.token_expires_at,
            reauth_required: row.reauth_required,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl CharactersRepo for PostgresRepositories {
    async fn list_token_expiring(
        &self,
        before: OffsetDateTime,
    ) -> Result<Vec<CharacterRecord>, RepoError> {
        let rows = sqlx::query_as::<_, CharacterRow>(&format!(
            r#"
            SELECT {CHARACTER_COLUMNS}
              FROM characters
             WHERE token_expires_at <= $1
               AND NOT reauth_required
             ORDER BY token_expires_at ASC
            "#
        ))
        .bind(before)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(CharacterRecord::from).collect())
    }

    async fn find_character(
        &self,
        character_id: i64,
    ) -> Result<Option<CharacterRecord>, RepoError> {
        let row = sqlx::query_as::<_, CharacterRow>(&format!(
            "SELECT {CHARACTER_COLUMNS} FROM characters WHERE character_id = $1"
        ))
        .bind(character_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(CharacterRecord::from))
    }

    async fn update_character_tokens(&self, params: UpdateTokensParams) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE characters
               SET access_token = $2,
                   refresh_token_enc = $3,
                   token_expires_at = $4,
                   updated_at = now()
             WHERE character_id = $1
            "#,
        )
        .bind(params.character_id)
        .bind(&params.access_token)
        .bind(&params.refresh_token_enc)
        .bind(params.token_expires_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn set_reauth_required(
        &self,
        character_id: i64,
        required: bool,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE characters
               SET reauth_required = $2, updated_at = now()
             WHERE character_id = $1
            "#,
        )
        .bind(character_id)
        .bind(required)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}
