use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{
    DatabaseError, FeedItem, NewSubscription, Subscription, SubscriptionField, SubscriptionRow,
    EPOCH_MIN,
};

const SELECT_COLUMNS: &str = "SELECT id, source_address, title, refresh_interval_secs, \
     last_fetch_at, last_item_change_at, viewed_at, items, created_at FROM subscriptions";

impl Database {
    // ========================================================================
    // Subscription Operations
    // ========================================================================

    /// Load every subscription, oldest first.
    ///
    /// Rows that fail to decode are logged and skipped so that one bad record
    /// cannot stall the scheduler or the enrichment pass.
    pub async fn find_all(&self) -> Result<Vec<Subscription>, DatabaseError> {
        let rows: Vec<SubscriptionRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY created_at, id"))
                .fetch_all(&self.pool)
                .await?;

        let subscriptions = rows
            .into_iter()
            .filter_map(|row| match decode_row(row) {
                Ok(sub) => Some(sub),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable subscription record");
                    None
                }
            })
            .collect();

        Ok(subscriptions)
    }

    /// Load one subscription, `None` if the id is unknown.
    pub async fn find_one(&self, id: &str) -> Result<Option<Subscription>, DatabaseError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(decode_row).transpose()
    }

    /// Insert a fresh subscription (never fetched, no items).
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::AlreadyExists`] when the id is taken.
    pub async fn insert_if_absent(
        &self,
        new: &NewSubscription,
    ) -> Result<Subscription, DatabaseError> {
        let created_at = Utc::now().timestamp();

        let result = sqlx::query(
            "INSERT INTO subscriptions (id, source_address, title, refresh_interval_secs, items, created_at)
             VALUES (?, ?, ?, ?, '[]', ?)",
        )
        .bind(&new.id)
        .bind(&new.source_address)
        .bind(&new.title)
        .bind(interval_to_sql(new.refresh_interval_secs))
        .bind(created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(DatabaseError::AlreadyExists(new.id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(subscription = %new.id, "Subscription inserted");

        Ok(Subscription {
            id: new.id.clone(),
            source_address: new.source_address.clone(),
            title: new.title.clone(),
            refresh_interval_secs: new.refresh_interval_secs,
            last_fetch_at: EPOCH_MIN,
            last_item_change_at: EPOCH_MIN,
            viewed_at: None,
            items: Vec::new(),
            created_at,
        })
    }

    /// Overwrite the named fields of one subscription in a single statement.
    ///
    /// Returns the number of matched records: `0` means the id is unknown.
    /// An empty field list only checks for existence.
    pub async fn update_fields(
        &self,
        id: &str,
        fields: &[SubscriptionField],
    ) -> Result<u64, DatabaseError> {
        if fields.is_empty() {
            let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
            return Ok(row.0.max(0) as u64);
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE subscriptions SET ");
        {
            let mut separated = builder.separated(", ");
            for field in fields {
                separated.push(format_args!("{} = ", field.column()));
                match field {
                    SubscriptionField::Title(value) | SubscriptionField::SourceAddress(value) => {
                        separated.push_bind_unseparated(value.clone());
                    }
                    SubscriptionField::RefreshInterval(secs) => {
                        separated.push_bind_unseparated(interval_to_sql(*secs));
                    }
                    SubscriptionField::LastFetchAt(at) | SubscriptionField::LastItemChangeAt(at) => {
                        separated.push_bind_unseparated(encode_instant(*at));
                    }
                    SubscriptionField::Items(items) => {
                        let json = serde_json::to_string(items).map_err(|e| {
                            DatabaseError::Corrupt {
                                id: id.to_owned(),
                                reason: e.to_string(),
                            }
                        })?;
                        separated.push_bind_unseparated(json);
                    }
                    SubscriptionField::ViewedAt(at) => {
                        separated.push_bind_unseparated(at.and_then(encode_instant));
                    }
                }
            }
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id.to_owned());

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Remove one subscription and its history. Returns the number removed.
    pub async fn delete_one(&self, id: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Row Encoding
// ============================================================================

fn interval_to_sql(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// `EPOCH_MIN` is stored as NULL: its year cannot round-trip through RFC 3339.
fn encode_instant(at: DateTime<Utc>) -> Option<String> {
    if at == EPOCH_MIN {
        None
    } else {
        Some(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

fn decode_instant(id: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.map(|text| {
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| DatabaseError::Corrupt {
                id: id.to_owned(),
                reason: format!("bad timestamp {text:?}: {e}"),
            })
    })
    .transpose()
}

fn decode_row(row: SubscriptionRow) -> Result<Subscription, DatabaseError> {
    let (
        id,
        source_address,
        title,
        refresh_interval_secs,
        last_fetch_at,
        last_item_change_at,
        viewed_at,
        items,
        created_at,
    ) = row;

    let items: Vec<FeedItem> = serde_json::from_str(&items).map_err(|e| DatabaseError::Corrupt {
        id: id.clone(),
        reason: format!("bad item list: {e}"),
    })?;

    Ok(Subscription {
        last_fetch_at: decode_instant(&id, last_fetch_at)?.unwrap_or(EPOCH_MIN),
        last_item_change_at: decode_instant(&id, last_item_change_at)?.unwrap_or(EPOCH_MIN),
        viewed_at: decode_instant(&id, viewed_at)?,
        refresh_interval_secs: refresh_interval_secs.max(0) as u64,
        id,
        source_address,
        title,
        items,
        created_at,
    })
}
