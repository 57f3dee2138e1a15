//! Database layer: migrations, local state and receipt storage.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tracing::info;

use crate::errors::{GatewayError, Result};
use crate::fees::PaymentMethod;
use crate::network::Network;
use crate::receipt::ReceiptRecord;

pub const KEY_TOKEN: &str = "token";
pub const KEY_LAST_CAMPAIGN_SLUG: &str = "last_campaign_slug";
pub const KEY_LAST_MOMO_ERROR: &str = "last_momo_error";

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Create the file on first start.
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Local state (token, last campaign, cached errors)
// ─────────────────────────────────────────────────────────

pub async fn get_state(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM local_state WHERE key = ?1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v))
}

pub async fn set_state(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO local_state (key, value, updated_at)
        VALUES (?1, ?2, CAST(strftime('%s', 'now') AS INTEGER))
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_state(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM local_state WHERE key = ?1")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Receipts
// ─────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct ReceiptRow {
    receipt_number: String,
    campaign_slug: String,
    donor_name: String,
    amount: String,
    fee_amount: String,
    total_amount: String,
    payment_method: String,
    network: Option<String>,
    transaction_id: Option<String>,
    reference_no: Option<String>,
    issued_at: i64,
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| GatewayError::Validation(format!("stored amount {raw:?}: {e}")))
}

impl TryFrom<ReceiptRow> for ReceiptRecord {
    type Error = GatewayError;

    fn try_from(row: ReceiptRow) -> Result<Self> {
        let payment_method: PaymentMethod =
            serde_json::from_value(serde_json::Value::String(row.payment_method))?;
        let network = row
            .network
            .map(|n| serde_json::from_value::<Network>(serde_json::Value::String(n)))
            .transpose()?;
        let timestamp = DateTime::<Utc>::from_timestamp(row.issued_at, 0).ok_or_else(|| {
            GatewayError::Validation(format!("stored timestamp {} out of range", row.issued_at))
        })?;

        Ok(ReceiptRecord {
            receipt_number: row.receipt_number,
            campaign_slug: row.campaign_slug,
            donor_name: row.donor_name,
            amount: parse_decimal(&row.amount)?,
            fee_amount: parse_decimal(&row.fee_amount)?,
            total_amount: parse_decimal(&row.total_amount)?,
            payment_method,
            network,
            timestamp,
            transaction_id: row.transaction_id,
            reference_no: row.reference_no,
        })
    }
}

pub async fn insert_receipt(pool: &SqlitePool, receipt: &ReceiptRecord) -> Result<()> {
    let payment_method = match receipt.payment_method {
        PaymentMethod::Momo => "momo",
        PaymentMethod::Card => "card",
    };
    sqlx::query(
        r#"
        INSERT INTO receipts
            (receipt_number, campaign_slug, donor_name, amount, fee_amount, total_amount,
             payment_method, network, transaction_id, reference_no, issued_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&receipt.receipt_number)
    .bind(&receipt.campaign_slug)
    .bind(&receipt.donor_name)
    .bind(receipt.amount.to_string())
    .bind(receipt.fee_amount.to_string())
    .bind(receipt.total_amount.to_string())
    .bind(payment_method)
    .bind(receipt.network.map(|n| n.as_str().to_string()))
    .bind(&receipt.transaction_id)
    .bind(&receipt.reference_no)
    .bind(receipt.timestamp.timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_receipt(pool: &SqlitePool, receipt_number: &str) -> Result<Option<ReceiptRecord>> {
    let row = sqlx::query_as::<_, ReceiptRow>(
        r#"
        SELECT receipt_number, campaign_slug, donor_name, amount, fee_amount, total_amount,
               payment_method, network, transaction_id, reference_no, issued_at
        FROM   receipts
        WHERE  receipt_number = ?1
        "#,
    )
    .bind(receipt_number)
    .fetch_optional(pool)
    .await?;
    row.map(ReceiptRecord::try_from).transpose()
}

/// Single-connection in-memory database for tests.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn local_state_upserts_and_clears() {
        let pool = test_pool().await;
        assert_eq!(get_state(&pool, KEY_TOKEN).await.unwrap(), None);

        set_state(&pool, KEY_TOKEN, "abc").await.unwrap();
        set_state(&pool, KEY_TOKEN, "def").await.unwrap();
        assert_eq!(get_state(&pool, KEY_TOKEN).await.unwrap().as_deref(), Some("def"));

        clear_state(&pool, KEY_TOKEN).await.unwrap();
        assert_eq!(get_state(&pool, KEY_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn receipts_are_stored_and_reloaded() {
        let pool = test_pool().await;
        let receipt = ReceiptRecord {
            receipt_number: "MED-20250124-00000001".to_string(),
            campaign_slug: "clean-water".to_string(),
            donor_name: "Anonymous".to_string(),
            amount: dec!(100),
            fee_amount: dec!(2.50),
            total_amount: dec!(102.50),
            payment_method: PaymentMethod::Momo,
            network: Some(Network::Vodafone),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 24, 10, 0, 0).unwrap(),
            transaction_id: Some("TX-9".to_string()),
            reference_no: None,
        };
        insert_receipt(&pool, &receipt).await.unwrap();

        let loaded = get_receipt(&pool, &receipt.receipt_number).await.unwrap().unwrap();
        assert_eq!(loaded, receipt);
        assert!(get_receipt(&pool, "missing").await.unwrap().is_none());
    }
}
