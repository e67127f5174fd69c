use chrono::{Local, NaiveDate};
use metrics::counter;
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::OrderNumberStrategy;
use crate::entities::{order, order_sequence, Order, OrderSequence};

const SEQUENCE_DIGITS: usize = 5;

/// Issues public order numbers of the form `YYYYMMDD` + 5-digit sequence.
///
/// The atomic strategy bumps a per-day counter row in one upsert. The scan
/// strategy (and the fallback when the upsert fails) reads the highest number
/// issued today and adds one; it can race, so order creation retries on a
/// unique violation. Generation itself never fails.
#[derive(Clone)]
pub struct OrderNumberGenerator {
    db: Arc<DatabaseConnection>,
    strategy: OrderNumberStrategy,
}

impl OrderNumberGenerator {
    pub fn new(db: Arc<DatabaseConnection>, strategy: OrderNumberStrategy) -> Self {
        Self { db, strategy }
    }

    /// Next number for the server's local calendar day.
    pub async fn next(&self) -> String {
        self.next_for_date(Local::now().date_naive()).await
    }

    #[instrument(skip(self))]
    pub async fn next_for_date(&self, date: NaiveDate) -> String {
        let prefix = date_prefix(date);

        if self.strategy == OrderNumberStrategy::Atomic {
            match self.next_atomic(&prefix).await {
                Ok(seq) => return format_order_number(&prefix, seq),
                Err(e) => {
                    warn!(error = %e, "atomic order sequence unavailable, scanning instead");
                    counter!("order_numbers.fallback_used", 1);
                }
            }
        }

        match self.next_by_scan(&prefix).await {
            Ok(seq) => format_order_number(&prefix, seq),
            Err(e) => {
                warn!(error = %e, "order number scan failed, starting at 1");
                format_order_number(&prefix, 1)
            }
        }
    }

    /// `INSERT .. ON CONFLICT (seq_date) DO UPDATE SET last_value = last_value + 1 RETURNING last_value`
    async fn next_atomic(&self, prefix: &str) -> Result<i64, DbErr> {
        let mut insert = Query::insert();
        insert
            .into_table(OrderSequence)
            .columns([
                order_sequence::Column::SeqDate,
                order_sequence::Column::LastValue,
            ])
            .values([prefix.into(), 1i32.into()])
            .map_err(|e| DbErr::Custom(e.to_string()))?
            .on_conflict(
                OnConflict::column(order_sequence::Column::SeqDate)
                    .value(
                        order_sequence::Column::LastValue,
                        Expr::col((OrderSequence, order_sequence::Column::LastValue)).add(1),
                    )
                    .to_owned(),
            )
            .returning_col(order_sequence::Column::LastValue);

        let backend = self.db.get_database_backend();
        let row = self
            .db
            .query_one(backend.build(&insert))
            .await?
            .ok_or_else(|| DbErr::Custom("sequence upsert returned no row".to_string()))?;
        let value: i32 = row.try_get("", "last_value")?;
        debug!(prefix, value, "atomic order sequence");
        Ok(i64::from(value))
    }

    async fn next_by_scan(&self, prefix: &str) -> Result<i64, DbErr> {
        let latest: Option<String> = Order::find()
            .select_only()
            .column(order::Column::OrderNumber)
            .filter(order::Column::OrderNumber.starts_with(prefix))
            .order_by_desc(order::Column::OrderNumber)
            .into_tuple()
            .one(&*self.db)
            .await?;

        Ok(latest
            .and_then(|number| parse_sequence(&number, prefix))
            .map_or(1, |seq| seq + 1))
    }
}

pub fn date_prefix(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn format_order_number(prefix: &str, seq: i64) -> String {
    format!("{}{:0width$}", prefix, seq, width = SEQUENCE_DIGITS)
}

/// Trailing sequence of an order number issued under `prefix`.
pub fn parse_sequence(order_number: &str, prefix: &str) -> Option<i64> {
    let rest = order_number.strip_prefix(prefix)?;
    if rest.len() < SEQUENCE_DIGITS || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_day_prefix_and_padded_sequence() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let prefix = date_prefix(date);
        assert_eq!(prefix, "20261019");
        assert_eq!(format_order_number(&prefix, 1), "2026101900001");
        assert_eq!(format_order_number(&prefix, 42), "2026101900042");
    }

    #[test]
    fn parses_trailing_sequence() {
        assert_eq!(parse_sequence("2026101900041", "20261019"), Some(41));
        assert_eq!(parse_sequence("2026101900041", "20261018"), None);
        assert_eq!(parse_sequence("20261019abcde", "20261019"), None);
        assert_eq!(parse_sequence("2026101912", "20261019"), None);
    }
}
