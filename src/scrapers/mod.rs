pub mod browser;
pub mod interceptor;
pub mod login;
pub mod monitor;
pub mod parser;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::transaction::{TransactionKind, TransactionStatus};

/// Which slice of the portal a category's view shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryStatus {
    Pending,
    Approved,
    Rejected,
}

/// Extra step for views that only show a subset after a filter is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterStep {
    pub select_selector: String,
    pub alternate_select_selector: String,
    pub option_value: String,
    pub submit_selector: String,
    pub alternate_submit_selector: String,
}

/// One monitored category: where its view lives and which response feeds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub key: String,
    pub kind: TransactionKind,
    pub status: CategoryStatus,
    pub view_path: String,
    pub list_endpoint: String,
    pub table_selector: String,
    pub filter: Option<FilterStep>,
    pub fetch_transcripts: bool,
}

impl Category {
    fn build(kind: TransactionKind, status: CategoryStatus) -> Self {
        let noun = match kind {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
        };
        let (key_suffix, view, endpoint) = match status {
            CategoryStatus::Pending => ("pending", "pending", "pending"),
            CategoryStatus::Approved => ("approved", "recent", "recent"),
            CategoryStatus::Rejected => ("rejected", "recent", "recent"),
        };

        // The recent view lists approved rows by default; rejected ones need the status filter
        let filter = (status == CategoryStatus::Rejected).then(|| FilterStep {
            select_selector: "select[name='transactionStatus']".to_string(),
            alternate_select_selector: "#statusFilter select".to_string(),
            option_value: "Rejected".to_string(),
            submit_selector: "button.search-btn".to_string(),
            alternate_submit_selector: "form button[type='submit']".to_string(),
        });

        Self {
            key: format!("{}_{}", noun, key_suffix),
            kind,
            status,
            view_path: format!("/{}/{}", noun, view),
            list_endpoint: format!("/api/{}s/{}", noun, endpoint),
            table_selector: "table tbody tr".to_string(),
            filter,
            fetch_transcripts: kind == TransactionKind::Deposit,
        }
    }

    pub fn all() -> Vec<Self> {
        let mut categories = Vec::with_capacity(6);
        for kind in [TransactionKind::Deposit, TransactionKind::Withdrawal] {
            for status in [
                CategoryStatus::Pending,
                CategoryStatus::Approved,
                CategoryStatus::Rejected,
            ] {
                categories.push(Self::build(kind, status));
            }
        }
        categories
    }

    pub fn by_key(key: &str) -> Option<Self> {
        Self::all().into_iter().find(|c| c.key == key)
    }
}

/// Raw transaction as the portal's list endpoint delivers it
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedTransaction {
    #[serde(
        rename = "orderID",
        alias = "orderId",
        alias = "order_id",
        default,
        deserialize_with = "parser::de_opt_string"
    )]
    pub order_id: Option<String>,
    #[serde(default, deserialize_with = "parser::de_opt_amount")]
    pub amount: Option<Decimal>,
    #[serde(default, deserialize_with = "parser::de_opt_status")]
    pub transaction_status: Option<TransactionStatus>,
    #[serde(default, deserialize_with = "parser::de_opt_status")]
    pub audit_status: Option<TransactionStatus>,
    #[serde(default, alias = "createdAt", deserialize_with = "parser::de_opt_timestamp")]
    pub request_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "parser::de_opt_timestamp")]
    pub approved_on: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "parser::de_opt_timestamp")]
    pub rejected_on: Option<DateTime<Utc>>,
    #[serde(default, alias = "bonus", deserialize_with = "parser::de_opt_amount")]
    pub bonus_amount: Option<Decimal>,
    #[serde(default, alias = "extraBonus", deserialize_with = "parser::de_opt_amount")]
    pub extra_bonus_amount: Option<Decimal>,
    #[serde(default, deserialize_with = "parser::de_flag")]
    pub is_image_available: bool,
    #[serde(default, alias = "franchise", deserialize_with = "parser::de_opt_string")]
    pub franchise_name: Option<String>,
    #[serde(default, alias = "playerName", deserialize_with = "parser::de_opt_string")]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "parser::de_opt_string")]
    pub payment_method: Option<String>,
    #[serde(default, alias = "remark", deserialize_with = "parser::de_opt_string")]
    pub remarks: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_six_categories() {
        let categories = Category::all();
        assert_eq!(categories.len(), 6);

        let filtered: Vec<_> = categories
            .iter()
            .filter(|c| c.filter.is_some())
            .map(|c| c.key.as_str())
            .collect();
        assert_eq!(filtered, vec!["deposit_rejected", "withdrawal_rejected"]);
    }

    #[test]
    fn test_category_descriptor() {
        let category = Category::by_key("withdrawal_approved").unwrap();
        assert_eq!(category.kind, TransactionKind::Withdrawal);
        assert_eq!(category.view_path, "/withdrawal/recent");
        assert_eq!(category.list_endpoint, "/api/withdrawals/recent");
        assert!(!category.fetch_transcripts);

        let category = Category::by_key("deposit_pending").unwrap();
        assert!(category.fetch_transcripts);
        assert!(Category::by_key("deposit_unknown").is_none());
    }
}
