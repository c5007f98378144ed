//! Transaction status and kind enums shared by the scrapers and the store

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Primary and audit status share the same value space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Success,
    Rejected,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "Pending",
            TransactionStatus::Success => "Success",
            TransactionStatus::Rejected => "Rejected",
        }
    }

    /// Success and Rejected are final; the store never moves back to Pending
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Numeric codes used by some portal builds (0 pending, 1 success, 2 rejected)
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TransactionStatus::Pending),
            1 => Some(TransactionStatus::Success),
            2 => Some(TransactionStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" | "processing" | "waiting" => Ok(TransactionStatus::Pending),
            "success" | "successful" | "approved" | "completed" => Ok(TransactionStatus::Success),
            "rejected" | "declined" | "failed" | "cancelled" => Ok(TransactionStatus::Rejected),
            other => other
                .parse::<i64>()
                .ok()
                .and_then(TransactionStatus::from_code)
                .ok_or_else(|| format!("Unknown transaction status: {}", s)),
        }
    }
}

/// Deposits carry non-negative amounts, withdrawals negative ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
        }
    }

    /// Force the sign convention regardless of how the portal renders it
    pub fn signed_amount(&self, amount: Decimal) -> Decimal {
        match self {
            TransactionKind::Deposit => amount.abs(),
            TransactionKind::Withdrawal => -amount.abs(),
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdrawal" | "withdraw" => Ok(TransactionKind::Withdrawal),
            _ => Err(format!("Unknown transaction kind: {}", s)),
        }
    }
}
