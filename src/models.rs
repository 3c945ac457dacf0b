// src/models.rs
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::Serialize;

/// Withdrawal request lifecycle. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Broadcast,
    Confirmed,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Broadcast => "broadcast",
            WithdrawalStatus::Confirmed => "confirmed",
            WithdrawalStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WithdrawalStatus::Pending),
            "approved" => Some(WithdrawalStatus::Approved),
            "broadcast" => Some(WithdrawalStatus::Broadcast),
            "confirmed" => Some(WithdrawalStatus::Confirmed),
            "failed" => Some(WithdrawalStatus::Failed),
            _ => None,
        }
    }
}

impl FromSql for WithdrawalStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        WithdrawalStatus::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for WithdrawalStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    Failed,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Confirmed => "confirmed",
            DepositStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DepositStatus::Pending),
            "confirmed" => Some(DepositStatus::Confirmed),
            "failed" => Some(DepositStatus::Failed),
            _ => None,
        }
    }
}

impl FromSql for DepositStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        DepositStatus::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for DepositStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Processing => "processing",
            IntentStatus::Completed => "completed",
            IntentStatus::Failed => "failed",
            IntentStatus::Canceled => "canceled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IntentStatus::Pending),
            "processing" => Some(IntentStatus::Processing),
            "completed" => Some(IntentStatus::Completed),
            "failed" => Some(IntentStatus::Failed),
            "canceled" => Some(IntentStatus::Canceled),
            _ => None,
        }
    }
}

impl FromSql for IntentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        IntentStatus::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for IntentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

/// Minimal account row: balance source of truth plus referral linkage.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub invite_code: Option<String>,
    pub referred_by: Option<String>,
    pub is_active: bool,
    pub balance: String,
}

/// Immutable per-user deposit address, a pure function of the derivation index.
#[derive(Debug, Clone, Serialize)]
pub struct DepositAddress {
    pub user_id: String,
    pub address: String,
    pub derivation_index: u32,
    pub network: String,
}

/// One row per observed on-chain transfer, keyed by tx_hash.
#[derive(Debug, Clone, Serialize)]
pub struct Deposit {
    pub tx_hash: String,
    pub user_id: String,
    pub to_address: String,
    pub amount: String, // exact decimal string, never floating point
    pub token: String,
    pub status: DepositStatus,
    pub confirmations: u64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: String,
    pub gross: String,
    pub fee: String,
    pub net: String,
    pub network: String,
    pub address: String,
    pub status: WithdrawalStatus,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub price: String,
    pub duration_days: i64,
    pub level1_pct: String,
    pub level2_pct: String,
    pub level3_pct: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseIntent {
    pub id: i64,
    pub user_id: String,
    pub plan_id: i64,
    pub status: IntentStatus,
    pub attempts: i64,
}
