use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub display_name: String,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub role: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Returned when a stored or submitted enum string is not one we know.
#[derive(Debug, Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Tenant role, most privileged first.
///
/// `Staff` comes from the alternate `{owner, manager, staff}` scheme. Strings
/// outside the priority list become `Unrecognized` and rank below everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Owner,
    Admin,
    Manager,
    Member,
    Staff,
    Viewer,
    Unrecognized(String),
}

impl Role {
    pub const PRIORITY: [Role; 6] = [
        Role::Owner,
        Role::Admin,
        Role::Manager,
        Role::Member,
        Role::Staff,
        Role::Viewer,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Member => "member",
            Role::Staff => "staff",
            Role::Viewer => "viewer",
            Role::Unrecognized(s) => s.as_str(),
        }
    }

    /// Position in the priority list; lower is more privileged.
    pub fn rank(&self) -> usize {
        Self::PRIORITY
            .iter()
            .position(|r| r == self)
            .unwrap_or(Self::PRIORITY.len())
    }

    /// Whether this role meets `min`. An unrecognized role on either side
    /// never satisfies a check.
    pub fn satisfies(&self, min: &Role) -> bool {
        if self.is_unrecognized() || min.is_unrecognized() {
            return false;
        }
        self.rank() <= min.rank()
    }

    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Role::Unrecognized(_))
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Role::Owner,
            "admin" => Role::Admin,
            "manager" => Role::Manager,
            "member" => Role::Member,
            "staff" => Role::Staff,
            "viewer" => Role::Viewer,
            _ => Role::Unrecognized(s.to_string()),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::from(s.as_str())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Role::from(s))
    }
}

/// Implements the string plumbing shared by the text-backed status enums.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditStatus {
    Active,
    Suspended,
    Closed,
    Defaulted,
}

text_enum!(CreditStatus, "credit status", {
    Active => "active",
    Suspended => "suspended",
    Closed => "closed",
    Defaulted => "defaulted",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Charge,
    Payment,
    Fee,
    Adjustment,
}

text_enum!(TransactionType, "transaction type", {
    Charge => "charge",
    Payment => "payment",
    Fee => "fee",
    Adjustment => "adjustment",
});

impl TransactionType {
    /// Signed ledger amount for a caller-supplied amount.
    ///
    /// Charges and fees take a positive magnitude and add to the balance,
    /// payments take a positive magnitude and subtract from it. Adjustments
    /// keep the caller's sign.
    pub fn signed_amount(self, amount: i64) -> Option<i64> {
        match self {
            TransactionType::Charge | TransactionType::Fee if amount > 0 => Some(amount),
            TransactionType::Payment if amount > 0 => amount.checked_neg(),
            TransactionType::Adjustment if amount != 0 => Some(amount),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

text_enum!(TransactionStatus, "transaction status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Reversed => "reversed",
});

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CreditAccount {
    pub credit_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: String,
    pub credit_limit: i64,
    #[sqlx(try_from = "String")]
    pub status: CreditStatus,
    pub payment_method_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CreditTransaction {
    pub transaction_id: Uuid,
    pub credit_id: Uuid,
    pub tenant_id: Uuid,
    #[sqlx(try_from = "String")]
    pub transaction_type: TransactionType,
    pub amount: i64,
    #[sqlx(try_from = "String")]
    pub status: TransactionStatus,
    pub idempotency_key: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    pub reversal_of: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoyaltyEntryKind {
    Accrual,
    Redemption,
}

text_enum!(LoyaltyEntryKind, "loyalty entry kind", {
    Accrual => "accrual",
    Redemption => "redemption",
});

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyAccount {
    pub loyalty_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyEntry {
    pub entry_id: Uuid,
    pub loyalty_id: Uuid,
    pub tenant_id: Uuid,
    #[sqlx(try_from = "String")]
    pub kind: LoyaltyEntryKind,
    pub points: i64,
    pub reason: Option<String>,
    pub idempotency_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Authenticated caller, as established by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_is_case_insensitive_and_keeps_unknowns() {
        assert_eq!(Role::from("ADMIN"), Role::Admin);
        assert_eq!(Role::from(" viewer "), Role::Viewer);
        assert_eq!(Role::from("superuser"), Role::Unrecognized("superuser".into()));
    }

    #[test]
    fn role_priority_is_total_and_strict() {
        for (i, higher) in Role::PRIORITY.iter().enumerate() {
            for lower in &Role::PRIORITY[i + 1..] {
                assert!(higher.satisfies(lower), "{higher} should satisfy {lower}");
                assert!(!lower.satisfies(higher), "{lower} should not satisfy {higher}");
            }
            assert!(higher.satisfies(higher));
        }
    }

    #[test]
    fn unrecognized_roles_sort_last_and_never_satisfy() {
        let odd = Role::from("root");
        assert_eq!(odd.rank(), Role::PRIORITY.len());
        assert!(!odd.satisfies(&Role::Viewer));
        assert!(!odd.satisfies(&Role::from("root")));
        assert!(!Role::Owner.satisfies(&odd));
    }

    #[test]
    fn signed_amount_follows_transaction_type() {
        assert_eq!(TransactionType::Charge.signed_amount(500), Some(500));
        assert_eq!(TransactionType::Fee.signed_amount(25), Some(25));
        assert_eq!(TransactionType::Payment.signed_amount(300), Some(-300));
        assert_eq!(TransactionType::Adjustment.signed_amount(-40), Some(-40));
        assert_eq!(TransactionType::Charge.signed_amount(-1), None);
        assert_eq!(TransactionType::Payment.signed_amount(0), None);
        assert_eq!(TransactionType::Adjustment.signed_amount(0), None);
    }

    #[test]
    fn status_strings_round_trip_through_text_columns() {
        assert_eq!(
            CreditStatus::try_from("defaulted".to_string()).unwrap(),
            CreditStatus::Defaulted
        );
        assert!("frozen".parse::<CreditStatus>().is_err());
        assert_eq!(TransactionStatus::Reversed.to_string(), "reversed");
    }
}
