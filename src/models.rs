use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::store::{
    Edge, Keyed, Predicate, Record, Row, Scalar, StoreError, row_bytes, row_i64, row_opt_text,
    row_text, row_timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        i64::from_str(s).map(Self)
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct RuleId(pub i64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RuleId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        i64::from_str(s).map(Self)
    }
}

impl From<i64> for RuleId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Output of the external key-derivation collaborator; never derived here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordDigest {
    pub key: Vec<u8>,
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub salt: Vec<u8>,
    #[serde(skip_serializing)]
    pub key: Vec<u8>,
}

impl User {
    pub fn with_id(id: UserId) -> Predicate {
        Predicate::eq("id", id.0)
    }

    pub fn among(ids: impl IntoIterator<Item = UserId>) -> Predicate {
        Predicate::one_of("id", ids.into_iter().map(|id| id.0))
    }

    pub fn by_email(email: impl Into<String>) -> Predicate {
        Predicate::eq("email", email.into())
    }

    pub fn name_like(pattern: impl Into<String>) -> Predicate {
        Predicate::like("name", pattern)
    }
}

impl Record for User {
    const TABLE: &'static str = "users";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const AUTO_KEY: Option<&'static str> = Some("id");
    const UNIQUE: &'static [&'static str] = &["name", "email"];

    fn to_row(&self) -> Row {
        Row::from([
            ("id".to_string(), Scalar::Int(self.id.0)),
            ("name".to_string(), Scalar::from(self.name.clone())),
            ("email".to_string(), Scalar::from(self.email.clone())),
            ("salt".to_string(), Scalar::from(self.salt.clone())),
            ("key".to_string(), Scalar::from(self.key.clone())),
        ])
    }

    fn from_row(row: &Row) -> std::result::Result<Self, StoreError> {
        Ok(Self {
            id: UserId(row_i64(row, "id")?),
            name: row_text(row, "name")?,
            email: row_text(row, "email")?,
            salt: row_bytes(row, "salt")?,
            key: row_bytes(row, "key")?,
        })
    }
}

impl Keyed for User {
    const KEY: &'static str = "id";

    fn key(&self) -> i64 {
        self.id.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: RuleId,
    pub user_id: UserId,
    pub created: NaiveDateTime,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Rule {
    pub fn with_id(id: RuleId) -> Predicate {
        Predicate::eq("id", id.0)
    }

    pub fn among(ids: impl IntoIterator<Item = RuleId>) -> Predicate {
        Predicate::one_of("id", ids.into_iter().map(|id| id.0))
    }

    pub fn by_user(user_id: UserId) -> Predicate {
        Predicate::eq("user_id", user_id.0)
    }
}

impl Record for Rule {
    const TABLE: &'static str = "rules";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const AUTO_KEY: Option<&'static str> = Some("id");

    fn to_row(&self) -> Row {
        Row::from([
            ("id".to_string(), Scalar::Int(self.id.0)),
            ("user_id".to_string(), Scalar::Int(self.user_id.0)),
            ("created".to_string(), Scalar::from(self.created)),
            ("summary".to_string(), Scalar::from(self.summary.clone())),
            ("detail".to_string(), Scalar::from(self.detail.clone())),
        ])
    }

    fn from_row(row: &Row) -> std::result::Result<Self, StoreError> {
        Ok(Self {
            id: RuleId(row_i64(row, "id")?),
            user_id: UserId(row_i64(row, "user_id")?),
            created: row_timestamp(row, "created")?,
            summary: row_text(row, "summary")?,
            detail: row_opt_text(row, "detail")?,
        })
    }
}

impl Keyed for Rule {
    const KEY: &'static str = "id";

    fn key(&self) -> i64 {
        self.id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Like {
    pub user_id: UserId,
    pub rule_id: RuleId,
}

impl Like {
    pub fn by_user(user_id: UserId) -> Predicate {
        Predicate::eq("user_id", user_id.0)
    }

    pub fn of_rule(rule_id: RuleId) -> Predicate {
        Predicate::eq("rule_id", rule_id.0)
    }
}

impl Record for Like {
    const TABLE: &'static str = "likes";
    const PRIMARY_KEY: &'static [&'static str] = &["user_id", "rule_id"];

    fn to_row(&self) -> Row {
        Row::from([
            ("user_id".to_string(), Scalar::Int(self.user_id.0)),
            ("rule_id".to_string(), Scalar::Int(self.rule_id.0)),
        ])
    }

    fn from_row(row: &Row) -> std::result::Result<Self, StoreError> {
        Ok(Self {
            user_id: UserId(row_i64(row, "user_id")?),
            rule_id: RuleId(row_i64(row, "rule_id")?),
        })
    }
}

impl Edge for Like {
    const LEFT: &'static str = "user_id";
    const RIGHT: &'static str = "rule_id";

    fn join(left: i64, right: i64) -> Self {
        Self {
            user_id: UserId(left),
            rule_id: RuleId(right),
        }
    }

    fn left(&self) -> i64 {
        self.user_id.0
    }

    fn right(&self) -> i64 {
        self.rule_id.0
    }
}

/// The likes table keyed by `user_id`, for walking the likers of one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeByUser(pub Like);

impl Record for LikeByUser {
    const TABLE: &'static str = "likes";
    const PRIMARY_KEY: &'static [&'static str] = &["user_id", "rule_id"];

    fn to_row(&self) -> Row {
        self.0.to_row()
    }

    fn from_row(row: &Row) -> std::result::Result<Self, StoreError> {
        Like::from_row(row).map(Self)
    }
}

impl Keyed for LikeByUser {
    const KEY: &'static str = "user_id";

    fn key(&self) -> i64 {
        self.0.user_id.0
    }
}

/// The likes table keyed by `rule_id`, for walking the rules one user likes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeByRule(pub Like);

impl Record for LikeByRule {
    const TABLE: &'static str = "likes";
    const PRIMARY_KEY: &'static [&'static str] = &["user_id", "rule_id"];

    fn to_row(&self) -> Row {
        self.0.to_row()
    }

    fn from_row(row: &Row) -> std::result::Result<Self, StoreError> {
        Like::from_row(row).map(Self)
    }
}

impl Keyed for LikeByRule {
    const KEY: &'static str = "rule_id";

    fn key(&self) -> i64 {
        self.0.rule_id.0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub digest: PasswordDigest,
}

impl NewUser {
    pub fn normalize(self) -> Result<Self> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(LibError::invalid(
                "User name is required",
                anyhow!("empty user name"),
            ));
        }
        let email = self.email.trim().to_string();
        if email.is_empty() {
            return Err(LibError::invalid(
                "User email is required",
                anyhow!("empty user email"),
            ));
        }

        Ok(Self {
            name,
            email,
            digest: self.digest,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRule {
    pub summary: String,
    pub detail: Option<String>,
}

impl NewRule {
    pub fn normalize(self) -> Result<Self> {
        let summary = self.summary.trim().to_string();
        if summary.is_empty() {
            return Err(LibError::invalid(
                "Rule summary is required",
                anyhow!("empty rule summary"),
            ));
        }
        let detail = self
            .detail
            .map(|detail| detail.trim().to_string())
            .filter(|detail| !detail.is_empty());

        Ok(Self { summary, detail })
    }
}

/// `after = 0` starts at the beginning, `limit = 0` means no cap.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageArgs {
    pub limit: u32,
    pub after: i64,
}
