//! 訂單、授權與挑戰紀錄的持久化介面，以及建立在鍵值儲存上的實作。

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    authorization::{Authorization, AuthorizationStatus},
    challenge::{Challenge, ChallengeStatus},
    error::Problem,
    identifier::Identifier,
    order::{Order, OrderStatus},
    random,
    storage::{Storage, StorageError},
};

/// 資料庫操作可能發生的錯誤。
#[derive(Debug, Error)]
pub enum DbError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} was modified concurrently")]
    Conflict { kind: &'static str, id: String },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ID generation failed: {0}")]
    Random(#[from] openssl::error::ErrorStack),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// 資料庫介面。
///
/// `create_*` 會指派新的 ID 並寫回傳入的紀錄。`update_*` 為單一原子操作：
/// 只有在已儲存紀錄的狀態仍為 `expected` 時才會寫入，否則回傳 [`DbError::Conflict`]。
pub trait AcmeDb: Send + Sync {
    fn create_order(&self, order: &mut Order) -> Result<()>;
    fn get_order(&self, id: &str) -> Result<Order>;
    fn update_order(&self, order: &Order, expected: OrderStatus) -> Result<()>;

    fn create_authorization(&self, az: &mut Authorization) -> Result<()>;
    fn get_authorization(&self, id: &str) -> Result<Authorization>;
    fn update_authorization(&self, az: &Authorization, expected: AuthorizationStatus) -> Result<()>;

    fn create_challenge(&self, ch: &mut Challenge) -> Result<()>;
    fn get_challenge(&self, id: &str) -> Result<Challenge>;
    fn update_challenge(&self, ch: &Challenge, expected: ChallengeStatus) -> Result<()>;
}

const ID_LENGTH: usize = 32;

const ORDER: &str = "order";
const AUTHORIZATION: &str = "authorization";
const CHALLENGE: &str = "challenge";

/// 儲存的授權紀錄，挑戰只保存 ID，讀取時再組合。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationRecord {
    id: String,
    account_id: String,
    identifier: Identifier,
    wildcard: bool,
    status: AuthorizationStatus,
    token: String,
    challenge_ids: Vec<String>,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Problem>,
}

impl From<&Authorization> for AuthorizationRecord {
    fn from(az: &Authorization) -> Self {
        Self {
            id: az.id.clone(),
            account_id: az.account_id.clone(),
            identifier: az.identifier.clone(),
            wildcard: az.wildcard,
            status: az.status,
            token: az.token.clone(),
            challenge_ids: az.challenges.iter().map(|ch| ch.id.clone()).collect(),
            expires_at: az.expires_at,
            error: az.error.clone(),
        }
    }
}

/// 以 JSON 紀錄的形式把資料存放在任意 [`Storage`] 上。
///
/// key 格式為 `orders/<id>`、`authz/<id>`、`challenges/<id>`。
#[derive(Debug)]
pub struct KvDb<S: Storage> {
    storage: S,
}

impl<S: Storage> KvDb<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn order_key(id: &str) -> String {
        format!("orders/{}", id)
    }

    fn authz_key(id: &str) -> String {
        format!("authz/{}", id)
    }

    fn challenge_key(id: &str) -> String {
        format!("challenges/{}", id)
    }

    fn read_record<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        key: &str,
        id: &str,
    ) -> Result<(T, Vec<u8>)> {
        let raw = self.storage.read(key).map_err(|e| match e {
            StorageError::NotFound(_) => DbError::NotFound {
                kind,
                id: id.to_owned(),
            },
            other => DbError::Storage(other),
        })?;
        Ok((serde_json::from_slice(&raw)?, raw))
    }

    fn insert_record<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.storage.insert(key, &raw)?;
        Ok(())
    }

    /// 讀取目前紀錄，確認狀態後以 compare-and-swap 寫入新內容。
    fn swap_record<T, F>(
        &self,
        kind: &'static str,
        key: &str,
        id: &str,
        value: &T,
        is_expected: F,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let (stored, raw): (T, Vec<u8>) = self.read_record(kind, key, id)?;
        let conflict = || DbError::Conflict {
            kind,
            id: id.to_owned(),
        };
        if !is_expected(&stored) {
            debug!(kind, id, "stored status differs from expected status");
            return Err(conflict());
        }
        let new_raw = serde_json::to_vec(value)?;
        if !self.storage.compare_and_swap(key, &raw, &new_raw)? {
            debug!(kind, id, "record changed between read and write");
            return Err(conflict());
        }
        Ok(())
    }
}

impl<S: Storage> AcmeDb for KvDb<S> {
    fn create_order(&self, order: &mut Order) -> Result<()> {
        order.id = random::alphanumeric(ID_LENGTH)?;
        self.insert_record(&Self::order_key(&order.id), &order.without_links())
    }

    fn get_order(&self, id: &str) -> Result<Order> {
        let (order, _): (Order, _) = self.read_record(ORDER, &Self::order_key(id), id)?;
        Ok(order)
    }

    fn update_order(&self, order: &Order, expected: OrderStatus) -> Result<()> {
        self.swap_record(
            ORDER,
            &Self::order_key(&order.id),
            &order.id,
            &order.without_links(),
            |stored: &Order| stored.status == expected,
        )
    }

    fn create_authorization(&self, az: &mut Authorization) -> Result<()> {
        az.id = random::alphanumeric(ID_LENGTH)?;
        self.insert_record(&Self::authz_key(&az.id), &AuthorizationRecord::from(&*az))
    }

    fn get_authorization(&self, id: &str) -> Result<Authorization> {
        let (record, _): (AuthorizationRecord, _) =
            self.read_record(AUTHORIZATION, &Self::authz_key(id), id)?;
        let challenges = record
            .challenge_ids
            .iter()
            .map(|ch_id| self.get_challenge(ch_id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Authorization {
            id: record.id,
            account_id: record.account_id,
            identifier: record.identifier,
            wildcard: record.wildcard,
            status: record.status,
            token: record.token,
            challenges,
            expires_at: record.expires_at,
            error: record.error,
        })
    }

    fn update_authorization(
        &self,
        az: &Authorization,
        expected: AuthorizationStatus,
    ) -> Result<()> {
        self.swap_record(
            AUTHORIZATION,
            &Self::authz_key(&az.id),
            &az.id,
            &AuthorizationRecord::from(az),
            |stored: &AuthorizationRecord| stored.status == expected,
        )
    }

    fn create_challenge(&self, ch: &mut Challenge) -> Result<()> {
        ch.id = random::alphanumeric(ID_LENGTH)?;
        let mut record = ch.clone();
        record.url.clear();
        self.insert_record(&Self::challenge_key(&ch.id), &record)
    }

    fn get_challenge(&self, id: &str) -> Result<Challenge> {
        let (ch, _): (Challenge, _) = self.read_record(CHALLENGE, &Self::challenge_key(id), id)?;
        Ok(ch)
    }

    fn update_challenge(&self, ch: &Challenge, expected: ChallengeStatus) -> Result<()> {
        let mut record = ch.clone();
        record.url.clear();
        self.swap_record(
            CHALLENGE,
            &Self::challenge_key(&ch.id),
            &ch.id,
            &record,
            |stored: &Challenge| stored.status == expected,
        )
    }
}
