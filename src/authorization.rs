use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    challenge::{challenge_types, Challenge, ChallengeStatus},
    db::AcmeDb,
    error::{AcmeError, ErrorKind, Problem, Result},
    identifier::Identifier,
    random,
};

/// 授權狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// 表示單一識別項的授權，以及證明控制權所需的挑戰集合。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub id: String,
    pub account_id: String,
    /// 已去除萬用字元前綴的識別項
    pub identifier: Identifier,
    /// 原始識別項是否帶有 `*.` 前綴
    #[serde(default)]
    pub wildcard: bool,
    pub status: AuthorizationStatus,
    /// 所有挑戰共用的 token
    pub token: String,
    pub challenges: Vec<Challenge>,
    #[serde(rename = "expires")]
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl Authorization {
    /// 依據目前時間與挑戰狀態重新計算授權狀態，並在有變更時寫回資料庫。
    ///
    /// - 只有 pending 授權會被重新計算。
    /// - 過期的授權轉為 invalid。
    /// - 任一挑戰為 valid 時轉為 valid；否則任一挑戰為 invalid 時轉為 invalid。
    /// - 其餘情況維持 pending，不寫入資料庫。
    ///
    /// 若寫入時發現已被其他請求更新，改為重新讀取資料庫中的內容。
    pub fn update_status(&mut self, db: &dyn AcmeDb, now: DateTime<Utc>) -> Result<()> {
        if self.status != AuthorizationStatus::Pending {
            return Ok(());
        }

        if now > self.expires_at {
            self.status = AuthorizationStatus::Invalid;
            self.error = Some(Problem::new(
                ErrorKind::Malformed,
                "authorization has expired",
            ));
        } else if let Some(ch) = self
            .challenges
            .iter()
            .find(|ch| ch.status == ChallengeStatus::Valid)
        {
            debug!(authz_id = %self.id, challenge = %ch.challenge_type, "challenge validated");
            self.status = AuthorizationStatus::Valid;
            self.error = None;
        } else if let Some(ch) = self
            .challenges
            .iter()
            .find(|ch| ch.status == ChallengeStatus::Invalid)
        {
            self.status = AuthorizationStatus::Invalid;
            self.error = ch.error.clone();
        } else {
            return Ok(());
        }

        match db.update_authorization(self, AuthorizationStatus::Pending) {
            Ok(()) => {
                info!(authz_id = %self.id, status = ?self.status, "authorization status updated");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                *self = db
                    .get_authorization(&self.id)
                    .map_err(|e| AcmeError::internal(e, "error retrieving authorization"))?;
                Ok(())
            }
            Err(e) => Err(AcmeError::internal(e, "error updating authorization")),
        }
    }
}

/// 為單一識別項建立授權與其挑戰集合並寫入資料庫。
///
/// 會移除 `*.` 前綴並設定萬用字元旗標，產生所有挑戰共用的 token，
/// 再依識別項類型建立 pending 挑戰。任何寫入失敗都視為內部錯誤；
/// 已寫入的挑戰沒有授權參照，留在資料庫中不影響其他紀錄。
pub fn new_authorization(
    db: &dyn AcmeDb,
    account_id: &str,
    identifier: &Identifier,
    expires_at: DateTime<Utc>,
    token_length: usize,
) -> Result<Authorization> {
    let (identifier, wildcard) = identifier.strip_wildcard();

    let token = random::alphanumeric(token_length)
        .map_err(|e| AcmeError::internal(e, "error generating random alphanumeric ID"))?;

    let mut challenges = Vec::new();
    for challenge_type in challenge_types(&identifier.type_, wildcard) {
        let mut ch = Challenge::new(account_id, challenge_type, &identifier.value, &token);
        db.create_challenge(&mut ch)
            .map_err(|e| AcmeError::internal(e, "error creating challenge"))?;
        challenges.push(ch);
    }

    let mut az = Authorization {
        id: String::new(),
        account_id: account_id.to_owned(),
        identifier,
        wildcard,
        status: AuthorizationStatus::Pending,
        token,
        challenges,
        expires_at,
        error: None,
    };
    db.create_authorization(&mut az)
        .map_err(|e| AcmeError::internal(e, "error creating authorization"))?;

    debug!(
        authz_id = %az.id,
        identifier = %az.identifier.value,
        wildcard = az.wildcard,
        challenges = az.challenges.len(),
        "authorization created"
    );
    Ok(az)
}
