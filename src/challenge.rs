use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::Problem, identifier::IdentifierType};

/// 表示 ACME 挑戰的類型。挑戰的實際驗證由外部的驗證元件負責。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

impl ChallengeType {
    /// 返回挑戰類型對應的字串表示。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl FromStr for ChallengeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-01" => Ok(Self::Http01),
            "dns-01" => Ok(Self::Dns01),
            "tls-alpn-01" => Ok(Self::TlsAlpn01),
            _ => Err(format!("unsupported challenge type: {}", s)),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 表示挑戰的狀態：pending → processing → valid / invalid。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// 表示一個挑戰紀錄。
///
/// 由授權工廠建立，之後只由外部驗證元件更新狀態。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    /// 挑戰所驗證的識別項值（已去除萬用字元前綴）
    pub value: String,
    /// 與所屬授權共用的 token
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
    /// 由 Linker 填入的挑戰 URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

impl Challenge {
    /// 建立一個尚未儲存的 pending 挑戰，ID 由資料庫在建立時指派。
    pub fn new(account_id: &str, challenge_type: ChallengeType, value: &str, token: &str) -> Self {
        Self {
            id: String::new(),
            account_id: account_id.to_owned(),
            challenge_type,
            value: value.to_owned(),
            token: token.to_owned(),
            status: ChallengeStatus::Pending,
            validated_at: None,
            error: None,
            url: String::new(),
        }
    }
}

/// 根據識別項類型與萬用字元旗標，決定可接受的挑戰類型。
///
/// - IP：`http-01`、`tls-alpn-01`
/// - DNS：`dns-01`，非萬用字元時另加 `http-01`、`tls-alpn-01`
/// - 其他類型：空集合
pub fn challenge_types(identifier_type: &IdentifierType, wildcard: bool) -> Vec<ChallengeType> {
    match identifier_type {
        IdentifierType::Ip => vec![ChallengeType::Http01, ChallengeType::TlsAlpn01],
        IdentifierType::Dns => {
            let mut types = vec![ChallengeType::Dns01];
            // HTTP 與 TLS 挑戰無法證明萬用字元名稱的控制權
            if !wildcard {
                types.extend([ChallengeType::Http01, ChallengeType::TlsAlpn01]);
            }
            types
        }
        IdentifierType::Unsupported(_) => Vec::new(),
    }
}
