use std::{fmt, net::IpAddr};

use serde::{Deserialize, Serialize};

use crate::error::{AcmeError, Result};

/// 萬用字元識別項的前綴。
const WILDCARD_PREFIX: &str = "*.";

/// 識別項類型。未知類型保留原始字串，以便在錯誤訊息中指出。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IdentifierType {
    Dns,
    Ip,
    Unsupported(String),
}

impl IdentifierType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Dns => "dns",
            Self::Ip => "ip",
            Self::Unsupported(s) => s,
        }
    }
}

impl From<String> for IdentifierType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "dns" => Self::Dns,
            "ip" => Self::Ip,
            _ => Self::Unsupported(s),
        }
    }
}

impl From<IdentifierType> for String {
    fn from(t: IdentifierType) -> Self {
        t.as_str().to_owned()
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 表示一個識別項，用來描述證書所涵蓋的主機名稱或 IP 位址。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: IdentifierType,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Self {
            type_: IdentifierType::Dns,
            value: value.to_owned(),
        }
    }

    pub fn ip(value: &str) -> Self {
        Self {
            type_: IdentifierType::Ip,
            value: value.to_owned(),
        }
    }

    /// 判斷識別項值是否帶有 `*.` 萬用字元前綴。
    pub fn is_wildcard(&self) -> bool {
        self.value.starts_with(WILDCARD_PREFIX)
    }

    /// 移除萬用字元前綴，回傳處理後的識別項以及是否為萬用字元。
    pub fn strip_wildcard(&self) -> (Self, bool) {
        match self.value.strip_prefix(WILDCARD_PREFIX) {
            Some(stripped) => (
                Self {
                    type_: self.type_.clone(),
                    value: stripped.to_owned(),
                },
                true,
            ),
            None => (self.clone(), false),
        }
    }
}

/// 驗證新訂單的識別項清單。
///
/// - 清單不可為空。
/// - 類型必須為 `dns` 或 `ip`。
/// - `ip` 類型的值必須能解析為 IP 位址。
///
/// DNS 名稱的語法不在此檢查，由 provisioner 的政策決定。
pub fn validate_identifiers(identifiers: &[Identifier]) -> Result<()> {
    if identifiers.is_empty() {
        return Err(AcmeError::malformed("identifiers list cannot be empty"));
    }
    for id in identifiers {
        match &id.type_ {
            IdentifierType::Dns => {}
            IdentifierType::Ip => {
                if id.value.parse::<IpAddr>().is_err() {
                    return Err(AcmeError::malformed(format!(
                        "invalid IP address: {}",
                        id.value
                    )));
                }
            }
            IdentifierType::Unsupported(t) => {
                return Err(AcmeError::malformed(format!(
                    "identifier type unsupported: {}",
                    t
                )));
            }
        }
    }
    Ok(())
}
