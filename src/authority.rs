//! 證書簽發端的介面。實際的簽發流程由呼叫端提供。

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::{csr::CertificateRequest, identifier::Identifier};

/// 簽發失敗時的錯誤。
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("Certificate request rejected: {0}")]
    Rejected(String),
    #[error("Signing backend error: {0}")]
    Backend(String),
}

/// 簽發證書時附帶的參數。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOptions {
    /// 訂單上已完成授權的識別項
    pub identifiers: Vec<Identifier>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub provisioner_id: String,
    /// provisioner 的預設證書有效期間
    pub default_duration: Duration,
}

/// 證書簽發者。
///
/// 成功時回傳新證書的 ID，訂單會以此 ID 產生證書連結。
pub trait Authority: Send + Sync {
    fn sign(
        &self,
        csr: &CertificateRequest,
        options: &SignOptions,
    ) -> Result<String, AuthorityError>;
}
