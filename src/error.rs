use std::{error::Error as StdError, fmt};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// ACME 錯誤類型前綴。
const PROBLEM_PREFIX: &str = "urn:ietf:params:acme:error:";

/// 錯誤分類，決定回應給客戶端的問題類型與 HTTP 狀態碼。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 請求內容格式錯誤，屬於客戶端問題。
    Malformed,
    /// CSR 內容與訂單不符。
    BadCsr,
    /// 帳戶或 provisioner 無權存取該資源。
    Unauthorized,
    /// 訂單尚未達到可最終確認的狀態。
    OrderNotReady,
    /// 伺服器內部錯誤，細節不對外揭露。
    ServerInternal,
}

impl ErrorKind {
    /// 回傳對應的 ACME 問題類型名稱（不含前綴）。
    pub fn problem_type(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::BadCsr => "badCSR",
            Self::Unauthorized => "unauthorized",
            Self::OrderNotReady => "orderNotReady",
            Self::ServerInternal => "serverInternal",
        }
    }

    /// 錯誤分類與 HTTP 狀態碼的對照表。
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Malformed | Self::BadCsr => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::OrderNotReady => StatusCode::FORBIDDEN,
            Self::ServerInternal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// RFC 7807 問題文件，用於錯誤回應以及訂單、授權、挑戰上的 `error` 欄位。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Problem {
    /// 以錯誤分類與描述建立問題文件。
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            problem_type: format!("{}{}", PROBLEM_PREFIX, kind.problem_type()),
            detail: detail.into(),
            status: Some(kind.status().as_u16()),
        }
    }
}

/// 本庫所有對外操作的錯誤型別。
///
/// 攜帶錯誤分類、可讀的描述，以及可選的底層原因（僅供日誌使用）。
#[derive(Debug)]
pub struct AcmeError {
    kind: ErrorKind,
    detail: String,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

/// 以 [`AcmeError`] 為錯誤型別的結果。
pub type Result<T> = std::result::Result<T, AcmeError>;

impl AcmeError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            cause: None,
        }
    }

    /// 將底層錯誤包裝為指定分類的錯誤。
    pub fn wrap<E>(kind: ErrorKind, cause: E, detail: impl Into<String>) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self {
            kind,
            detail: detail.into(),
            cause: Some(cause.into()),
        }
    }

    /// 將底層錯誤包裝為伺服器內部錯誤。
    pub fn internal<E>(cause: E, detail: impl Into<String>) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::wrap(ErrorKind::ServerInternal, cause, detail)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, detail)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    /// 產生回傳給客戶端的問題文件。
    ///
    /// 內部錯誤只回傳通用訊息，原始描述與原因只出現在日誌中。
    pub fn problem(&self) -> Problem {
        match self.kind {
            ErrorKind::ServerInternal => {
                Problem::new(self.kind, "The server experienced an internal error")
            }
            _ => Problem::new(self.kind, &self.detail),
        }
    }
}

impl fmt::Display for AcmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.detail, cause),
            None => write!(f, "{}", self.detail),
        }
    }
}

impl StdError for AcmeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn StdError + 'static))
    }
}
