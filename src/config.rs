//! 訂單處理相關的可調參數，以 builder 模式建立。

use chrono::Duration;
use thiserror::Error;

/// 設定值不合法時的錯誤。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Token length must be at least {min}, got {got}")]
    TokenTooShort { min: usize, got: usize },
    #[error("Order expiry must be positive")]
    NonPositiveExpiry,
    #[error("Order backdate cannot be negative")]
    NegativeBackdate,
}

/// CSR 中的識別項與訂單識別項的比對方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentifierMatch {
    /// CSR 必須恰好包含訂單的所有識別項。
    #[default]
    Exact,
    /// CSR 的識別項只需是訂單識別項的子集合。
    Subset,
}

/// 訂單生命週期管理所使用的參數。
#[derive(Debug, Clone)]
pub struct OrderOptions {
    /// 訂單本身的有效期限，與證書的有效期間無關。
    pub order_expiry: Duration,
    /// 客戶端未指定 notBefore 時往前回溯的時間，用於吸收時鐘誤差。
    pub backdate: Duration,
    /// 授權 token 的長度。
    pub token_length: usize,
    pub identifier_match: IdentifierMatch,
}

impl OrderOptions {
    /// 預設的訂單有效期限（24 小時）。
    pub const DEFAULT_ORDER_EXPIRY_HOURS: i64 = 24;
    /// 預設的 notBefore 回溯時間（1 分鐘）。
    pub const DEFAULT_BACKDATE_MINUTES: i64 = 1;
    /// 授權 token 的最小與預設長度。
    pub const MIN_TOKEN_LENGTH: usize = 32;

    pub fn builder() -> OrderOptionsBuilder {
        OrderOptionsBuilder::new()
    }
}

impl Default for OrderOptions {
    fn default() -> Self {
        Self {
            order_expiry: Duration::hours(Self::DEFAULT_ORDER_EXPIRY_HOURS),
            backdate: Duration::minutes(Self::DEFAULT_BACKDATE_MINUTES),
            token_length: Self::MIN_TOKEN_LENGTH,
            identifier_match: IdentifierMatch::Exact,
        }
    }
}

/// 用於構建 [`OrderOptions`] 的構造器。
pub struct OrderOptionsBuilder {
    options: OrderOptions,
}

impl OrderOptionsBuilder {
    /// 以預設值建立構造器：
    /// - 訂單期限：24 小時
    /// - 回溯時間：1 分鐘
    /// - token 長度：32
    /// - CSR 比對：完全相符
    pub fn new() -> Self {
        Self {
            options: OrderOptions::default(),
        }
    }

    pub fn order_expiry(mut self, expiry: Duration) -> Self {
        self.options.order_expiry = expiry;
        self
    }

    pub fn backdate(mut self, backdate: Duration) -> Self {
        self.options.backdate = backdate;
        self
    }

    pub fn token_length(mut self, len: usize) -> Self {
        self.options.token_length = len;
        self
    }

    pub fn identifier_match(mut self, mode: IdentifierMatch) -> Self {
        self.options.identifier_match = mode;
        self
    }

    /// 檢查設定後回傳 [`OrderOptions`]。
    ///
    /// # Errors
    ///
    /// token 長度小於 32、訂單期限非正值或回溯時間為負時回傳 [`ConfigError`]。
    pub fn build(self) -> Result<OrderOptions, ConfigError> {
        let o = self.options;
        if o.token_length < OrderOptions::MIN_TOKEN_LENGTH {
            return Err(ConfigError::TokenTooShort {
                min: OrderOptions::MIN_TOKEN_LENGTH,
                got: o.token_length,
            });
        }
        if o.order_expiry <= Duration::zero() {
            return Err(ConfigError::NonPositiveExpiry);
        }
        if o.backdate < Duration::zero() {
            return Err(ConfigError::NegativeBackdate);
        }
        Ok(o)
    }
}

impl Default for OrderOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
