//! 訂單生命週期的對外操作：建立、查詢、最終確認訂單，以及查詢授權。
//!
//! 每個操作都接收已驗證身分的帳戶 ID 與 provisioner，以及原始的 JSON payload，
//! 回傳帶有 HTTP 狀態碼與 `Location` 標頭的 [`AcmeResponse`]。傳輸層與路由不在此處理。

use chrono::{DateTime, Utc};
use reqwest::{
    header::{HeaderMap, HeaderValue, LOCATION},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    authority::Authority,
    authorization::{new_authorization, Authorization},
    clock::ClockT,
    config::OrderOptions,
    csr::FinalizeRequest,
    db::AcmeDb,
    error::{AcmeError, ErrorKind, Problem, Result},
    guard,
    identifier::{validate_identifiers, Identifier},
    linker::{LinkType, Linker},
    order::{Order, OrderStatus},
    provisioner::Provisioner,
};

/// 各操作共用的協作者。
#[derive(Clone, Copy)]
pub struct AcmeContext<'a> {
    pub db: &'a dyn AcmeDb,
    pub linker: &'a dyn Linker,
    pub authority: &'a dyn Authority,
    pub clock: &'a dyn ClockT,
    pub options: &'a OrderOptions,
}

/// 建立訂單請求的內容。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderRequest {
    pub identifiers: Vec<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

impl NewOrderRequest {
    /// 驗證識別項，以及 notAfter 不得早於 notBefore。
    pub fn validate(&self) -> Result<()> {
        validate_identifiers(&self.identifiers)?;
        if let (Some(not_before), Some(not_after)) = (self.not_before, self.not_after) {
            if not_after < not_before {
                return Err(AcmeError::malformed(format!(
                    "notAfter ({}) is before notBefore ({})",
                    not_after, not_before
                )));
            }
        }
        Ok(())
    }
}

/// 操作結果：狀態碼、標頭與回應內容。
#[derive(Debug)]
pub struct AcmeResponse<T> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: T,
}

impl<T: Serialize> AcmeResponse<T> {
    fn with_location(status: StatusCode, location: &str, body: T) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(location)
            .map_err(|e| AcmeError::internal(e, "invalid Location header"))?;
        headers.insert(LOCATION, value);
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// `Location` 標頭的內容。
    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.body)
            .map_err(|e| AcmeError::internal(e, "error serializing response"))
    }
}

/// 將錯誤轉為問題文件回應。內部錯誤的細節只寫入日誌。
pub fn error_response(err: &AcmeError) -> AcmeResponse<Problem> {
    match err.kind() {
        ErrorKind::ServerInternal => error!(error = %err, "internal error"),
        _ => debug!(error = %err, status = %err.status(), "request rejected"),
    }
    AcmeResponse {
        status: err.status(),
        headers: HeaderMap::new(),
        body: err.problem(),
    }
}

/// 建立新訂單。
///
/// 成功時回傳 201 與 `Location`。識別項驗證失敗時不會寫入任何資料。
/// 客戶端未指定 notBefore 時以目前時間往前回溯；未指定 notAfter 時以
/// notBefore 加上 provisioner 的預設有效期間計算。
pub fn new_order(
    ctx: &AcmeContext<'_>,
    account_id: &str,
    provisioner: &dyn Provisioner,
    payload: &[u8],
) -> Result<AcmeResponse<Order>> {
    let request: NewOrderRequest = serde_json::from_slice(payload).map_err(|e| {
        AcmeError::wrap(
            ErrorKind::Malformed,
            e,
            "failed to unmarshal new-order request payload",
        )
    })?;
    request.validate()?;

    let now = ctx.clock.now();
    let expires_at = now + ctx.options.order_expiry;

    let authorization_ids = request
        .identifiers
        .iter()
        .map(|identifier| {
            new_authorization(
                ctx.db,
                account_id,
                identifier,
                expires_at,
                ctx.options.token_length,
            )
            .map(|az| az.id)
        })
        .collect::<Result<Vec<_>>>()?;

    let not_before = match request.not_before {
        Some(not_before) => not_before,
        None => now - ctx.options.backdate,
    };
    let not_after = match request.not_after {
        Some(not_after) => not_after,
        None => not_before + provisioner.default_tls_cert_duration(),
    };

    let mut order = Order {
        id: String::new(),
        account_id: account_id.to_owned(),
        provisioner_id: provisioner.id().to_owned(),
        status: OrderStatus::Pending,
        identifiers: request.identifiers,
        authorization_ids,
        not_before,
        not_after,
        expires_at,
        certificate_id: None,
        error: None,
        authorizations: Vec::new(),
        finalize: String::new(),
        certificate: None,
    };
    ctx.db
        .create_order(&mut order)
        .map_err(|e| AcmeError::internal(e, "error creating order"))?;

    info!(
        order_id = %order.id,
        account_id,
        provisioner_id = %order.provisioner_id,
        identifiers = order.identifiers.len(),
        "order created"
    );

    ctx.linker.link_order(&mut order);
    let location = ctx.linker.get_link(LinkType::Order, &order.id);
    AcmeResponse::with_location(StatusCode::CREATED, &location, order)
}

/// 取得訂單並重新計算其狀態。
pub fn get_order(
    ctx: &AcmeContext<'_>,
    account_id: &str,
    provisioner: &dyn Provisioner,
    order_id: &str,
) -> Result<AcmeResponse<Order>> {
    let mut order = fetch_order(ctx.db, account_id, order_id)?;
    guard::check_order_owner(account_id, provisioner.id(), &order)?;
    order.update_status(ctx.db, ctx.clock.now())?;

    ctx.linker.link_order(&mut order);
    let location = ctx.linker.get_link(LinkType::Order, &order.id);
    AcmeResponse::with_location(StatusCode::OK, &location, order)
}

/// 以 CSR 最終確認訂單。
///
/// CSR 在查詢訂單之前驗證，格式錯誤的 CSR 不會觸及訂單狀態。
pub fn finalize_order(
    ctx: &AcmeContext<'_>,
    account_id: &str,
    provisioner: &dyn Provisioner,
    order_id: &str,
    payload: &[u8],
) -> Result<AcmeResponse<Order>> {
    let request: FinalizeRequest = serde_json::from_slice(payload).map_err(|e| {
        AcmeError::wrap(
            ErrorKind::Malformed,
            e,
            "failed to unmarshal finalize-order request payload",
        )
    })?;
    let csr = request.validate()?;

    let mut order = fetch_order(ctx.db, account_id, order_id)?;
    guard::check_order_owner(account_id, provisioner.id(), &order)?;
    order.finalize(
        ctx.db,
        &csr,
        ctx.authority,
        provisioner,
        ctx.options,
        ctx.clock.now(),
    )?;

    ctx.linker.link_order(&mut order);
    let location = ctx.linker.get_link(LinkType::Order, &order.id);
    AcmeResponse::with_location(StatusCode::OK, &location, order)
}

/// 取得授權並重新計算其狀態。
pub fn get_authorization(
    ctx: &AcmeContext<'_>,
    account_id: &str,
    authz_id: &str,
) -> Result<AcmeResponse<Authorization>> {
    let mut az = ctx.db.get_authorization(authz_id).map_err(|e| {
        if e.is_not_found() {
            warn!(authz_id, account_id, "authorization not found");
            AcmeError::wrap(
                ErrorKind::Unauthorized,
                e,
                format!("account '{}' does not own authorization '{}'", account_id, authz_id),
            )
        } else {
            AcmeError::internal(e, "error retrieving authorization")
        }
    })?;
    guard::check_authorization_owner(account_id, &az)?;
    az.update_status(ctx.db, ctx.clock.now())?;

    ctx.linker.link_authorization(&mut az);
    let location = ctx.linker.get_link(LinkType::Authorization, &az.id);
    AcmeResponse::with_location(StatusCode::OK, &location, az)
}

/// 取得訂單。不存在的訂單與他人的訂單回傳相同的 401。
fn fetch_order(db: &dyn AcmeDb, account_id: &str, order_id: &str) -> Result<Order> {
    db.get_order(order_id).map_err(|e| {
        if e.is_not_found() {
            warn!(order_id, account_id, "order not found");
            AcmeError::wrap(
                ErrorKind::Unauthorized,
                e,
                format!("account '{}' does not own order '{}'", account_id, order_id),
            )
        } else {
            AcmeError::internal(e, "error retrieving order")
        }
    })
}
