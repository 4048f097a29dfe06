use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
    authority::{Authority, SignOptions},
    authorization::AuthorizationStatus,
    config::OrderOptions,
    csr::CertificateRequest,
    db::AcmeDb,
    error::{AcmeError, ErrorKind, Problem, Result},
    identifier::Identifier,
    provisioner::Provisioner,
};

/// 訂單狀態，目前支援的狀態有 pending、ready、processing、valid 與 invalid。
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 表示一筆證書訂單。
///
/// `authorizations`、`finalize` 與 `certificate` 為對外連結，由
/// [`Linker`](crate::linker::Linker) 填入，不會寫入資料庫。
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub provisioner_id: String,
    /// 訂單當前狀態
    pub status: OrderStatus,
    /// 證書主題識別項，保留客戶端送出的順序
    pub identifiers: Vec<Identifier>,
    /// 與識別項一一對應的授權 ID
    pub authorization_ids: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// 訂單本身的過期時間
    #[serde(rename = "expires")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
    /// 授權 URL 列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorizations: Vec<String>,
    /// 最終確認 URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finalize: String,
    /// 憑證 URL（僅在有效時存在）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl Order {
    /// 回傳清除所有連結欄位的副本，用於寫入資料庫。
    pub fn without_links(&self) -> Self {
        Self {
            authorizations: Vec::new(),
            finalize: String::new(),
            certificate: None,
            ..self.clone()
        }
    }

    /// 依據目前時間與各授權狀態重新計算訂單狀態：
    ///
    /// * valid、invalid 與 processing 的訂單不會變動
    /// * 已過期的 ready 或 pending 訂單轉為 invalid
    /// * pending 訂單會先重新計算每個授權，任一授權失敗則轉為 invalid，
    ///   仍有授權待驗證則維持不變，全部有效則轉為 ready
    ///
    /// 狀態有變更時以條件式更新寫回；若已被其他請求搶先更新，
    /// 則改為讀取資料庫中的內容。
    pub fn update_status(&mut self, db: &dyn AcmeDb, now: DateTime<Utc>) -> Result<()> {
        let observed = self.status;
        match self.status {
            OrderStatus::Valid | OrderStatus::Invalid | OrderStatus::Processing => return Ok(()),
            OrderStatus::Ready => {
                if now <= self.expires_at {
                    return Ok(());
                }
                self.invalidate(Problem::new(ErrorKind::Malformed, "order has expired"));
            }
            OrderStatus::Pending => {
                if now > self.expires_at {
                    self.invalidate(Problem::new(ErrorKind::Malformed, "order has expired"));
                } else {
                    let (mut pending, mut invalid) = (0usize, 0usize);
                    for authz_id in &self.authorization_ids {
                        let mut az = db.get_authorization(authz_id).map_err(|e| {
                            let detail = format!("error retrieving authorization {}", authz_id);
                            AcmeError::internal(e, detail)
                        })?;
                        az.update_status(db, now)?;
                        match az.status {
                            AuthorizationStatus::Valid => {}
                            AuthorizationStatus::Pending => pending += 1,
                            _ => invalid += 1,
                        }
                    }

                    if invalid > 0 {
                        self.invalidate(Problem::new(
                            ErrorKind::Unauthorized,
                            "one or more authorizations were invalid",
                        ));
                    } else if pending > 0 {
                        return Ok(());
                    } else {
                        self.status = OrderStatus::Ready;
                    }
                }
            }
        }
        self.save(db, observed)
    }

    /// 以 CSR 最終確認訂單並簽發證書。
    ///
    /// 會先重新計算狀態。只有 ready 的訂單會進入簽發流程，且 ready 轉為
    /// processing 為條件式更新，確保同一訂單只會簽發一次；搶輸的請求回傳
    /// 勝出者寫入的狀態。已是 valid 或 processing 的訂單直接回傳目前狀態。
    ///
    /// # 錯誤
    ///
    /// * invalid 或 pending 的訂單回傳 [`ErrorKind::OrderNotReady`]
    /// * CSR 識別項不符回傳 [`ErrorKind::BadCsr`]，訂單狀態不變
    /// * 簽發失敗時訂單轉為 invalid 並回傳 [`ErrorKind::ServerInternal`]
    /// * 簽發成功但無法寫回時回傳 [`ErrorKind::ServerInternal`]，證書 ID
    ///   記錄在錯誤與日誌中，訂單停留在 processing
    pub fn finalize(
        &mut self,
        db: &dyn AcmeDb,
        csr: &CertificateRequest,
        authority: &dyn Authority,
        provisioner: &dyn Provisioner,
        options: &OrderOptions,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.update_status(db, now)?;

        match self.status {
            OrderStatus::Invalid => {
                return Err(AcmeError::new(
                    ErrorKind::OrderNotReady,
                    format!("order {} has been abandoned", self.id),
                ))
            }
            OrderStatus::Valid | OrderStatus::Processing => {
                debug!(order_id = %self.id, status = %self.status, "order already finalized");
                return Ok(());
            }
            OrderStatus::Pending => {
                return Err(AcmeError::new(
                    ErrorKind::OrderNotReady,
                    format!("order {} is not ready", self.id),
                ))
            }
            OrderStatus::Ready => {}
        }

        csr.check_identifiers(&self.identifiers, options.identifier_match)?;

        self.status = OrderStatus::Processing;
        match db.update_order(self, OrderStatus::Ready) {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(order_id = %self.id, "order was finalized by another request");
                return self.reload(db);
            }
            Err(e) => return Err(AcmeError::internal(e, "error updating order")),
        }

        let sign_options = SignOptions {
            identifiers: self.identifiers.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            provisioner_id: provisioner.id().to_owned(),
            default_duration: provisioner.default_tls_cert_duration(),
        };
        match authority.sign(csr, &sign_options) {
            Ok(certificate_id) => {
                self.certificate_id = Some(certificate_id.clone());
                self.status = OrderStatus::Valid;
                self.error = None;
                if let Err(e) = db.update_order(self, OrderStatus::Processing) {
                    error!(
                        order_id = %self.id,
                        certificate_id = %certificate_id,
                        error = %e,
                        "issued certificate could not be recorded"
                    );
                    return Err(AcmeError::internal(
                        e,
                        format!(
                            "error recording certificate {} for order {}",
                            certificate_id, self.id
                        ),
                    ));
                }
                info!(order_id = %self.id, certificate_id = %certificate_id, "certificate issued");
                Ok(())
            }
            Err(e) => {
                error!(order_id = %self.id, error = %e, "certificate signing failed");
                self.invalidate(Problem::new(
                    ErrorKind::ServerInternal,
                    "error signing certificate",
                ));
                if let Err(db_err) = db.update_order(self, OrderStatus::Processing) {
                    error!(
                        order_id = %self.id,
                        error = %db_err,
                        "failed order could not be recorded"
                    );
                    return Err(AcmeError::internal(db_err, "error updating order"));
                }
                Err(AcmeError::internal(e, "error signing certificate"))
            }
        }
    }

    fn invalidate(&mut self, problem: Problem) {
        self.status = OrderStatus::Invalid;
        self.error = Some(problem);
    }

    fn save(&mut self, db: &dyn AcmeDb, expected: OrderStatus) -> Result<()> {
        match db.update_order(self, expected) {
            Ok(()) => {
                info!(
                    order_id = %self.id,
                    from = %expected,
                    to = %self.status,
                    "order status updated"
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => self.reload(db),
            Err(e) => Err(AcmeError::internal(e, "error updating order")),
        }
    }

    fn reload(&mut self, db: &dyn AcmeDb) -> Result<()> {
        *self = db
            .get_order(&self.id)
            .map_err(|e| AcmeError::internal(e, "error retrieving order"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
    };

    use super::*;
    use crate::{
        authority::AuthorityError,
        authorization::{new_authorization, Authorization},
        csr::{tests::test_key, CSR},
        db::KvDb,
        provisioner::AcmeProvisioner,
        storage::{tests::FailingStorage, MemStorage},
    };
    use chrono::Duration;

    #[derive(Default)]
    struct CountingAuthority {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Authority for CountingAuthority {
        fn sign(
            &self,
            _csr: &CertificateRequest,
            _options: &SignOptions,
        ) -> std::result::Result<String, AuthorityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AuthorityError::Backend("HSM unavailable".into()))
            } else {
                Ok("cert-1".into())
            }
        }
    }

    fn csr_for(names: &[&str]) -> CertificateRequest {
        let der = names
            .iter()
            .fold(CSR::new(), |csr, name| csr.set_san(name))
            .build(&test_key())
            .unwrap()
            .to_der()
            .unwrap();
        CertificateRequest::from_der(&der).unwrap()
    }

    fn authorizations(db: &dyn AcmeDb, names: &[&str], now: DateTime<Utc>) -> Vec<Authorization> {
        let expires_at = now + Duration::hours(1);
        names
            .iter()
            .map(|name| {
                new_authorization(db, "acct-1", &Identifier::dns(name), expires_at, 32).unwrap()
            })
            .collect()
    }

    fn validate(db: &dyn AcmeDb, az: &Authorization) {
        let mut az = az.clone();
        az.status = AuthorizationStatus::Valid;
        db.update_authorization(&az, AuthorizationStatus::Pending).unwrap();
    }

    fn pending_order(
        db: &dyn AcmeDb,
        names: &[&str],
        azs: &[Authorization],
        now: DateTime<Utc>,
    ) -> Order {
        let mut order = Order {
            id: String::new(),
            account_id: "acct-1".into(),
            provisioner_id: "prov-1".into(),
            status: OrderStatus::Pending,
            identifiers: names.iter().map(|n| Identifier::dns(n)).collect(),
            authorization_ids: azs.iter().map(|az| az.id.clone()).collect(),
            not_before: now,
            not_after: now + Duration::hours(24),
            expires_at: now + Duration::hours(1),
            certificate_id: None,
            error: None,
            authorizations: Vec::new(),
            finalize: String::new(),
            certificate: None,
        };
        db.create_order(&mut order).unwrap();
        order
    }

    fn ready_order(db: &dyn AcmeDb, names: &[&str], now: DateTime<Utc>) -> Order {
        let azs = authorizations(db, names, now);
        azs.iter().for_each(|az| validate(db, az));
        let mut order = pending_order(db, names, &azs, now);
        order.update_status(db, now).unwrap();
        assert_eq!(order.status, OrderStatus::Ready);
        order
    }

    #[test]
    fn test_status_display() {
        assert_eq!(OrderStatus::Processing.to_string(), "processing");
        assert_eq!(
            serde_json::to_string(&OrderStatus::Ready).unwrap(),
            format!("\"{}\"", OrderStatus::Ready)
        );
    }

    #[test]
    fn test_update_status_waits_for_pending_authorizations() {
        let db = KvDb::new(MemStorage::new());
        let now = Utc::now();
        let names = ["a.example.com", "b.example.com"];
        let azs = authorizations(&db, &names, now);
        validate(&db, &azs[0]);
        let mut order = pending_order(&db, &names, &azs, now);

        order.update_status(&db, now).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        validate(&db, &azs[1]);
        order.update_status(&db, now).unwrap();
        assert_eq!(order.status, OrderStatus::Ready);
        assert_eq!(db.get_order(&order.id).unwrap().status, OrderStatus::Ready);
    }

    #[test]
    fn test_update_status_invalid_authorization() {
        let db = KvDb::new(MemStorage::new());
        let now = Utc::now();
        let names = ["a.example.com", "b.example.com"];
        let azs = authorizations(&db, &names, now);
        validate(&db, &azs[0]);
        let mut failed = azs[1].clone();
        failed.status = AuthorizationStatus::Invalid;
        db.update_authorization(&failed, AuthorizationStatus::Pending).unwrap();

        let mut order = pending_order(&db, &names, &azs, now);
        order.update_status(&db, now).unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);
        assert!(order.error.is_some());
    }

    #[test]
    fn test_update_status_expiry() {
        let db = KvDb::new(MemStorage::new());
        let now = Utc::now();
        let mut order = ready_order(&db, &["example.com"], now);

        order.update_status(&db, now + Duration::minutes(30)).unwrap();
        assert_eq!(order.status, OrderStatus::Ready);

        order.update_status(&db, now + Duration::hours(2)).unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);
        assert_eq!(order.error.as_ref().unwrap().detail, "order has expired");

        // 終止狀態不再變動
        order.update_status(&db, now + Duration::hours(3)).unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);
    }

    #[test]
    fn test_finalize_issues_certificate() {
        let db = KvDb::new(MemStorage::new());
        let now = Utc::now();
        let names = ["example.com", "www.example.com"];
        let mut order = ready_order(&db, &names, now);
        let authority = CountingAuthority::default();
        let provisioner = AcmeProvisioner::new("prov-1", "acme");
        let options = OrderOptions::default();

        order
            .finalize(&db, &csr_for(&names), &authority, &provisioner, &options, now)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Valid);
        assert_eq!(order.certificate_id.as_deref(), Some("cert-1"));

        // 再次最終確認不會重新簽發
        let mut again = db.get_order(&order.id).unwrap();
        again
            .finalize(&db, &csr_for(&names), &authority, &provisioner, &options, now)
            .unwrap();
        assert_eq!(again.status, OrderStatus::Valid);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalize_not_ready() {
        let db = KvDb::new(MemStorage::new());
        let now = Utc::now();
        let names = ["example.com"];
        let azs = authorizations(&db, &names, now);
        let mut order = pending_order(&db, &names, &azs, now);
        let authority = CountingAuthority::default();

        let err = order
            .finalize(
                &db,
                &csr_for(&names),
                &authority,
                &AcmeProvisioner::new("prov-1", "acme"),
                &OrderOptions::default(),
                now,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrderNotReady);
        assert_eq!(err.status().as_u16(), 403);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_finalize_csr_mismatch_keeps_status() {
        let db = KvDb::new(MemStorage::new());
        let now = Utc::now();
        let mut order = ready_order(&db, &["example.com"], now);
        let authority = CountingAuthority::default();

        let err = order
            .finalize(
                &db,
                &csr_for(&["example.com", "evil.example.net"]),
                &authority,
                &AcmeProvisioner::new("prov-1", "acme"),
                &OrderOptions::default(),
                now,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadCsr);
        assert_eq!(db.get_order(&order.id).unwrap().status, OrderStatus::Ready);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_finalize_signing_failure() {
        let db = KvDb::new(MemStorage::new());
        let now = Utc::now();
        let mut order = ready_order(&db, &["example.com"], now);
        let authority = CountingAuthority {
            fail: true,
            ..Default::default()
        };

        let err = order
            .finalize(
                &db,
                &csr_for(&["example.com"]),
                &authority,
                &AcmeProvisioner::new("prov-1", "acme"),
                &OrderOptions::default(),
                now,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerInternal);
        assert_eq!(err.detail(), "error signing certificate");

        let stored = db.get_order(&order.id).unwrap();
        assert_eq!(stored.status, OrderStatus::Invalid);
        assert!(stored.error.is_some());
        assert!(stored.certificate_id.is_none());
    }

    #[test]
    fn test_concurrent_finalize_issues_once() {
        let db = KvDb::new(MemStorage::new());
        let now = Utc::now();
        let names = ["example.com"];
        let order = ready_order(&db, &names, now);
        let authority = CountingAuthority::default();
        let provisioner = AcmeProvisioner::new("prov-1", "acme");
        let options = OrderOptions::default();
        let csr = csr_for(&names);
        let barrier = Barrier::new(2);
        let (db_ref, authority_ref, barrier_ref) = (&db, &authority, &barrier);
        let (provisioner_ref, options_ref, csr_ref) = (&provisioner, &options, &csr);
        let order_id = order.id.as_str();

        let results: Vec<Result<OrderStatus>> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(move || {
                        let mut mine = db_ref.get_order(order_id).unwrap();
                        barrier_ref.wait();
                        mine.finalize(
                            db_ref,
                            csr_ref,
                            authority_ref,
                            provisioner_ref,
                            options_ref,
                            now,
                        )
                        .map(|()| mine.status)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);
        for result in results {
            let status = result.unwrap();
            assert!(matches!(status, OrderStatus::Processing | OrderStatus::Valid));
        }
        let stored = db.get_order(&order.id).unwrap();
        assert_eq!(stored.status, OrderStatus::Valid);
        assert_eq!(stored.certificate_id.as_deref(), Some("cert-1"));
    }

    fn writes_status(value: &[u8], status: OrderStatus) -> bool {
        let needle = format!("\"status\":\"{}\"", status);
        value
            .windows(needle.len())
            .any(|window| window == needle.as_bytes())
    }

    #[test]
    fn test_finalize_unrecorded_certificate_keeps_id() {
        let db = KvDb::new(FailingStorage::fail_swap_when(|key, value| {
            key.starts_with("orders/") && writes_status(value, OrderStatus::Valid)
        }));
        let now = Utc::now();
        let mut order = ready_order(&db, &["example.com"], now);
        let authority = CountingAuthority::default();

        let err = order
            .finalize(
                &db,
                &csr_for(&["example.com"]),
                &authority,
                &AcmeProvisioner::new("prov-1", "acme"),
                &OrderOptions::default(),
                now,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerInternal);
        assert!(err.detail().contains("cert-1"));
        assert!(err.detail().contains(&order.id));
        assert!(!err.problem().detail.contains("cert-1"));
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);

        let stored = db.get_order(&order.id).unwrap();
        assert_eq!(stored.status, OrderStatus::Processing);
        assert!(stored.certificate_id.is_none());
    }

    #[test]
    fn test_finalize_processing_write_failure_skips_signing() {
        let db = KvDb::new(FailingStorage::fail_swap_when(|key, value| {
            key.starts_with("orders/") && writes_status(value, OrderStatus::Processing)
        }));
        let now = Utc::now();
        let mut order = ready_order(&db, &["example.com"], now);
        let authority = CountingAuthority::default();

        let err = order
            .finalize(
                &db,
                &csr_for(&["example.com"]),
                &authority,
                &AcmeProvisioner::new("prov-1", "acme"),
                &OrderOptions::default(),
                now,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerInternal);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
        assert_eq!(db.get_order(&order.id).unwrap().status, OrderStatus::Ready);
    }
}
