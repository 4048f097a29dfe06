//! # ACME Order Lifecycle Library
//!
//! 本庫實作 ACME 伺服器端（RFC 8555）的訂單、授權與挑戰生命週期，主要涵蓋：
//!
//! - **api**: 建立訂單、查詢訂單、以 CSR 最終確認訂單，以及查詢授權。
//! - **order** / **authorization**: 依據挑戰結果與時間延遲計算狀態，並以條件式更新寫回。
//! - **csr**: 解碼並驗證 CSR，比對 CSR 與訂單的識別項。
//! - **db** / **storage**: 以鍵值儲存保存紀錄，支援記憶體與單一檔案兩種實作。
//!
//! ## 特性
//!
//! - 萬用字元識別項只提供 dns-01 挑戰，IP 識別項提供 http-01 與 tls-alpn-01
//! - 同一訂單的多個最終確認請求只會簽發一次證書
//! - 過期判斷透過可注入的時鐘，不需要背景工作
//! - 內部錯誤的細節只寫入日誌，不回傳給客戶端
//!
//! ## 使用方式
//!
//! 呼叫端提供資料庫、連結產生器、簽發者與時鐘，組成 [`api::AcmeContext`]，
//! 再以已驗證的帳戶 ID、provisioner 與請求內容呼叫各個操作：
//!
//! ```rust
//! use racme_server::{
//!     api::{self, AcmeContext},
//!     authority::{Authority, AuthorityError, SignOptions},
//!     clock::SystemClock,
//!     config::OrderOptions,
//!     csr::CertificateRequest,
//!     db::KvDb,
//!     linker::PrefixLinker,
//!     provisioner::AcmeProvisioner,
//!     storage::MemStorage,
//! };
//!
//! struct NoopAuthority;
//!
//! impl Authority for NoopAuthority {
//!     fn sign(&self, _: &CertificateRequest, _: &SignOptions) -> Result<String, AuthorityError> {
//!         Ok("cert-1".into())
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = KvDb::new(MemStorage::new());
//!     let linker = PrefixLinker::new("https://ca.example/acme/my-acme");
//!     let options = OrderOptions::builder().build()?;
//!     let ctx = AcmeContext {
//!         db: &db,
//!         linker: &linker,
//!         authority: &NoopAuthority,
//!         clock: &SystemClock,
//!         options: &options,
//!     };
//!     let provisioner = AcmeProvisioner::new("prov-1", "my-acme");
//!
//!     let payload = br#"{"identifiers":[{"type":"dns","value":"example.com"}]}"#;
//!     let resp = api::new_order(&ctx, "acct-1", &provisioner, payload)?;
//!     assert_eq!(resp.status.as_u16(), 201);
//!     println!("{}", resp.to_json()?);
//!
//!     Ok(())
//! }
//! ```
//!
//! 更多詳細 API 說明請參考各個模組的文檔。

pub mod api;
pub mod authority;
pub mod authorization;
pub mod challenge;
pub mod clock;
pub mod config;
pub mod csr;
pub mod db;
pub mod error;
pub mod guard;
pub mod identifier;
pub mod linker;
pub mod order;
pub mod provisioner;
pub mod random;
pub mod storage;
