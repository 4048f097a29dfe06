use std::{
    collections::BTreeSet,
    net::IpAddr,
    result,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use openssl::{
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    prelude::FromDer,
};

use crate::{
    config::IdentifierMatch,
    error::{AcmeError, ErrorKind, Result},
    identifier::{Identifier, IdentifierType},
};

/// 用於描述建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("No SAN entries")]
    NoSanEntries,
}

/// CSR 建構器，用於產生包含主體替代名稱 (SAN) 擴展的證書簽名請求。
///
/// # 範例
///
/// ```
/// # use openssl::{ec::{EcGroup, EcKey}, nid::Nid, pkey::PKey};
/// # use racme_server::csr::CSR;
/// let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
/// let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
/// let csr = CSR::new()
///     .set_san("example.com")
///     .set_ip("192.0.2.1")
///     .build(&key)
///     .expect("CSR 建立失敗");
/// ```
#[derive(Debug, Default)]
pub struct CSR {
    common_name: Option<String>,
    dns_entries: Vec<String>,
    ip_entries: Vec<String>,
}

impl CSR {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定主體的 Common Name。
    pub fn common_name(mut self, cn: &str) -> Self {
        self.common_name = Some(cn.to_string());
        self
    }

    /// 新增一個 DNS 主體替代名稱。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        self.dns_entries.push(dns_name.to_string());
        self
    }

    /// 新增一個 IP 主體替代名稱。
    pub fn set_ip(mut self, ip: &str) -> Self {
        self.ip_entries.push(ip.to_string());
        self
    }

    /// 以目前的 SAN 項目建立 CSR，並用指定私鑰簽署。
    ///
    /// # 錯誤
    ///
    /// * 未設定任何 SAN 時回傳 `CsrError::NoSanEntries`
    /// * OpenSSL 失敗時回傳 `CsrError::OpensslError`
    pub fn build(self, key: &PKey<Private>) -> result::Result<X509Req, CsrError> {
        if self.dns_entries.is_empty() && self.ip_entries.is_empty() {
            return Err(CsrError::NoSanEntries);
        }

        let mut req_builder = X509Req::builder()?;

        if let Some(cn) = &self.common_name {
            let mut name = X509NameBuilder::new()?;
            name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
            req_builder.set_subject_name(&name.build())?;
        }

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.dns_entries {
            san_builder.dns(entry);
        }
        for entry in &self.ip_entries {
            san_builder.ip(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(key)?;
        req_builder.sign(key, MessageDigest::sha256())?;

        Ok(req_builder.build())
    }
}

/// 已解碼且通過自簽章驗證的證書簽名請求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    der: Vec<u8>,
    common_name: Option<String>,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
}

impl CertificateRequest {
    /// 解析 DER 格式的 CSR，讀出主體名稱與 SAN，並驗證自簽章。
    ///
    /// 只接受 DNS 與 IP 類型的 SAN。解析失敗與簽章不符皆為格式錯誤。
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let req = X509Req::from_der(der)
            .map_err(|e| AcmeError::wrap(ErrorKind::Malformed, e, "unable to parse csr"))?;
        let (rest, parsed) = X509CertificationRequest::from_der(der).map_err(|e| {
            AcmeError::wrap(ErrorKind::Malformed, e.to_string(), "unable to parse csr")
        })?;
        if !rest.is_empty() {
            return Err(AcmeError::malformed("unable to parse csr: trailing data"));
        }

        let verified = req
            .public_key()
            .and_then(|key| req.verify(&key))
            .map_err(|e| AcmeError::wrap(ErrorKind::Malformed, e, "csr failed signature check"))?;
        if !verified {
            return Err(AcmeError::malformed("csr failed signature check"));
        }

        let common_name = parsed
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Some(extensions) = parsed.requested_extensions() {
            for ext in extensions {
                let ParsedExtension::SubjectAlternativeName(san) = ext else {
                    continue;
                };
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(value) => dns_names.push((*value).to_owned()),
                        GeneralName::IPAddress(bytes) => ip_addresses.push(ip_from_bytes(bytes)?),
                        other => {
                            return Err(AcmeError::new(
                                ErrorKind::BadCsr,
                                format!("unsupported subject alternative name: {:?}", other),
                            ))
                        }
                    }
                }
            }
        }

        Ok(Self {
            der: der.to_vec(),
            common_name,
            dns_names,
            ip_addresses,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn ip_addresses(&self) -> &[IpAddr] {
        &self.ip_addresses
    }

    /// 正規化後的 DNS 名稱與 IP 位址：名稱轉小寫，Common Name 若未出現在 SAN 中則加入。
    fn canonical_names(&self) -> (BTreeSet<String>, BTreeSet<IpAddr>) {
        let mut names: BTreeSet<String> =
            self.dns_names.iter().map(|n| n.to_ascii_lowercase()).collect();
        let mut ips: BTreeSet<IpAddr> = self.ip_addresses.iter().copied().collect();
        if let Some(cn) = self.common_name.as_deref().filter(|cn| !cn.is_empty()) {
            match cn.parse::<IpAddr>() {
                Ok(ip) => {
                    ips.insert(ip);
                }
                Err(_) => {
                    names.insert(cn.to_ascii_lowercase());
                }
            }
        }
        (names, ips)
    }

    /// 檢查 CSR 的識別項是否與訂單已授權的識別項相符。
    ///
    /// 不相符時回傳 [`ErrorKind::BadCsr`]，屬於客戶端錯誤。
    pub fn check_identifiers(
        &self,
        authorized: &[Identifier],
        mode: IdentifierMatch,
    ) -> Result<()> {
        let (csr_names, csr_ips) = self.canonical_names();
        if csr_names.is_empty() && csr_ips.is_empty() {
            return Err(AcmeError::new(
                ErrorKind::BadCsr,
                "csr does not contain any identifiers",
            ));
        }

        let order_names: BTreeSet<String> = authorized
            .iter()
            .filter(|id| id.type_ == IdentifierType::Dns)
            .map(|id| id.value.to_ascii_lowercase())
            .collect();
        let order_ips: BTreeSet<IpAddr> = authorized
            .iter()
            .filter(|id| id.type_ == IdentifierType::Ip)
            .filter_map(|id| id.value.parse().ok())
            .collect();

        let matches = match mode {
            IdentifierMatch::Exact => csr_names == order_names && csr_ips == order_ips,
            IdentifierMatch::Subset => {
                csr_names.is_subset(&order_names) && csr_ips.is_subset(&order_ips)
            }
        };
        if !matches {
            return Err(AcmeError::new(
                ErrorKind::BadCsr,
                format!(
                    "csr identifiers {:?} {:?} do not match order identifiers {:?} {:?}",
                    csr_names, csr_ips, order_names, order_ips
                ),
            ));
        }
        Ok(())
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::from(v4));
    }
    if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::from(v6));
    }
    Err(AcmeError::malformed(format!(
        "invalid IP address length in csr: {}",
        bytes.len()
    )))
}

/// 最終化訂單請求的內容。
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeRequest {
    /// base64url（無填充）編碼的 DER CSR
    pub csr: String,
}

impl FinalizeRequest {
    /// 以 DER CSR 建立請求內容。
    pub fn new(der: &[u8]) -> Self {
        Self {
            csr: URL_SAFE_NO_PAD.encode(der),
        }
    }

    /// 解碼並驗證 CSR。
    ///
    /// # 錯誤
    ///
    /// base64url 解碼失敗、DER 解析失敗或簽章驗證失敗時回傳 [`ErrorKind::Malformed`]。
    pub fn validate(&self) -> Result<CertificateRequest> {
        let der = URL_SAFE_NO_PAD
            .decode(&self.csr)
            .map_err(|e| AcmeError::wrap(ErrorKind::Malformed, e, "error base64url decoding csr"))?;
        CertificateRequest::from_der(&der)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::Engine as _;
    use openssl::ec::{EcGroup, EcKey};

    pub(crate) fn test_key() -> PKey<Private> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
    }

    /// 以另一把金鑰簽署的 CSR：內嵌公鑰與簽章不符。
    pub(crate) fn mismatched_csr_der(dns: &str) -> Vec<u8> {
        let embedded = test_key();
        let signer = test_key();
        let mut builder = X509Req::builder().unwrap();
        let mut san = SubjectAlternativeName::new();
        san.dns(dns);
        let ext = san.build(&builder.x509v3_context(None)).unwrap();
        let mut stack = Stack::new().unwrap();
        stack.push(ext).unwrap();
        builder.add_extensions(&stack).unwrap();
        builder.set_pubkey(&embedded).unwrap();
        builder.sign(&signer, MessageDigest::sha256()).unwrap();
        builder.build().to_der().unwrap()
    }

    #[test]
    fn test_build_requires_san() {
        assert!(matches!(
            CSR::new().common_name("example.com").build(&test_key()),
            Err(CsrError::NoSanEntries)
        ));
    }

    #[test]
    fn test_validate_good_csr() {
        let der = CSR::new()
            .common_name("Example.com")
            .set_san("www.example.com")
            .set_ip("192.0.2.1")
            .build(&test_key())
            .unwrap()
            .to_der()
            .unwrap();
        let csr = FinalizeRequest::new(&der).validate().unwrap();

        assert_eq!(csr.common_name(), Some("Example.com"));
        assert_eq!(csr.dns_names(), ["www.example.com".to_string()]);
        assert_eq!(csr.ip_addresses(), ["192.0.2.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(csr.der(), der.as_slice());
        // CN 併入 DNS 名稱並轉為小寫
        let authorized = [
            Identifier::dns("example.com"),
            Identifier::dns("www.example.com"),
            Identifier::ip("192.0.2.1"),
        ];
        csr.check_identifiers(&authorized, IdentifierMatch::Exact).unwrap();
    }

    #[test]
    fn test_validate_bad_base64() {
        let err = FinalizeRequest { csr: "not*base64".into() }
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(err.detail(), "error base64url decoding csr");
    }

    #[test]
    fn test_validate_padded_base64_rejected() {
        let der = CSR::new()
            .set_san("example.com")
            .build(&test_key())
            .unwrap()
            .to_der()
            .unwrap();
        let padded = base64::engine::general_purpose::URL_SAFE.encode(&der);
        if padded.ends_with('=') {
            let err = FinalizeRequest { csr: padded }.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Malformed);
        }
    }

    #[test]
    fn test_validate_garbage_der() {
        let err = FinalizeRequest::new(b"definitely not a csr")
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(err.detail(), "unable to parse csr");
    }

    #[test]
    fn test_validate_signature_mismatch() {
        let err = FinalizeRequest::new(&mismatched_csr_der("example.com"))
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(err.detail(), "csr failed signature check");
    }

    #[test]
    fn test_check_identifiers_exact() {
        let der = CSR::new()
            .set_san("*.example.com")
            .set_san("EXAMPLE.com")
            .build(&test_key())
            .unwrap()
            .to_der()
            .unwrap();
        let csr = CertificateRequest::from_der(&der).unwrap();
        let order = [Identifier::dns("example.com"), Identifier::dns("*.example.com")];

        assert!(csr.check_identifiers(&order, IdentifierMatch::Exact).is_ok());

        let err = csr
            .check_identifiers(&order[..1], IdentifierMatch::Exact)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadCsr);
        assert_eq!(err.status().as_u16(), 400);
    }

    #[test]
    fn test_check_identifiers_subset() {
        let der = CSR::new()
            .set_san("a.example.com")
            .build(&test_key())
            .unwrap()
            .to_der()
            .unwrap();
        let csr = CertificateRequest::from_der(&der).unwrap();
        let order = [Identifier::dns("a.example.com"), Identifier::dns("b.example.com")];

        assert!(csr.check_identifiers(&order, IdentifierMatch::Subset).is_ok());
        assert!(csr.check_identifiers(&order, IdentifierMatch::Exact).is_err());
        assert!(csr
            .check_identifiers(&[Identifier::dns("b.example.com")], IdentifierMatch::Subset)
            .is_err());
    }

    #[test]
    fn test_check_identifiers_ip() {
        let der = CSR::new()
            .set_ip("2001:db8::1")
            .build(&test_key())
            .unwrap()
            .to_der()
            .unwrap();
        let csr = CertificateRequest::from_der(&der).unwrap();

        assert!(csr
            .check_identifiers(&[Identifier::ip("2001:0db8::0001")], IdentifierMatch::Exact)
            .is_ok());
        assert!(csr
            .check_identifiers(&[Identifier::dns("2001:db8::1")], IdentifierMatch::Exact)
            .is_err());
    }
}
