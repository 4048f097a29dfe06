use std::fmt;

use crate::{authorization::Authorization, order::Order};

/// 可產生連結的資源類型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Order,
    Authorization,
    Challenge,
    Finalize,
    Certificate,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Order => "order",
            Self::Authorization => "authz",
            Self::Challenge => "challenge",
            Self::Finalize => "finalize",
            Self::Certificate => "certificate",
        };
        f.write_str(name)
    }
}

/// 產生對外 URL 的介面。
///
/// 只需實作 [`Linker::get_link`]；填入訂單與授權連結欄位的方法皆透過它完成。
pub trait Linker: Send + Sync {
    fn get_link(&self, link_type: LinkType, id: &str) -> String;

    /// 填入訂單的 authorizations、finalize 與 certificate 連結。
    fn link_order(&self, order: &mut Order) {
        order.authorizations = order
            .authorization_ids
            .iter()
            .map(|id| self.get_link(LinkType::Authorization, id))
            .collect();
        order.finalize = self.get_link(LinkType::Finalize, &order.id);
        order.certificate = order
            .certificate_id
            .as_deref()
            .map(|id| self.get_link(LinkType::Certificate, id));
    }

    /// 填入授權底下每個挑戰的連結。
    fn link_authorization(&self, az: &mut Authorization) {
        for ch in &mut az.challenges {
            ch.url = self.get_link(LinkType::Challenge, &ch.id);
        }
    }
}

/// 以固定前綴產生 `<base>/<type>/<id>` 形式連結的 [`Linker`]。
#[derive(Debug, Clone)]
pub struct PrefixLinker {
    base_url: String,
}

impl PrefixLinker {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

impl Linker for PrefixLinker {
    fn get_link(&self, link_type: LinkType, id: &str) -> String {
        match link_type {
            LinkType::Finalize => format!("{}/order/{}/finalize", self.base_url, id),
            other => format!("{}/{}/{}", self.base_url, other, id),
        }
    }
}
