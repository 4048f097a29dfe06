//! 資源擁有權檢查。

use tracing::warn;

use crate::{
    authorization::Authorization,
    error::{AcmeError, Result},
    order::Order,
};

/// 確認訂單屬於指定帳戶，且由指定的 provisioner 建立。
pub fn check_order_owner(account_id: &str, provisioner_id: &str, order: &Order) -> Result<()> {
    if order.account_id != account_id {
        warn!(account_id, order_id = %order.id, "order requested by another account");
        return Err(AcmeError::unauthorized(format!(
            "account '{}' does not own order '{}'",
            account_id, order.id
        )));
    }
    if order.provisioner_id != provisioner_id {
        warn!(provisioner_id, order_id = %order.id, "order requested through another provisioner");
        return Err(AcmeError::unauthorized(format!(
            "provisioner '{}' does not own order '{}'",
            provisioner_id, order.id
        )));
    }
    Ok(())
}

/// 確認授權屬於指定帳戶。
pub fn check_authorization_owner(account_id: &str, az: &Authorization) -> Result<()> {
    if az.account_id != account_id {
        warn!(account_id, authz_id = %az.id, "authorization requested by another account");
        return Err(AcmeError::unauthorized(format!(
            "account '{}' does not own authorization '{}'",
            account_id, az.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authorization::AuthorizationStatus,
        error::ErrorKind,
        identifier::Identifier,
        order::OrderStatus,
    };
    use chrono::{Duration, Utc};

    fn order() -> Order {
        let now = Utc::now();
        Order {
            id: "o1".into(),
            account_id: "acct-1".into(),
            provisioner_id: "prov-1".into(),
            status: OrderStatus::Pending,
            identifiers: vec![Identifier::dns("example.com")],
            authorization_ids: vec!["a1".into()],
            not_before: now,
            not_after: now + Duration::hours(24),
            expires_at: now + Duration::hours(24),
            certificate_id: None,
            error: None,
            authorizations: Vec::new(),
            finalize: String::new(),
            certificate: None,
        }
    }

    #[test]
    fn test_order_owner() {
        let order = order();
        assert!(check_order_owner("acct-1", "prov-1", &order).is_ok());

        let err = check_order_owner("acct-2", "prov-1", &order).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.detail(), "account 'acct-2' does not own order 'o1'");

        let err = check_order_owner("acct-1", "prov-2", &order).unwrap_err();
        assert_eq!(err.detail(), "provisioner 'prov-2' does not own order 'o1'");
        assert_eq!(err.status().as_u16(), 401);
    }

    #[test]
    fn test_authorization_owner() {
        let az = Authorization {
            id: "a1".into(),
            account_id: "acct-1".into(),
            identifier: Identifier::dns("example.com"),
            wildcard: false,
            status: AuthorizationStatus::Pending,
            token: "tok".into(),
            challenges: Vec::new(),
            expires_at: Utc::now(),
            error: None,
        };
        assert!(check_authorization_owner("acct-1", &az).is_ok());
        assert_eq!(
            check_authorization_owner("acct-9", &az).unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
    }
}
