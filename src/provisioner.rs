use chrono::Duration;

/// provisioner 的唯讀政策介面。
pub trait Provisioner: Send + Sync {
    /// provisioner 的唯一識別碼。
    fn id(&self) -> &str;

    /// 客戶端未指定 notAfter 時使用的證書有效期間。
    fn default_tls_cert_duration(&self) -> Duration;
}

/// ACME provisioner 的基本實作。
#[derive(Debug, Clone)]
pub struct AcmeProvisioner {
    id: String,
    pub name: String,
    default_duration: Duration,
}

impl AcmeProvisioner {
    /// 預設的證書有效期間（24 小時）。
    pub const DEFAULT_TLS_CERT_DURATION_HOURS: i64 = 24;

    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            default_duration: Duration::hours(Self::DEFAULT_TLS_CERT_DURATION_HOURS),
        }
    }

    pub fn default_duration(mut self, duration: Duration) -> Self {
        self.default_duration = duration;
        self
    }
}

impl Provisioner for AcmeProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn default_tls_cert_duration(&self) -> Duration {
        self.default_duration
    }
}
