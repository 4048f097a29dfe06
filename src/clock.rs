use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

/// 定義取得目前時間的行為。過期判斷全部透過此介面取得時間。
pub trait ClockT: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 使用系統時間的實作。
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockT for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 可手動設定的時鐘，通常用於測試環境中模擬時間經過。
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl MockClock {
    /// 建立一個固定在指定時間的 `MockClock`。
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    /// 將時間往後推移指定長度。
    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl ClockT for MockClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
