use std::{
    collections::HashMap,
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};

use thiserror::Error;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Key already exists: {0}")]
    AlreadyExists(String),
    #[error("Lock poisoned")]
    LockPoisoned,
    #[error("File is corrupted")]
    CorruptedFile,
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 鍵值儲存需實作的 API。
///
/// 每筆紀錄的建立與更新都必須是原子操作：`insert` 只在 key 不存在時成功，
/// `compare_and_swap` 只在目前內容與預期相同時寫入。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 的內容。
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// 建立新紀錄，key 已存在時回傳 [`StorageError::AlreadyExists`]。
    fn insert(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 目前內容等於 `expected` 時寫入 `value` 並回傳 `true`，否則不寫入並回傳 `false`。
    fn compare_and_swap(&self, key: &str, expected: &[u8], value: &[u8]) -> Result<bool>;
}

/// 私有工具，提供 key 驗證。
struct KeyUtils;

impl KeyUtils {
    /// 檢查 key 格式：非空、不含控制字元、不以 `/` 開頭或結尾、不含空白或相對路徑片段。
    fn verify(key: &str) -> Result<&str> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("Empty key".to_string()));
        }
        if key.contains('\0') || key.contains('\n') || key.contains('\r') {
            return Err(StorageError::InvalidKey(format!(
                "Invalid characters in key: {}",
                key
            )));
        }
        if key.starts_with('/') || key.ends_with('/') {
            return Err(StorageError::InvalidKey(format!(
                "Key cannot start or end with '/': {}",
                key
            )));
        }
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StorageError::InvalidKey(format!(
                    "Invalid path segment in key: {}",
                    key
                )));
            }
        }
        Ok(key)
    }
}

/// 基於記憶體的儲存實作。
#[derive(Debug, Default)]
pub struct MemStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 目前儲存的鍵數量。
    pub fn len(&self) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Storage for MemStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let key = KeyUtils::verify(key)?;
        self.entries
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = KeyUtils::verify(key)?;
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        if entries.contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn compare_and_swap(&self, key: &str, expected: &[u8], value: &[u8]) -> Result<bool> {
        let key = KeyUtils::verify(key)?;
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        match entries.get_mut(key) {
            Some(current) if current.as_slice() == expected => {
                *current = value.to_vec();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }
}

/// 基於單一檔案的儲存實作。
///
/// 每次寫入都在檔尾追加一筆紀錄，開啟時重播所有紀錄建立記憶體索引，
/// 後寫入者覆蓋先寫入者。若存在被覆蓋的舊紀錄，開啟時會重寫檔案以壓縮空間。
#[derive(Debug)]
pub struct FileStorage {
    inner: Mutex<FileInner>,
}

#[derive(Debug)]
struct FileInner {
    file: File,
    entries: HashMap<String, Vec<u8>>,
}

/// 紀錄標頭長度：key 長度（u32）與 value 長度（u32）。
const RECORD_HEADER_LEN: usize = 8;

impl FileStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = Self::open_file(path, false)?;
        let (entries, record_count, valid_len) = Self::replay(&file)?;

        // 丟棄寫到一半的尾端紀錄
        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
        }

        if record_count > entries.len() {
            file = Self::compact(path, &entries)?;
        }

        Ok(Self {
            inner: Mutex::new(FileInner { file, entries }),
        })
    }

    fn open_file(path: &Path, truncate: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true).create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        Ok(options.open(path)?)
    }

    /// 重播檔案內容，回傳索引、紀錄總數以及最後一筆完整紀錄的結尾位置。
    fn replay(file: &File) -> Result<(HashMap<String, Vec<u8>>, usize, u64)> {
        let mut reader = BufReader::new(file);
        let mut entries = HashMap::new();
        let mut count = 0usize;
        let mut offset = 0u64;

        loop {
            let mut header = [0u8; RECORD_HEADER_LEN];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let (key_len, value_len) = Self::parse_header(&header);

            let mut key_buf = vec![0u8; key_len];
            let mut value = vec![0u8; value_len];
            match reader
                .read_exact(&mut key_buf)
                .and_then(|_| reader.read_exact(&mut value))
            {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let key = String::from_utf8(key_buf).map_err(|_| StorageError::CorruptedFile)?;

            entries.insert(key, value);
            count += 1;
            offset += (RECORD_HEADER_LEN + key_len + value_len) as u64;
        }

        Ok((entries, count, offset))
    }

    /// 只保留每個 key 的最新內容，寫入暫存檔後取代原檔。
    fn compact(path: &Path, entries: &HashMap<String, Vec<u8>>) -> Result<File> {
        let temp_path = {
            let mut temp = PathBuf::from(path);
            temp.set_extension("temp");
            temp
        };
        {
            let mut temp_file = Self::open_file(&temp_path, true)?;
            for (key, value) in entries {
                Self::append_record(&mut temp_file, key, value)?;
            }
            temp_file.sync_all()?;
        }
        std::fs::rename(&temp_path, path)?;
        Self::open_file(path, false)
    }

    fn parse_header(header: &[u8; RECORD_HEADER_LEN]) -> (usize, usize) {
        let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let value_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        (key_len as usize, value_len as usize)
    }

    fn encode_record(key: &str, value: &[u8]) -> Vec<u8> {
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + key.len() + value.len());
        record.extend_from_slice(&(key.len() as u32).to_le_bytes());
        record.extend_from_slice(&(value.len() as u32).to_le_bytes());
        record.extend_from_slice(key.as_bytes());
        record.extend_from_slice(value);
        record
    }

    fn append_record(file: &mut File, key: &str, value: &[u8]) -> Result<()> {
        let record = Self::encode_record(key, value);
        Self::append_with(file, &record, |file, buf| {
            file.write_all(buf)?;
            file.sync_data()
        })
    }

    /// 以 `write` 追加一筆紀錄。寫入失敗時把檔案截回寫入前的長度，
    /// 避免殘缺的紀錄留在日誌中間，使後續紀錄無法重播。
    fn append_with<W>(file: &mut File, record: &[u8], write: W) -> Result<()>
    where
        W: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        let start = file.metadata()?.len();
        if let Err(e) = write(file, record) {
            file.set_len(start)?;
            return Err(e.into());
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let key = KeyUtils::verify(key)?;
        let inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        inner
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = KeyUtils::verify(key)?;
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        if inner.entries.contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        Self::append_record(&mut inner.file, key, value)?;
        inner.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn compare_and_swap(&self, key: &str, expected: &[u8], value: &[u8]) -> Result<bool> {
        let key = KeyUtils::verify(key)?;
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        match inner.entries.get(key) {
            Some(current) if current.as_slice() == expected => {}
            Some(_) => return Ok(false),
            None => return Err(StorageError::NotFound(key.to_string())),
        }
        Self::append_record(&mut inner.file, key, value)?;
        inner.entries.insert(key.to_string(), value.to_vec());
        Ok(true)
    }
}
