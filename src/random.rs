use openssl::{error::ErrorStack, rand::rand_bytes};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// 小於此值的位元組才會被採用，避免取模造成的分布偏差（62 * 4 = 248）。
const REJECTION_LIMIT: u8 = (ALPHANUMERIC.len() * 4) as u8;

/// 產生指定長度、由 OpenSSL CSPRNG 取樣的英數字串。
pub fn alphanumeric(len: usize) -> Result<String, ErrorStack> {
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        rand_bytes(&mut buf)?;
        for &b in buf.iter().filter(|&&b| b < REJECTION_LIMIT) {
            if out.len() == len {
                break;
            }
            out.push(ALPHANUMERIC[(b as usize) % ALPHANUMERIC.len()] as char);
        }
    }
    Ok(out)
}
