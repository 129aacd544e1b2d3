//! WBI request signing for Bilibili's `wbi`-gated endpoints.
//!
//! Disabled by default (the coordinator has not been observed to dispatch
//! `wbi` URLs) but fully implemented per spec.md §4.4 so it activates the
//! moment a `wbi` path is seen. Algorithm and mixin-key table are carried
//! over verbatim from the teacher's `danmaku_client.rs`.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;

const MIXIN_KEY_ENC_TAB: [u8; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

const NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";
const WBI_CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

struct CachedKeys {
    mixin_key: String,
    fetched_at: SystemTime,
}

static CACHE: RwLock<Option<CachedKeys>> = RwLock::new(None);

/// A URL needs WBI signing iff its path contains the literal `"wbi"`.
pub fn needs_wbi_signing(url: &str) -> bool {
    url.contains("wbi")
}

fn gen_mixin_key(raw_wbi_key: &str) -> String {
    let raw_bytes = raw_wbi_key.as_bytes();
    MIXIN_KEY_ENC_TAB
        .iter()
        .take(32)
        .map(|&n| raw_bytes[n as usize] as char)
        .collect()
}

fn url_encode(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC)
        .to_string()
        .replace('+', "%20")
}

fn calculate_w_rid(params: &BTreeMap<String, String>, mixin_key: &str) -> String {
    let encoded: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, url_encode(v)))
        .collect();
    let string_to_hash = format!("{}{}", encoded.join("&"), mixin_key);
    let mut hasher = Md5::new();
    hasher.update(string_to_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

async fn fetch_mixin_key(client: &reqwest::Client) -> anyhow::Result<String> {
    let resp: Value = client.get(NAV_URL).send().await?.json().await?;
    let wbi_img = resp["data"]["wbi_img"]
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("missing wbi_img in nav response"))?;
    let img_key = extract_key(wbi_img.get("img_url").and_then(Value::as_str))?;
    let sub_key = extract_key(wbi_img.get("sub_url").and_then(Value::as_str))?;
    Ok(gen_mixin_key(&format!("{img_key}{sub_key}")))
}

fn extract_key(url: Option<&str>) -> anyhow::Result<String> {
    url.and_then(|u| u.split('/').last())
        .and_then(|f| f.split('.').next())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("could not extract key from nav url"))
}

async fn mixin_key(client: &reqwest::Client) -> anyhow::Result<String> {
    if let Some(cached) = CACHE.read().unwrap().as_ref() {
        if cached.fetched_at.elapsed().unwrap_or(Duration::MAX) < WBI_CACHE_TTL {
            return Ok(cached.mixin_key.clone());
        }
    }

    let mixin_key = fetch_mixin_key(client).await?;
    *CACHE.write().unwrap() = Some(CachedKeys {
        mixin_key: mixin_key.clone(),
        fetched_at: SystemTime::now(),
    });
    Ok(mixin_key)
}

/// Rewrite `url`'s query string with a `wts` timestamp and a `w_rid`
/// signature, per §4.4. Only call when [`needs_wbi_signing`] is true.
pub async fn sign_url(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let mixin_key = mixin_key(client).await?;

    let (base, query) = url
        .split_once('?')
        .ok_or_else(|| anyhow::anyhow!("wbi url has no query string"))?;

    let wts = SystemTime::now()
        .duration_since(UNIX_EPOCH)?
        .as_secs()
        .to_string();

    let mut params: BTreeMap<String, String> = BTreeMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut it = pair.splitn(2, '=');
        let k = it.next().unwrap_or_default();
        let v = it.next().unwrap_or_default();
        params.insert(k.to_string(), v.to_string());
    }
    params.insert("wts".to_string(), wts);

    let w_rid = calculate_w_rid(&params, &mixin_key);

    let query_string: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{k}={}", url_encode(v)))
        .collect();

    Ok(format!("{base}?{}&w_rid={w_rid}", query_string.join("&")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_wbi_signing_checks_path_literal() {
        assert!(needs_wbi_signing(
            "https://api.bilibili.com/x/wbi/something?id=1"
        ));
        assert!(!needs_wbi_signing(
            "https://api.live.bilibili.com/xlive/web-room/v1/index/getDanmuInfo?id=1"
        ));
    }

    #[test]
    fn mixin_key_is_32_chars() {
        let key = gen_mixin_key("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef");
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn w_rid_is_deterministic() {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), "123".to_string());
        params.insert("wts".to_string(), "1700000000".to_string());
        let a = calculate_w_rid(&params, "mixin");
        let b = calculate_w_rid(&params, "mixin");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
