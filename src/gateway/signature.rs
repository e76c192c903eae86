//! Cache/dedup key construction
//!
//! Signatures have the shape `{METHOD}:{URL}` with an optional
//! `?{sortedQueryString}` suffix. Query parameters are sorted by key so
//! argument order never causes a cache miss.

use crate::error::AppError;
use url::form_urlencoded;
use url::Url;

/// Signature of the call that refreshes the session token
pub const TOKEN_REFRESH: &str = "token-refresh";

/// Signature of the call that fetches the current user's profile
pub const USER_PROFILE: &str = "user-profile";

/// Build a signature from a method and absolute URL. Query parameters already
/// present on the URL are merged with `params` before sorting.
pub fn signature<K, V>(method: &str, url: &str, params: &[(K, V)]) -> Result<String, AppError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let method = method.trim();
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::ValidationError(format!(
            "Invalid HTTP method: {:?}",
            method
        )));
    }

    let mut parsed = Url::parse(url)
        .map_err(|e| AppError::ValidationError(format!("Invalid URL {:?}: {}", url, e)))?;

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.extend(
        params
            .iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string())),
    );
    // Stable: repeated keys keep their relative order
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    parsed.set_query(None);
    parsed.set_fragment(None);

    let mut sig = format!("{}:{}", method.to_ascii_uppercase(), parsed.as_str());
    if !pairs.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish();
        sig.push('?');
        sig.push_str(&query);
    }

    Ok(sig)
}

/// `GET` signature with no extra parameters
pub fn get_signature(url: &str) -> Result<String, AppError> {
    signature::<&str, &str>("GET", url, &[])
}
