use anyhow::Context as _;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_JWKS_REFRESH: Duration = Duration::from_secs(600);

/// RS256 JWT validator backed by an issuer's JWKS.
#[derive(Clone)]
pub struct OidcValidator {
    inner: Arc<Inner>,
}

struct Inner {
    issuer: String,
    audiences: Vec<String>,
    jwks_uri: String,
    leeway_secs: u64,
    refresh_after: Duration,
    http: reqwest::Client,
    jwks: RwLock<JwksCache>,
}

#[derive(Clone, Default)]
struct JwksCache {
    next_refresh_after: Option<Instant>,
    last_refresh_attempt: Option<Instant>,
    keys_by_kid: HashMap<String, DecodingKey>,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audiences: Vec<String>,
    pub jwks_uri: String,
    pub leeway_secs: u64,
}

impl std::fmt::Debug for OidcValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcValidator")
            .field("issuer", &self.inner.issuer)
            .field("jwks_uri", &self.inner.jwks_uri)
            .finish_non_exhaustive()
    }
}

impl OidcValidator {
    /// Build a validator for `issuer`, discovering the JWKS URI unless one is given.
    ///
    /// # Errors
    ///
    /// Fails when discovery fails or returns a non-https JWKS URI.
    pub async fn discover(
        http: reqwest::Client,
        issuer: &str,
        audiences: Vec<String>,
        jwks_uri: Option<String>,
        leeway_secs: u64,
    ) -> anyhow::Result<Self> {
        let issuer = issuer.trim().to_string();
        let jwks_uri = match jwks_uri.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            Some(v) => {
                if !v.starts_with("https://") {
                    tracing::warn!(
                        jwks_uri = %v,
                        "jwks_uri is not https; this should only be used for local development"
                    );
                }
                v
            }
            None => discover_jwks_uri(&http, &issuer).await?,
        };

        Ok(Self::new(
            http,
            OidcConfig {
                issuer,
                audiences,
                jwks_uri,
                leeway_secs,
            },
        ))
    }

    #[must_use]
    pub fn new(http: reqwest::Client, cfg: OidcConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuer: cfg.issuer,
                audiences: cfg.audiences,
                jwks_uri: cfg.jwks_uri,
                leeway_secs: cfg.leeway_secs,
                refresh_after: DEFAULT_JWKS_REFRESH,
                http,
                jwks: RwLock::new(JwksCache::default()),
            }),
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.inner.issuer
    }

    /// Validate a JWT and return its claims as JSON.
    ///
    /// # Errors
    ///
    /// Fails for malformed tokens, unsupported algorithms or `crit` headers, unknown key ids and
    /// any signature or claim check failure.
    pub async fn validate(&self, jwt: &str) -> anyhow::Result<serde_json::Value> {
        let header = jsonwebtoken::decode_header(jwt).context("decode jwt header")?;
        // `jsonwebtoken::Header` doesn't expose `crit`.
        if jwt_has_crit_header(jwt)? {
            anyhow::bail!("unsupported jwt crit header");
        }
        if header.alg != Algorithm::RS256 {
            anyhow::bail!("unsupported jwt alg (expected RS256)");
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("missing jwt kid"))?;

        if let Some(key) = self.get_key_if_present(kid).await
            && let Ok(claims) = self.decode_with_key(jwt, &key)
        {
            return Ok(claims);
        }

        self.refresh_jwks_if_needed(Some(kid)).await?;

        let key = self
            .get_key_if_present(kid)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown jwt kid"))?;

        self.decode_with_key(jwt, &key)
    }

    fn decode_with_key(&self, jwt: &str, key: &DecodingKey) -> anyhow::Result<serde_json::Value> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.inner.leeway_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;

        validation.set_issuer(&[self.inner.issuer.as_str()]);
        if !self.inner.audiences.is_empty() {
            let aud: Vec<&str> = self.inner.audiences.iter().map(String::as_str).collect();
            validation.set_audience(&aud);
        }

        let data = jsonwebtoken::decode::<serde_json::Value>(jwt, key, &validation)
            .context("decode jwt")?;
        Ok(data.claims)
    }

    async fn get_key_if_present(&self, kid: &str) -> Option<DecodingKey> {
        let cache = self.inner.jwks.read().await;
        cache.keys_by_kid.get(kid).cloned()
    }

    async fn refresh_jwks_if_needed(&self, maybe_kid: Option<&str>) -> anyhow::Result<()> {
        let now = Instant::now();
        let needs_refresh = |cache: &JwksCache| {
            let stale = cache.next_refresh_after.is_none_or(|t| now >= t);
            let missing = maybe_kid.is_some_and(|kid| !cache.keys_by_kid.contains_key(kid));
            stale || missing
        };

        if !needs_refresh(&*self.inner.jwks.read().await) {
            return Ok(());
        }

        let mut cache = self.inner.jwks.write().await;
        if !needs_refresh(&cache) {
            return Ok(());
        }

        // Random kids must not turn into a refresh loop.
        if let Some(last) = cache.last_refresh_attempt
            && now.duration_since(last) < MIN_REFRESH_INTERVAL
        {
            return Ok(());
        }
        cache.last_refresh_attempt = Some(now);

        let (keys_by_kid, cache_ttl) = fetch_jwks(&self.inner.http, &self.inner.jwks_uri).await?;
        tracing::debug!(keys = keys_by_kid.len(), jwks_uri = %self.inner.jwks_uri, "Refreshed JWKS");
        cache.keys_by_kid = keys_by_kid;
        cache.next_refresh_after = Some(now + cache_ttl.unwrap_or(self.inner.refresh_after));

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

async fn discover_jwks_uri(http: &reqwest::Client, issuer: &str) -> anyhow::Result<String> {
    let issuer = issuer.trim_end_matches('/');
    let url = format!("{issuer}/.well-known/openid-configuration");
    let resp = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET discovery {url}"))?
        .error_for_status()
        .with_context(|| format!("discovery status {url}"))?;
    let doc: OidcDiscovery = resp.json().await.context("parse discovery json")?;
    if doc.jwks_uri.trim().is_empty() {
        anyhow::bail!("discovery returned empty jwks_uri");
    }
    let parsed = reqwest::Url::parse(&doc.jwks_uri).context("parse discovered jwks_uri")?;
    if parsed.scheme() != "https" {
        anyhow::bail!("discovery returned non-https jwks_uri; set jwks_uri explicitly to override");
    }
    Ok(doc.jwks_uri)
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(rename = "use", default)]
    use_: Option<String>,
    // base64url RSA public key params
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

async fn fetch_jwks(
    http: &reqwest::Client,
    jwks_uri: &str,
) -> anyhow::Result<(HashMap<String, DecodingKey>, Option<Duration>)> {
    let resp = http
        .get(jwks_uri)
        .send()
        .await
        .with_context(|| format!("GET jwks {jwks_uri}"))?
        .error_for_status()
        .with_context(|| format!("jwks status {jwks_uri}"))?;

    let cache_ttl = parse_cache_control_max_age(resp.headers());
    let jwks: JwksResponse = resp.json().await.context("parse jwks json")?;

    let mut out: HashMap<String, DecodingKey> = HashMap::new();
    for k in jwks.keys {
        if k.kty != "RSA" {
            continue;
        }
        if let Some(use_) = &k.use_
            && use_ != "sig"
        {
            continue;
        }
        let Some(kid) = k.kid else { continue };
        let Some(n) = k.n else { continue };
        let Some(e) = k.e else { continue };

        let key = DecodingKey::from_rsa_components(&n, &e).context("build rsa decoding key")?;
        out.insert(kid, key);
    }

    if out.is_empty() {
        anyhow::bail!("jwks contains no usable RSA keys");
    }

    Ok((out, cache_ttl))
}

fn parse_cache_control_max_age(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let v = headers.get(reqwest::header::CACHE_CONTROL)?.to_str().ok()?;
    v.split(',')
        .map(str::trim)
        .filter_map(|part| part.strip_prefix("max-age="))
        .find_map(|rest| rest.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn jwt_has_crit_header(jwt: &str) -> anyhow::Result<bool> {
    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        anyhow::bail!("invalid jwt (expected 3 parts, got {})", parts.len());
    }

    let header_json = URL_SAFE_NO_PAD
        .decode(parts[0])
        .context("base64url decode jwt header")?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_json).context("parse jwt header json")?;

    let header = header
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("invalid jwt header (expected JSON object)"))?;
    Ok(header.contains_key("crit"))
}
