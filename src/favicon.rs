use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;

use crate::colors::dominant_color;
use crate::fetch::CancelToken;

const PRIMARY_PROVIDER: &str = "https://www.google.com/s2/favicons";
const SECONDARY_PROVIDER: &str = "https://icon.horse/icon";

/// Favicons are downscaled to this square before sampling.
pub const SAMPLE_SIZE: u32 = 32;

/// Where favicon images come from. Implementations list candidate URLs in
/// preference order and download raw image bytes.
#[async_trait]
pub trait FaviconSource: Send + Sync {
    fn candidate_urls(&self, domain: &str) -> Vec<String>;

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, String>;

    /// Domain → favicon color. Override to put a cache in front.
    async fn resolve(&self, domain: &str) -> Result<Favicon, String> {
        resolve_favicon(self, domain).await
    }
}

/// Outcome of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Favicon {
    pub url: String,
    pub color: String,
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

/// Google's favicon service with icon.horse as fallback. Successful lookups
/// are memoized for the lifetime of the value.
pub struct HttpFaviconSource {
    http: reqwest::Client,
    resolved: Mutex<HashMap<String, Favicon>>,
}

impl HttpFaviconSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, domain: &str) -> Option<Favicon> {
        self.resolved
            .lock()
            .ok()
            .and_then(|map| map.get(domain).cloned())
    }

    fn remember(&self, domain: &str, favicon: &Favicon) {
        if let Ok(mut map) = self.resolved.lock() {
            map.insert(domain.to_string(), favicon.clone());
        }
    }
}

#[async_trait]
impl FaviconSource for HttpFaviconSource {
    fn candidate_urls(&self, domain: &str) -> Vec<String> {
        vec![
            format!("{PRIMARY_PROVIDER}?domain={domain}&sz=64"),
            format!("{SECONDARY_PROVIDER}/{domain}"),
        ]
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, String> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("favicon request failed: {e}"))?;
        if !res.status().is_success() {
            return Err(format!("favicon HTTP {}", res.status()));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| format!("favicon body: {e}"))?;
        Ok(bytes.to_vec())
    }

    async fn resolve(&self, domain: &str) -> Result<Favicon, String> {
        if let Some(hit) = self.cached(domain) {
            return Ok(hit);
        }
        let favicon = resolve_favicon(self, domain).await?;
        self.remember(domain, &favicon);
        Ok(favicon)
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Decode an image and pick its dominant color at [`SAMPLE_SIZE`] resolution.
pub fn sample_image(bytes: &[u8]) -> Result<String, String> {
    let img = image::load_from_memory(bytes).map_err(|e| format!("favicon decode: {e}"))?;
    let small = img
        .resize_exact(SAMPLE_SIZE, SAMPLE_SIZE, image::imageops::FilterType::Triangle)
        .to_rgba8();
    dominant_color(small.as_raw()).ok_or_else(|| "No usable colors found".to_string())
}

/// Try each candidate URL in turn; the first one that yields a color wins.
pub async fn resolve_favicon<S>(source: &S, domain: &str) -> Result<Favicon, String>
where
    S: FaviconSource + ?Sized,
{
    let mut last_err = format!("no favicon provider for {domain}");
    for url in source.candidate_urls(domain) {
        let attempt = match source.fetch_image(&url).await {
            Ok(bytes) => sample_image(&bytes),
            Err(e) => Err(e),
        };
        match attempt {
            Ok(color) => return Ok(Favicon { url, color }),
            Err(e) => {
                log::debug!("favicon {url} unusable: {e}");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

// ---------------------------------------------------------------------------
// Enrichment pipeline
// ---------------------------------------------------------------------------

/// One settled lookup. Failures are reported so the consumer can log them;
/// they never stop the pipeline.
#[derive(Debug, Clone)]
pub struct EnrichmentEvent {
    pub domain: String,
    pub result: Result<Favicon, String>,
}

/// Resolve favicons for `domains` in batches of `concurrency`, sending each
/// result as soon as it settles. Stops early once `cancel` fires or the
/// receiver is gone.
pub async fn run_enrichment<S>(
    source: &S,
    domains: Vec<String>,
    concurrency: usize,
    cancel: CancelToken,
    events: mpsc::UnboundedSender<EnrichmentEvent>,
) where
    S: FaviconSource + ?Sized,
{
    let concurrency = concurrency.max(1);
    for batch in domains.chunks(concurrency) {
        if cancel.is_cancelled() {
            log::debug!("favicon enrichment cancelled");
            return;
        }

        let mut pending: FuturesUnordered<_> = batch
            .iter()
            .map(|domain| async move {
                let result = source.resolve(domain).await;
                EnrichmentEvent {
                    domain: domain.clone(),
                    result,
                }
            })
            .collect();

        while let Some(event) = pending.next().await {
            if cancel.is_cancelled() {
                return;
            }
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use super::*;

    /// Solid-color PNG of the given size.
    pub(crate) fn png(rgb: [u8; 3], size: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(size, size, image::Rgba([rgb[0], rgb[1], rgb[2], 255]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    /// Serves images from a map keyed by URL; everything else 404s.
    pub(crate) struct MapSource {
        pub images: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl FaviconSource for MapSource {
        fn candidate_urls(&self, domain: &str) -> Vec<String> {
            vec![format!("primary/{domain}"), format!("secondary/{domain}")]
        }

        async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, String> {
            self.images
                .get(url)
                .cloned()
                .ok_or_else(|| format!("404 {url}"))
        }
    }

    #[test]
    fn samples_solid_png() {
        let color = sample_image(&png([0x20, 0x60, 0xc0], 64)).expect("sample");
        assert_eq!(color, "#2060c0");
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(sample_image(b"not an image").is_err());
    }

    #[tokio::test]
    async fn falls_back_to_secondary_provider() {
        let mut images = HashMap::new();
        // primary serves an all-white icon, which has no usable color
        images.insert("primary/a.com".to_string(), png([255, 255, 255], 16));
        images.insert("secondary/a.com".to_string(), png([0xd0, 0x10, 0x10], 16));
        let source = MapSource { images };

        let favicon = resolve_favicon(&source, "a.com").await.expect("resolve");
        assert_eq!(favicon.url, "secondary/a.com");
        assert_eq!(favicon.color, "#d01010");

        assert!(resolve_favicon(&source, "missing.com").await.is_err());
    }

    #[tokio::test]
    async fn pipeline_isolates_failures() {
        let mut images = HashMap::new();
        images.insert("primary/ok.com".to_string(), png([0x10, 0x80, 0x40], 16));
        let source = MapSource { images };
        let (tx, mut rx) = mpsc::unbounded_channel();

        run_enrichment(
            &source,
            vec!["bad.com".into(), "ok.com".into(), "worse.com".into()],
            2,
            CancelToken::detached(),
            tx,
        )
        .await;

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events.len(), 3);
        let ok = events.iter().find(|e| e.domain == "ok.com").expect("ok.com settled");
        assert_eq!(ok.result.as_ref().map(|f| f.color.as_str()), Ok("#108040"));
        assert_eq!(events.iter().filter(|e| e.result.is_err()).count(), 2);
    }
}
