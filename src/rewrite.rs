//! Fake-quality rewriting: serve a lower quality under the URI the client
//! asked for, preserving the cache's content-addressed naming.

use std::sync::Arc;

use crate::chunk::{ChunkRequest, TitleQuality};
use crate::metadata::TitleStore;

pub struct QualityRewriter {
    titles: Arc<TitleStore>,
}

impl QualityRewriter {
    pub fn new(titles: Arc<TitleStore>) -> Self {
        Self { titles }
    }

    /// Rewrites `uri` down to `target`. Best effort: any metadata trouble
    /// returns the original URI untouched, the request must never fail here.
    pub async fn rewrite(&self, req: &ChunkRequest<'_>, uri: &str, target: TitleQuality) -> String {
        let requested = match req.quality() {
            Some(quality) => quality,
            None => return uri.to_string(),
        };
        if requested <= target {
            return uri.to_string();
        }

        // Legacy chunks share one hash across qualities, so swapping the
        // folder segment is the whole rewrite. Playlists still need the
        // hash replaced even in legacy naming.
        if req.is_legacy_format() && !req.is_playlist() {
            log::info!(
                "legacy format rewrite {} -> {} for {uri}",
                req.quality_folder(),
                target
            );
            return swap_quality_folder(uri, req.quality_folder(), target);
        }

        let serie = match self.titles.resolve(req.title_id(), req.serie_id()).await {
            Ok(serie) => serie,
            Err(err) => {
                log::warn!("could not rewrite quality for the request: {err}");
                return uri.to_string();
            }
        };

        let old_hash = match req.content_hash() {
            Some(hash) => hash,
            None => return uri.to_string(),
        };
        let new_hash = match serie.hash_for(target) {
            Some(hash) => hash,
            None => {
                log::warn!(
                    "title {} serie {} has no {target} hash, keeping the uri",
                    req.title_id(),
                    req.serie_id()
                );
                return uri.to_string();
            }
        };

        log::debug!("quality rewrite {old_hash} -> {new_hash} for {uri}");
        swap_quality_folder(uri, req.quality_folder(), target).replace(old_hash, new_hash)
    }
}

fn swap_quality_folder(uri: &str, old_folder: &str, target: TitleQuality) -> String {
    uri.replace(
        &format!("/{old_folder}/"),
        &format!("/{}/", target.folder()),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::UpstreamApi;
    use crate::metadata::TitleClient;

    fn rewriter() -> QualityRewriter {
        // points nowhere; tests below never reach the api
        let cfg = UpstreamApi {
            base_url: "http://127.0.0.1:1".to_string(),
            ..UpstreamApi::default()
        };
        QualityRewriter::new(Arc::new(TitleStore::new(
            TitleClient::new(&cfg),
            Duration::from_secs(60),
        )))
    }

    #[tokio::test]
    async fn at_or_below_target_is_untouched() {
        let rewriter = rewriter();
        let uri = "/videos/media/ts/9277/13/720/abc_00028.ts";
        let req = ChunkRequest::parse(uri);
        assert_eq!(rewriter.rewrite(&req, uri, TitleQuality::Hd).await, uri);
        assert_eq!(rewriter.rewrite(&req, uri, TitleQuality::Fhd).await, uri);
    }

    #[tokio::test]
    async fn legacy_chunk_swaps_folder_only() {
        let rewriter = rewriter();
        let uri = "/videos/media/ts/9277/13/1080/fff00042.ts";
        let req = ChunkRequest::parse(uri);
        assert_eq!(
            rewriter.rewrite(&req, uri, TitleQuality::Hd).await,
            "/videos/media/ts/9277/13/720/fff00042.ts"
        );
    }

    #[tokio::test]
    async fn metadata_failure_keeps_uri() {
        let rewriter = rewriter();
        let uri = "/videos/media/ts/9277/13/1080/abc_00028.ts";
        let req = ChunkRequest::parse(uri);
        // the store cannot reach its api, so the rewrite degrades to a no-op
        assert_eq!(rewriter.rewrite(&req, uri, TitleQuality::Hd).await, uri);
    }
}
