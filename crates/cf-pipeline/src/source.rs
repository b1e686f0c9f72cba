//! Source staging.
//!
//! A source is either an external reference that still needs resolving or a
//! URL in the durable store. Staging turns the former into the latter exactly
//! once; already-staged sources pass through without any external call.

use cf_core::{Result, SourceRef};

use crate::context::EngineContext;

/// Resolve and stage `source` into durable storage.
///
/// Returns the source unchanged when it is already staged. Otherwise the
/// reference is resolved through the rate-limited resolver, downloaded to a
/// scratch area, published, and returned as [`SourceRef::Staged`]. The local
/// copy is removed before this returns.
pub async fn stage_source(ctx: &EngineContext, source: &SourceRef) -> Result<SourceRef> {
    let reference = match source {
        SourceRef::Staged(_) => return Ok(source.clone()),
        SourceRef::External(reference) => reference,
    };

    let url = ctx.resolver.resolve(reference).await?;
    let area = ctx.scratch.area("source")?;
    let local = area.file("source", &url_extension(&url, "mp4"));
    ctx.store.stage(&url, &local).await?;
    let durable = ctx.store.publish(&local).await?;

    tracing::info!(reference = %reference, url = %durable, "Staged source");
    Ok(SourceRef::Staged(durable))
}

/// File extension of the last path segment of `url`, or `default`.
pub(crate) fn url_extension(url: &str, default: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => default.to_string(),
    }
}
