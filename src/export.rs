//! Export pass orchestration.
//!
//! Drives one pass over a [`RecordSource`]: render, shard, index, schedule
//! resource copies, and finally assemble the manifest. Every writer is
//! closed on every exit path. A pass that fails or is aborted leaves the
//! shards it already finalized on disk but never writes a manifest, so the
//! bundle is visibly incomplete.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bundle::BundleLayout;
use crate::config::Config;
use crate::error::{ExportError, Result};
use crate::id_index::IdIndexWriter;
use crate::manifest::{Manifest, ManifestAssembler};
use crate::models::ChatInfo;
use crate::progress::{ExportProgress, ExportProgressEvent, NoProgress};
use crate::render::{HtmlRenderer, Render};
use crate::resources::{DirResourceStore, ResourceScheduler, ResourceStore};
use crate::shard::{ShardEntry, ShardMeta, ShardRotator};
use crate::source::RecordSource;

/// Cooperative cancellation flag, checked before every record.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Exporter {
    config: Config,
    renderer: Box<dyn Render>,
    store: Arc<dyn ResourceStore>,
    progress: Box<dyn ExportProgress>,
    abort: AbortSignal,
}

/// Writers owned by one pass.
struct Sinks {
    rotator: ShardRotator,
    index: IdIndexWriter,
    scheduler: ResourceScheduler,
}

impl Sinks {
    /// Close everything without finalizing, then let copies settle.
    async fn close_on_error(&mut self) {
        self.rotator.close_on_error().await;
        self.index.close_on_error().await;
        let stats = self.scheduler.drain().await;
        tracing::debug!(copied = stats.copied, faults = stats.faults, "drained resource copies");
    }
}

impl Exporter {
    /// An exporter with the HTML renderer, a directory resource store over
    /// `config.resources.roots`, and no progress output.
    pub fn new(config: Config) -> Self {
        let store = DirResourceStore::new(
            config.resources.roots.clone(),
            config.resource_cache_ttl(),
        );
        Self {
            config,
            renderer: Box::new(HtmlRenderer),
            store: Arc::new(store),
            progress: Box::new(NoProgress),
            abort: AbortSignal::new(),
        }
    }

    pub fn with_renderer(mut self, renderer: impl Render + 'static) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ExportProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Export every record of `source` into a bundle at `out_dir`.
    ///
    /// The configuration is validated before anything touches the disk.
    pub async fn run<S>(
        &self,
        source: &mut S,
        out_dir: &Path,
        chat: ChatInfo,
        force: bool,
    ) -> Result<Manifest>
    where
        S: RecordSource + ?Sized,
    {
        self.config.validate().map_err(ExportError::Config)?;

        let layout = BundleLayout::new(out_dir);
        layout.prepare(force).await?;

        let bloom = self.config.bloom_params();
        let rotator = ShardRotator::new(
            layout.clone(),
            self.config.shard_limits(),
            bloom,
            self.config.writer.batch_bytes,
        );
        let index = IdIndexWriter::open(
            &layout,
            self.config.index.bucket_count,
            self.config.writer.index_batch_bytes,
        )
        .await?;
        let mut assembler =
            ManifestAssembler::new(chat, rotator.limits(), bloom, index.bucket_count())
                .with_filter(self.config.filter.clone());
        let mut sinks = Sinks {
            rotator,
            index,
            scheduler: ResourceScheduler::new(
                Arc::clone(&self.store),
                layout.root(),
                self.config.resources.concurrency,
            ),
        };

        tracing::info!(
            source = source.label(),
            out = %layout.root().display(),
            buckets = sinks.index.bucket_count(),
            copy_concurrency = sinks.scheduler.concurrency(),
            "export started"
        );

        if let Err(e) = self.pass(source, &mut sinks, &mut assembler).await {
            sinks.close_on_error().await;
            match &e {
                ExportError::Aborted => tracing::warn!(
                    records = assembler.records(),
                    finalized_shards = assembler.shard_count(),
                    "export aborted; no manifest written"
                ),
                other => tracing::error!(error = %other, "export failed; no manifest written"),
            }
            return Err(e);
        }

        if let Err(e) = self.finalize_sinks(&mut sinks, &mut assembler).await {
            sinks.close_on_error().await;
            tracing::error!(error = %e, "export failed while finalizing; no manifest written");
            return Err(e);
        }

        let resources = sinks.scheduler.drain().await;
        let manifest = assembler.finish(resources);
        manifest.write(&layout).await?;

        let stats = &manifest.stats;
        tracing::info!(
            records = stats.records,
            filtered_out = stats.filtered_out,
            shards = stats.shard_count,
            indexed_ids = stats.indexed_ids,
            bytes = stats.total_bytes,
            resources_copied = stats.resources.copied,
            resource_faults = stats.faults.resource_faults,
            oversized_text = stats.faults.oversized_text_records,
            malformed_ids = stats.faults.malformed_identifiers,
            "export complete"
        );
        self.progress.report(ExportProgressEvent::Finished {
            records: stats.records,
            shards: stats.shard_count,
        });
        Ok(manifest)
    }

    async fn pass<S>(
        &self,
        source: &mut S,
        sinks: &mut Sinks,
        assembler: &mut ManifestAssembler,
    ) -> Result<()>
    where
        S: RecordSource + ?Sized,
    {
        let copy_resources = self.config.resources.enabled;
        let filter = &self.config.filter;
        loop {
            if self.abort.is_aborted() {
                return Err(ExportError::Aborted);
            }
            if let Some(max) = filter.max_count {
                if assembler.records() >= max {
                    tracing::info!(max_count = max, "record limit reached; rest of source not read");
                    break;
                }
            }
            let Some(record) = source.next_record().await? else {
                break;
            };
            if !filter.admits(record.timestamp) {
                assembler.filtered_out();
                continue;
            }

            let html = self.renderer.render(&record);
            let plain_text = record.plain_text();
            let id = record.usable_id();

            let appended = sinks
                .rotator
                .append(ShardEntry {
                    id,
                    timestamp: record.timestamp,
                    sender_id: &record.sender_id,
                    sender_name: &record.sender_name,
                    html: &html,
                    plain_text: &plain_text,
                })
                .await?;
            assembler.record(&record.sender_id, &record.sender_name, record.timestamp);
            for meta in appended.finalized {
                self.shard_finalized(assembler, meta);
            }

            if appended.text_truncated {
                assembler.oversized_text();
                tracing::debug!(id = ?id, "text index truncated for long record");
            }

            match id {
                Some(id) => {
                    sinks.index.append(id, appended.shard_id).await?;
                    assembler.id_indexed();
                }
                None => {
                    assembler.malformed_identifier();
                    tracing::debug!(
                        shard = appended.shard_id,
                        timestamp = record.timestamp,
                        "record has no usable id; not indexed"
                    );
                }
            }

            for resource in record.resource_refs() {
                if copy_resources {
                    sinks.scheduler.schedule(resource.into()).await;
                } else {
                    sinks.scheduler.note_reference();
                }
            }

            self.progress.report(ExportProgressEvent::Record {
                processed: assembler.records(),
                shard_id: appended.shard_id,
            });
        }
        Ok(())
    }

    async fn finalize_sinks(
        &self,
        sinks: &mut Sinks,
        assembler: &mut ManifestAssembler,
    ) -> Result<()> {
        if let Some(meta) = sinks.rotator.finish().await? {
            self.shard_finalized(assembler, meta);
        }
        sinks.index.close().await
    }

    fn shard_finalized(&self, assembler: &mut ManifestAssembler, meta: ShardMeta) {
        self.progress.report(ExportProgressEvent::ShardFinalized {
            shard_id: meta.shard_id,
            record_count: meta.record_count,
            byte_size: meta.byte_size,
        });
        assembler.add_shard(meta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_signal_is_shared_between_clones() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_aborted());
        clone.abort();
        assert!(signal.is_aborted());
    }
}
